//! Tracked-position model: one entry per open ticker under management.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use super::order::TrancheKind;

/// A long position the engine is responsible for exiting.
///
/// Created by reconciliation (or an external position-opened notification),
/// mutated by the trailing-stop tracker and the order worker, destroyed when
/// quantity reaches zero or the brokerage stops reporting it.
#[derive(Debug, Clone)]
pub struct TrackedPosition {
    pub ticker: String,

    /// Live quantity; decremented on (partial) fills.
    pub quantity: i64,

    /// Quantity at entry, the base for tranche-percentage math.
    pub original_quantity: i64,

    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,

    /// Venue product type (e.g. "CNC").
    pub product: String,

    /// Maximum price observed since entry; the trailing-stop anchor.
    pub position_high: Decimal,

    /// Set while an exit order is queued or in flight.
    pub pending_since: Option<DateTime<Utc>>,

    /// When the last exit order completed; suppresses a fresh submission
    /// within the cool-down window.
    pub last_order_at: Option<DateTime<Utc>>,

    /// Which exit tranches have already fired for this position.
    pub tranches: TrancheLedger,

    /// One-shot flag for the time-boxed trend-violation check.
    pub trend_checked: bool,
}

impl TrackedPosition {
    pub fn new(
        ticker: String,
        quantity: i64,
        entry_price: Decimal,
        entry_time: DateTime<Utc>,
        product: String,
    ) -> Self {
        Self {
            ticker,
            quantity,
            original_quantity: quantity,
            entry_price,
            entry_time,
            product,
            position_high: entry_price,
            pending_since: None,
            last_order_at: None,
            tranches: TrancheLedger::default(),
            trend_checked: false,
        }
    }

    /// Fold a price tick into the position-high. Returns whether the high
    /// advanced.
    pub fn observe_price(&mut self, price: Decimal) -> bool {
        if price > self.position_high {
            self.position_high = price;
            true
        } else {
            false
        }
    }

    /// Unrealized return from entry, in percent.
    pub fn pnl_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * Decimal::from(100)
    }

    /// Whether a new exit must be suppressed: an order is outstanding, or
    /// one completed within the cool-down window. Retry exhaustion clears
    /// `pending_since` without stamping `last_order_at`, so an exhausted
    /// ticker is immediately eligible again.
    pub fn blocks_new_exit(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        if self.pending_since.is_some() {
            return true;
        }
        match self.last_order_at {
            Some(at) => now - at < cooldown,
            None => false,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.entry_time
    }
}

/// Records which tranches have fired. The set is tiny and fixed, so a Vec
/// beats a hash set here.
#[derive(Debug, Clone, Default)]
pub struct TrancheLedger {
    fired: Vec<TrancheKind>,
}

impl TrancheLedger {
    pub fn has_fired(&self, kind: TrancheKind) -> bool {
        self.fired.contains(&kind)
    }

    /// Mark a tranche as fired. Idempotent.
    pub fn mark(&mut self, kind: TrancheKind) {
        if !self.fired.contains(&kind) {
            self.fired.push(kind);
        }
    }
}

/// Per-ticker throttle and baseline state for the momentum-decay check.
/// Lives in the store so ghost removal cascades over it.
#[derive(Debug, Clone, Default)]
pub struct MomentumState {
    /// Volume/range ratio recorded on first observation.
    pub baseline: Option<Decimal>,
    pub last_check: Option<DateTime<Utc>>,
}

impl MomentumState {
    pub fn is_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        match self.last_check {
            Some(at) => now - at >= interval,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position() -> TrackedPosition {
        TrackedPosition::new(
            "RELIANCE".to_string(),
            100,
            dec!(100),
            Utc::now() - Duration::hours(2),
            "CNC".to_string(),
        )
    }

    #[test]
    fn high_only_moves_up() {
        let mut pos = position();
        assert!(pos.observe_price(dec!(110)));
        assert!(!pos.observe_price(dec!(107)));
        assert_eq!(pos.position_high, dec!(110));
    }

    #[test]
    fn pnl_pct_from_entry() {
        let pos = position();
        assert_eq!(pos.pnl_pct(dec!(98)), dec!(-2));
        assert_eq!(pos.pnl_pct(dec!(103)), dec!(3));
    }

    #[test]
    fn exit_guard_covers_in_flight_and_cooldown() {
        let mut pos = position();
        let now = Utc::now();
        let cooldown = Duration::minutes(5);
        assert!(!pos.blocks_new_exit(now, cooldown));

        // In flight: blocked regardless of age.
        pos.pending_since = Some(now - Duration::minutes(30));
        assert!(pos.blocks_new_exit(now, cooldown));

        // Completed recently: blocked until the cool-down lapses.
        pos.pending_since = None;
        pos.last_order_at = Some(now - Duration::minutes(2));
        assert!(pos.blocks_new_exit(now, cooldown));
        assert!(!pos.blocks_new_exit(now + Duration::minutes(4), cooldown));
    }

    #[test]
    fn tranche_ledger_marks_once() {
        let mut ledger = TrancheLedger::default();
        assert!(!ledger.has_fired(TrancheKind::Stop));
        ledger.mark(TrancheKind::Stop);
        ledger.mark(TrancheKind::Stop);
        assert!(ledger.has_fired(TrancheKind::Stop));
        assert!(!ledger.has_fired(TrancheKind::Target1));
    }
}
