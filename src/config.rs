//! Engine configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::TrancheKind;

/// Which stop-distance policy drives the trailing stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicyKind {
    /// Fixed ATR%-bucket multipliers.
    Fixed,
    /// Regime-aware multipliers, failing soft to the fixed buckets.
    Regime,
}

/// Configuration for the monitoring and execution loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // === Venue ===
    /// Exchange segment orders are routed to
    pub exchange: String,

    /// Product type for exits (delivery holdings)
    pub product: String,

    /// Minimum price increment; limit prices are rounded to this
    pub tick_size: Decimal,

    /// Maximum symbols per quote call; larger sets are sub-batched
    pub quote_batch_size: usize,

    // === Cadence ===
    /// Price poll interval (seconds)
    pub poll_interval_secs: u64,

    /// Broker resync interval (seconds)
    pub resync_interval_secs: u64,

    /// Suppress re-submission for this long after an exit was queued (seconds)
    pub pending_cooldown_secs: i64,

    /// Full ATR recomputation at most once per this many hours per ticker
    pub atr_refresh_hours: i64,

    // === Exit rules ===
    /// Hard loss threshold from entry, percent
    pub loss_threshold_pct: Decimal,

    /// Exit when the volume/range ratio falls below this fraction of baseline
    pub vsr_decay_fraction: Decimal,

    /// Momentum-decay check interval (seconds)
    pub vsr_check_interval_secs: i64,

    /// Exit when the latest intraday candle spans more than this multiple of ATR
    pub candle_length_atr_mult: Decimal,

    /// One-shot trend check this long after entry (seconds)
    pub trend_check_delay_secs: i64,

    /// Whether profit-target tranches are active
    pub tranches_enabled: bool,

    /// Tranche sizes and trigger multiples
    pub tranche: TrancheConfig,

    /// Stop-distance policy selection
    pub stop_policy: StopPolicyKind,

    /// Regime signal file written by the external classifier (regime policy only)
    pub regime_signal_path: Option<String>,

    // === Order execution ===
    /// Retry budget for rate-limited/transient order failures
    pub retry_budget: u32,

    /// Extra immediate retries allowed for tick-size corrections
    pub tick_retry_cap: u32,

    /// Base backoff delay (milliseconds)
    pub backoff_base_ms: u64,

    /// Backoff growth factor per attempt
    pub backoff_growth: f64,

    // === Reconstruction ===
    /// Conservative entry-time lookback when no order record exists (days)
    pub lookback_days: i64,

    /// Don't submit orders; log decisions and mutate state as if filled
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // Venue
            exchange: "NSE".to_string(),
            product: "CNC".to_string(),
            tick_size: dec!(0.05),
            quote_batch_size: 200,

            // Cadence
            poll_interval_secs: 20,
            resync_interval_secs: 600,    // 10 minutes
            pending_cooldown_secs: 300,   // 5 minutes
            atr_refresh_hours: 24,

            // Exit rules
            loss_threshold_pct: dec!(2.0),
            vsr_decay_fraction: dec!(0.4),
            vsr_check_interval_secs: 3600, // hourly
            candle_length_atr_mult: dec!(3.0),
            trend_check_delay_secs: 2700,  // 45 minutes
            tranches_enabled: false,
            tranche: TrancheConfig::default(),
            stop_policy: StopPolicyKind::Fixed,
            regime_signal_path: None,

            // Order execution
            retry_budget: 5,
            tick_retry_cap: 3,
            backoff_base_ms: 2000,
            backoff_growth: 2.0,

            // Reconstruction
            lookback_days: 30,
            dry_run: false,
        }
    }
}

impl EngineConfig {
    pub fn pending_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_cooldown_secs)
    }

    pub fn vsr_check_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.vsr_check_interval_secs)
    }

    pub fn trend_check_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.trend_check_delay_secs)
    }

    pub fn atr_refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.atr_refresh_hours)
    }
}

/// Sizes and triggers for the exit tranches. Percentages are fractions of
/// the original position quantity; target triggers are ATR multiples of
/// profit from entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrancheConfig {
    /// Fraction sold on a stop breach when tranches are enabled
    pub stop_pct: Decimal,

    /// Fraction sold at the lower profit target
    pub target1_pct: Decimal,

    /// Lower target: entry + this many ATRs
    pub target1_atr_mult: Decimal,

    /// Fraction sold at the higher profit target
    pub target2_pct: Decimal,

    /// Higher target: entry + this many ATRs
    pub target2_atr_mult: Decimal,
}

impl Default for TrancheConfig {
    fn default() -> Self {
        Self {
            stop_pct: dec!(0.5),
            target1_pct: dec!(0.3),
            target1_atr_mult: dec!(2),
            target2_pct: dec!(0.3),
            target2_atr_mult: dec!(4),
        }
    }
}

impl TrancheConfig {
    /// Quantity fraction for a tranche kind.
    pub fn fraction(&self, kind: TrancheKind) -> Decimal {
        match kind {
            TrancheKind::Stop => self.stop_pct,
            TrancheKind::Target1 => self.target1_pct,
            TrancheKind::Target2 => self.target2_pct,
        }
    }

    /// ATR profit multiple that triggers a target tranche.
    pub fn target_multiple(&self, kind: TrancheKind) -> Option<Decimal> {
        match kind {
            TrancheKind::Stop => None,
            TrancheKind::Target1 => Some(self.target1_atr_mult),
            TrancheKind::Target2 => Some(self.target2_atr_mult),
        }
    }

    /// Tranche share of the original quantity, floored, never below one
    /// share, never above what remains.
    pub fn quantity_for(&self, kind: TrancheKind, original: i64, remaining: i64) -> i64 {
        use rust_decimal::prelude::ToPrimitive;
        let share = (Decimal::from(original) * self.fraction(kind))
            .floor()
            .to_i64()
            .unwrap_or(0);
        share.max(1).min(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tranche_quantity_respects_bounds() {
        let cfg = TrancheConfig::default();
        assert_eq!(cfg.quantity_for(TrancheKind::Stop, 100, 100), 50);
        assert_eq!(cfg.quantity_for(TrancheKind::Target1, 100, 100), 30);
        // Never more than what remains.
        assert_eq!(cfg.quantity_for(TrancheKind::Stop, 100, 20), 20);
        // Never below one share.
        assert_eq!(cfg.quantity_for(TrancheKind::Target1, 1, 1), 1);
    }
}
