//! Trailing-stop tracker: owns the monotonic stop ratchet and throttles
//! full ATR recomputation.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::DataUnavailable;
use crate::models::{Candle, StopState, TrackedPosition};
use crate::risk::volatility::VolatilityStopCalculator;

pub struct TrailingStopTracker {
    calculator: VolatilityStopCalculator,
    refresh_interval: Duration,
}

impl TrailingStopTracker {
    pub fn new(calculator: VolatilityStopCalculator, refresh_interval: Duration) -> Self {
        Self {
            calculator,
            refresh_interval,
        }
    }

    /// Build the initial stop state for a freshly reconstructed position.
    ///
    /// `floor` carries the original stop-loss from the entry order record
    /// when one exists; the live stop never starts below it.
    pub fn seed(
        &self,
        position: &TrackedPosition,
        candles: &[Candle],
        floor: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<StopState, DataUnavailable> {
        let snap = self.calculator.snapshot(candles, position.age(now))?;

        let mut stop_price = position.position_high - snap.stop_distance;
        if let Some(floor) = floor {
            stop_price = stop_price.max(floor);
        }

        info!(
            ticker = %position.ticker,
            atr = %snap.atr,
            atr_pct = %snap.atr_pct,
            category = %snap.category,
            stop = %stop_price,
            "Seeded trailing stop"
        );

        Ok(StopState {
            atr: snap.atr,
            atr_pct: snap.atr_pct,
            category: snap.category,
            multiplier: snap.multiplier,
            stop_distance: snap.stop_distance,
            stop_price,
            high_at_set: position.position_high,
            last_refresh: now,
        })
    }

    /// Whether the cached ATR inputs are due for a full recomputation.
    /// Throttled so candle fetches happen at most once per interval per
    /// ticker; the per-tick ratchet below runs regardless.
    pub fn needs_refresh(&self, state: &StopState, now: DateTime<Utc>) -> bool {
        now - state.last_refresh >= self.refresh_interval
    }

    /// Recompute ATR from fresh candles. The stop itself only ratchets up:
    /// a wider stop distance never lowers an established stop.
    pub fn refresh(
        &self,
        position: &TrackedPosition,
        state: &mut StopState,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Result<(), DataUnavailable> {
        let snap = self.calculator.snapshot(candles, position.age(now))?;

        state.atr = snap.atr;
        state.atr_pct = snap.atr_pct;
        state.category = snap.category;
        state.multiplier = snap.multiplier;
        state.stop_distance = snap.stop_distance;
        state.last_refresh = now;

        let candidate = position.position_high - state.stop_distance;
        if state.raise_to(candidate, position.position_high) {
            debug!(ticker = %position.ticker, stop = %state.stop_price, "Stop raised on refresh");
        }
        Ok(())
    }

    /// Per-tick ratchet using the cached ATR: when the position-high has
    /// advanced past the high recorded at the last stop set, re-anchor the
    /// stop, replacing it only on a strict increase.
    pub fn on_tick(&self, position: &TrackedPosition, state: &mut StopState) -> bool {
        if position.position_high <= state.high_at_set {
            return false;
        }
        let candidate = position.position_high - state.stop_distance;
        let raised = state.raise_to(candidate, position.position_high);
        if raised {
            debug!(
                ticker = %position.ticker,
                high = %position.position_high,
                stop = %state.stop_price,
                "Stop trailed up"
            );
        }
        raised
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VolatilityCategory;
    use crate::risk::volatility::{FixedBucketPolicy, MIN_CANDLES};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn tracker() -> TrailingStopTracker {
        TrailingStopTracker::new(
            VolatilityStopCalculator::new(Arc::new(FixedBucketPolicy)),
            Duration::hours(24),
        )
    }

    fn candles(close: Decimal, range: Decimal) -> Vec<Candle> {
        (0..MIN_CANDLES)
            .map(|i| Candle {
                timestamp: Utc::now() - Duration::days((MIN_CANDLES - i) as i64),
                open: close,
                high: close + range / dec!(2),
                low: close - range / dec!(2),
                close,
                volume: 10_000,
            })
            .collect()
    }

    fn position(entry: Decimal) -> TrackedPosition {
        TrackedPosition::new(
            "RELIANCE".to_string(),
            100,
            entry,
            Utc::now() - Duration::days(2),
            "CNC".to_string(),
        )
    }

    #[test]
    fn scenario_trail_up_then_hold() {
        // Flat candles at 105 with range 2: ATR 2, ~1.9% (Low bucket, 1.0x).
        let tracker = tracker();
        let mut pos = position(dec!(100));
        let series = candles(dec!(105), dec!(2));

        let mut state = tracker.seed(&pos, &series, None, Utc::now()).unwrap();
        assert_eq!(state.multiplier, dec!(1.0));
        assert_eq!(state.stop_price, dec!(98));

        // Price rises to 110: stop trails to 108.
        pos.observe_price(dec!(110));
        assert!(tracker.on_tick(&pos, &mut state));
        assert_eq!(state.stop_price, dec!(108));

        // Price drops to 107: stop holds at 108.
        pos.observe_price(dec!(107));
        assert!(!tracker.on_tick(&pos, &mut state));
        assert_eq!(state.stop_price, dec!(108));
    }

    #[test]
    fn stop_is_monotonic_over_any_tick_sequence() {
        let tracker = tracker();
        let mut pos = position(dec!(100));
        let series = candles(dec!(105), dec!(2));
        let mut state = tracker.seed(&pos, &series, None, Utc::now()).unwrap();

        let ticks = [
            dec!(101),
            dec!(109),
            dec!(104),
            dec!(112),
            dec!(103),
            dec!(112.5),
            dec!(99),
        ];
        let mut last_stop = state.stop_price;
        for tick in ticks {
            pos.observe_price(tick);
            tracker.on_tick(&pos, &mut state);
            assert!(state.stop_price >= last_stop);
            last_stop = state.stop_price;
        }
        assert_eq!(state.stop_price, dec!(110.5)); // 112.5 - 2
    }

    #[test]
    fn seed_respects_recorded_stop_floor() {
        let tracker = tracker();
        let pos = position(dec!(100));
        let series = candles(dec!(105), dec!(2));

        // Computed stop would be 98; the entry order carried a 99 stop.
        let state = tracker
            .seed(&pos, &series, Some(dec!(99)), Utc::now())
            .unwrap();
        assert_eq!(state.stop_price, dec!(99));

        // A floor below the computed stop changes nothing.
        let state = tracker
            .seed(&pos, &series, Some(dec!(90)), Utc::now())
            .unwrap();
        assert_eq!(state.stop_price, dec!(98));
    }

    #[test]
    fn refresh_updates_atr_but_never_lowers_the_stop() {
        let tracker = tracker();
        let mut pos = position(dec!(100));
        let series = candles(dec!(105), dec!(2));
        let mut state = tracker.seed(&pos, &series, None, Utc::now()).unwrap();

        pos.observe_price(dec!(110));
        tracker.on_tick(&pos, &mut state);
        assert_eq!(state.stop_price, dec!(108));

        // Volatility doubles: ATR 4 on close 105 is ~3.8% (Medium, 1.5x),
        // so the distance widens to 6 and the candidate 104 loses to 108.
        let wider = candles(dec!(105), dec!(4));
        tracker.refresh(&pos, &mut state, &wider, Utc::now()).unwrap();
        assert_eq!(state.stop_distance, dec!(6));
        assert_eq!(state.category, VolatilityCategory::Medium);
        assert_eq!(state.stop_price, dec!(108));

        // Insufficient candles: state untouched, caller keeps the old stop.
        let before = state.clone();
        let err = tracker.refresh(&pos, &mut state, &wider[..5], Utc::now());
        assert!(err.is_err());
        assert_eq!(state.stop_price, before.stop_price);
        assert_eq!(state.category, before.category);
    }

    #[test]
    fn refresh_throttle() {
        let tracker = tracker();
        let pos = position(dec!(100));
        let series = candles(dec!(105), dec!(2));
        let now = Utc::now();
        let state = tracker.seed(&pos, &series, None, now).unwrap();

        assert!(!tracker.needs_refresh(&state, now + Duration::hours(23)));
        assert!(tracker.needs_refresh(&state, now + Duration::hours(24)));
    }
}
