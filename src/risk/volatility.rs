//! Volatility-stop calculation: ATR over daily candles and the pluggable
//! policy that turns ATR into a stop distance.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::DataUnavailable;
use crate::models::{Candle, MarketRegime, VolatilityCategory};

/// Rolling window for the ATR mean.
pub const ATR_WINDOW: usize = 20;

/// One extra candle is needed for the first true range's previous close.
pub const MIN_CANDLES: usize = ATR_WINDOW + 1;

/// Output of one volatility computation.
#[derive(Debug, Clone)]
pub struct VolatilitySnapshot {
    pub atr: Decimal,
    pub atr_pct: Decimal,
    pub category: VolatilityCategory,
    pub multiplier: Decimal,
    pub stop_distance: Decimal,
}

/// Maps ATR% (and position age) to a stop-distance multiplier.
pub trait StopPolicy: Send + Sync {
    fn classify(&self, atr_pct: Decimal, position_age: Duration) -> (Decimal, VolatilityCategory);
}

/// Fixed ATR%-bucket multipliers.
#[derive(Debug, Default)]
pub struct FixedBucketPolicy;

impl StopPolicy for FixedBucketPolicy {
    fn classify(&self, atr_pct: Decimal, _age: Duration) -> (Decimal, VolatilityCategory) {
        if atr_pct < dec!(2.0) {
            (dec!(1.0), VolatilityCategory::Low)
        } else if atr_pct <= dec!(4.0) {
            (dec!(1.5), VolatilityCategory::Medium)
        } else {
            (dec!(2.0), VolatilityCategory::High)
        }
    }
}

/// Where the regime label comes from. The classifier itself is an external
/// process; the engine only reads its latest verdict.
pub trait RegimeSource: Send + Sync {
    fn current(&self) -> Option<MarketRegime>;
}

/// Regime signal file written by the external classifier:
/// `{"regime": "trending", "as_of": "2026-08-07T04:00:00Z"}`.
pub struct FileRegimeSource {
    path: PathBuf,
    max_age: Duration,
}

#[derive(Deserialize)]
struct RegimeSignal {
    regime: MarketRegime,
    as_of: DateTime<Utc>,
}

impl FileRegimeSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_age: Duration::hours(6),
        }
    }
}

impl RegimeSource for FileRegimeSource {
    fn current(&self) -> Option<MarketRegime> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = ?self.path, error = %e, "Regime signal unreadable");
                return None;
            }
        };
        let signal: RegimeSignal = match serde_json::from_str(&raw) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Regime signal unparseable");
                return None;
            }
        };
        if Utc::now() - signal.as_of > self.max_age {
            debug!(as_of = %signal.as_of, "Regime signal stale, ignoring");
            return None;
        }
        Some(signal.regime)
    }
}

/// Regime-aware multipliers, failing soft to the fixed buckets whenever the
/// regime signal is unavailable.
pub struct RegimeAwarePolicy {
    source: Arc<dyn RegimeSource>,
    fallback: FixedBucketPolicy,
}

impl RegimeAwarePolicy {
    pub fn new(source: Arc<dyn RegimeSource>) -> Self {
        Self {
            source,
            fallback: FixedBucketPolicy,
        }
    }
}

impl StopPolicy for RegimeAwarePolicy {
    fn classify(&self, atr_pct: Decimal, age: Duration) -> (Decimal, VolatilityCategory) {
        let Some(regime) = self.source.current() else {
            return self.fallback.classify(atr_pct, age);
        };

        let base = match regime {
            MarketRegime::Trending => dec!(2.0),
            MarketRegime::RangeBound => dec!(1.0),
            MarketRegime::Volatile => dec!(1.5),
        };
        // Positions younger than a session run a tighter leash; the wide
        // multiplier is earned once the trend has carried the position.
        let multiplier = if age < Duration::days(1) {
            base * dec!(0.75)
        } else {
            base
        };
        (multiplier, VolatilityCategory::Regime(regime))
    }
}

/// Average true range over the trailing window. Needs `MIN_CANDLES` candles;
/// returns `DataUnavailable` otherwise so callers keep their previous stop.
pub fn average_true_range(candles: &[Candle]) -> Result<Decimal, DataUnavailable> {
    if candles.len() < MIN_CANDLES {
        return Err(DataUnavailable::InsufficientCandles {
            have: candles.len(),
            need: MIN_CANDLES,
        });
    }

    let tail = &candles[candles.len() - MIN_CANDLES..];
    let mut sum = Decimal::ZERO;
    for pair in tail.windows(2) {
        sum += pair[1].true_range(pair[0].close);
    }
    let atr = sum / Decimal::from(ATR_WINDOW as i64);

    if atr <= Decimal::ZERO {
        return Err(DataUnavailable::NonPositiveAtr);
    }
    Ok(atr)
}

/// Computes the full volatility snapshot for one ticker.
pub struct VolatilityStopCalculator {
    policy: Arc<dyn StopPolicy>,
}

impl VolatilityStopCalculator {
    pub fn new(policy: Arc<dyn StopPolicy>) -> Self {
        Self { policy }
    }

    pub fn snapshot(
        &self,
        candles: &[Candle],
        position_age: Duration,
    ) -> Result<VolatilitySnapshot, DataUnavailable> {
        let atr = average_true_range(candles)?;

        // candles is non-empty past the ATR guard.
        let latest_close = candles[candles.len() - 1].close;
        let atr_pct = if latest_close.is_zero() {
            return Err(DataUnavailable::NonPositiveAtr);
        } else {
            atr / latest_close * Decimal::from(100)
        };

        let (multiplier, category) = self.policy.classify(atr_pct, position_age);
        Ok(VolatilitySnapshot {
            atr,
            atr_pct,
            category,
            multiplier,
            stop_distance: atr * multiplier,
        })
    }
}
