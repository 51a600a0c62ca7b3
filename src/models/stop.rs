//! Per-ticker volatility-stop state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Volatility bucket a ticker currently sits in, or the regime label when
/// the regime-aware policy supplied the multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolatilityCategory {
    Low,
    Medium,
    High,
    Regime(MarketRegime),
}

/// Market regime label delivered by the external classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Trending,
    RangeBound,
    Volatile,
}

impl std::fmt::Display for VolatilityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolatilityCategory::Low => write!(f, "low"),
            VolatilityCategory::Medium => write!(f, "medium"),
            VolatilityCategory::High => write!(f, "high"),
            VolatilityCategory::Regime(MarketRegime::Trending) => write!(f, "regime:trending"),
            VolatilityCategory::Regime(MarketRegime::RangeBound) => write!(f, "regime:range_bound"),
            VolatilityCategory::Regime(MarketRegime::Volatile) => write!(f, "regime:volatile"),
        }
    }
}

/// Live trailing-stop state for one ticker.
///
/// `stop_price` is monotonically non-decreasing for the lifetime of a long
/// position: it is only replaced by a strictly greater value, never lowered
/// and never cleared while the position is tracked.
#[derive(Debug, Clone)]
pub struct StopState {
    pub atr: Decimal,
    pub atr_pct: Decimal,
    pub category: VolatilityCategory,
    pub multiplier: Decimal,
    pub stop_distance: Decimal,
    pub stop_price: Decimal,
    /// Position-high at the moment the stop was last replaced.
    pub high_at_set: Decimal,
    /// When the ATR inputs were last recomputed from candles.
    pub last_refresh: DateTime<Utc>,
}

impl StopState {
    /// Replace the live stop if `candidate` is strictly greater. Returns
    /// whether the stop moved.
    pub fn raise_to(&mut self, candidate: Decimal, high: Decimal) -> bool {
        if candidate > self.stop_price {
            self.stop_price = candidate;
            self.high_at_set = high;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn raise_to_is_strictly_increasing() {
        let mut state = StopState {
            atr: dec!(2),
            atr_pct: dec!(2),
            category: VolatilityCategory::Low,
            multiplier: dec!(1),
            stop_distance: dec!(2),
            stop_price: dec!(98),
            high_at_set: dec!(100),
            last_refresh: Utc::now(),
        };

        assert!(!state.raise_to(dec!(98), dec!(100))); // equal: no move
        assert!(!state.raise_to(dec!(97), dec!(100))); // lower: no move
        assert_eq!(state.stop_price, dec!(98));

        assert!(state.raise_to(dec!(108), dec!(110)));
        assert_eq!(state.stop_price, dec!(108));
        assert_eq!(state.high_at_set, dec!(110));
    }
}
