//! OHLCV candle model shared by the volatility calculator and the exit chain.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV candle from the historical-data API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

impl Candle {
    /// True range against the previous candle's close.
    pub fn true_range(&self, prev_close: Decimal) -> Decimal {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }

    /// High-low span of this candle.
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// Volume-to-range ratio, the momentum proxy used by the exit chain.
    /// `None` for zero-range candles, which carry no momentum information.
    pub fn volume_range_ratio(&self) -> Option<Decimal> {
        let range = self.range();
        if range <= Decimal::ZERO {
            return None;
        }
        Some(Decimal::from(self.volume) / range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(high: Decimal, low: Decimal, close: Decimal, volume: i64) -> Candle {
        Candle {
            timestamp: Utc::now(),
            open: low,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn true_range_covers_gaps() {
        // Gap down: previous close far above today's high.
        let c = candle(dec!(95), dec!(92), dec!(93), 1000);
        assert_eq!(c.true_range(dec!(100)), dec!(8)); // |92 - 100|
        // No gap: plain high-low.
        assert_eq!(c.true_range(dec!(94)), dec!(3));
    }

    #[test]
    fn vsr_guards_zero_range() {
        let flat = candle(dec!(100), dec!(100), dec!(100), 5000);
        assert!(flat.volume_range_ratio().is_none());

        let c = candle(dec!(102), dec!(100), dec!(101), 5000);
        assert_eq!(c.volume_range_ratio(), Some(dec!(2500)));
    }
}
