//! Exit requests and the queued-order wrapper owned by the execution worker.

use rust_decimal::Decimal;
use uuid::Uuid;

/// Identifies a configured exit tranche. Each kind fires at most once per
/// position lifetime; percentages and trigger multiples live in
/// `TrancheConfig`, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrancheKind {
    /// Partial exit on a trailing-stop breach.
    Stop,
    /// Lower profit target.
    Target1,
    /// Higher profit target.
    Target2,
}

impl TrancheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrancheKind::Stop => "stop",
            TrancheKind::Target1 => "target1",
            TrancheKind::Target2 => "target2",
        }
    }
}

/// Why an exit was requested. Shows up in order logs and worker telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Live price at or below the trailing stop.
    StopBreach,
    /// Already below the stop at reconstruction time (e.g. weekend gap).
    GapBreach,
    /// Volume/range ratio decayed below the recorded baseline.
    MomentumDecay,
    /// Fixed loss threshold from entry breached.
    LossThreshold,
    /// Intraday candle span abnormally wide relative to ATR.
    AbnormalCandle,
    /// Price back at or below entry after the post-entry grace window.
    TrendViolation,
    /// Profit target tranche reached.
    ProfitTarget,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopBreach => "stop_breach",
            ExitReason::GapBreach => "gap_breach",
            ExitReason::MomentumDecay => "momentum_decay",
            ExitReason::LossThreshold => "loss_threshold",
            ExitReason::AbnormalCandle => "abnormal_candle",
            ExitReason::TrendViolation => "trend_violation",
            ExitReason::ProfitTarget => "profit_target",
        }
    }
}

/// Pricing for an exit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPrice {
    Market,
    Limit(Decimal),
}

/// An exit decision emitted by the evaluator, consumed exactly once by the
/// order worker.
#[derive(Debug, Clone)]
pub struct ExitRequest {
    pub ticker: String,
    pub quantity: i64,
    pub price: ExitPrice,
    pub reason: ExitReason,
    pub tranche: Option<TrancheKind>,
}

/// An exit request plus retry bookkeeping. Exclusively owned by the order
/// worker while in flight.
#[derive(Debug)]
pub struct QueuedOrder {
    pub id: Uuid,
    pub request: ExitRequest,
    pub attempts: u32,
    pub tick_retries: u32,
    pub last_error: Option<String>,
}

impl QueuedOrder {
    pub fn new(request: ExitRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            attempts: 0,
            tick_retries: 0,
            last_error: None,
        }
    }
}

/// Round a price down to the instrument's tick size.
///
/// Used for sell limits, where rounding down can only make the order more
/// marketable.
pub fn round_down_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).floor() * tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn tick_rounding_floors() {
        assert_eq!(round_down_to_tick(dec!(107.46), dec!(0.05)), dec!(107.45));
        assert_eq!(round_down_to_tick(dec!(107.45), dec!(0.05)), dec!(107.45));
        assert_eq!(round_down_to_tick(dec!(99.99), dec!(0.10)), dec!(99.90));
    }

    #[test]
    fn tick_rounding_ignores_zero_tick() {
        assert_eq!(round_down_to_tick(dec!(10.123), Decimal::ZERO), dec!(10.123));
    }
}
