//! Risk logic: volatility stops, the trailing ratchet, and the exit chain.

mod exits;
mod trailing;
mod volatility;

pub use exits::{Evaluation, ExitConditionEvaluator, ExitDecision};
pub use trailing::TrailingStopTracker;
pub use volatility::{
    average_true_range, FileRegimeSource, FixedBucketPolicy, RegimeAwarePolicy, RegimeSource,
    StopPolicy, VolatilitySnapshot, VolatilityStopCalculator, ATR_WINDOW, MIN_CANDLES,
};
