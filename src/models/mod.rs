//! Data models for positions, stops, candles, and exit orders.

mod candle;
mod order;
mod position;
mod stop;

pub use candle::Candle;
pub use order::{round_down_to_tick, ExitPrice, ExitReason, ExitRequest, QueuedOrder, TrancheKind};
pub use position::{MomentumState, TrackedPosition, TrancheLedger};
pub use stop::{MarketRegime, StopState, VolatilityCategory};
