//! Brokerage port and its REST implementation.

mod broker;
mod kite;
mod types;

pub use broker::{batched_ltp, BrokerPort, SellOrder};
pub use kite::KiteClient;
pub use types::*;
