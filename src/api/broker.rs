//! Brokerage port consumed by the engine.
//!
//! Everything the core needs from the venue sits behind this trait so the
//! control loop, reconciliation, and the order worker can be exercised
//! against a scripted mock in tests.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::api::types::{HoldingEntry, OrderReceipt, PositionBook, Profile};
use crate::error::BrokerError;
use crate::models::Candle;

/// A sell order as the worker hands it to the venue.
#[derive(Debug, Clone)]
pub struct SellOrder {
    pub tradingsymbol: String,
    pub exchange: String,
    pub product: String,
    pub quantity: i64,
    /// `None` places a market order.
    pub price: Option<Decimal>,
    /// Free-form tag surfaced in the venue's order book.
    pub tag: String,
}

/// Brokerage operations the engine consumes.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Cheap authenticated call used as the startup probe.
    async fn profile(&self) -> Result<Profile, BrokerError>;

    /// Day and net position books.
    async fn positions(&self) -> Result<PositionBook, BrokerError>;

    /// Demat holdings with the settled/T1 split.
    async fn holdings(&self) -> Result<Vec<HoldingEntry>, BrokerError>;

    /// Last traded price for up to the venue's batch limit of symbols.
    /// Callers sub-batch; implementations may reject oversized requests.
    async fn ltp(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>, BrokerError>;

    /// Daily OHLCV candles, inclusive date range.
    async fn daily_candles(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>, BrokerError>;

    /// Intraday OHLCV candles at the given minute interval.
    async fn intraday_candles(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval_minutes: u32,
    ) -> Result<Vec<Candle>, BrokerError>;

    /// Place a sell order; returns the venue order id or a classified error.
    async fn place_sell(&self, order: &SellOrder) -> Result<OrderReceipt, BrokerError>;
}

/// Quote a symbol set in sub-batches that respect the venue's per-call
/// limit, merging the results.
pub async fn batched_ltp(
    broker: &dyn BrokerPort,
    symbols: &[String],
    batch_size: usize,
) -> Result<HashMap<String, Decimal>, BrokerError> {
    let mut merged = HashMap::with_capacity(symbols.len());
    for chunk in symbols.chunks(batch_size.max(1)) {
        merged.extend(broker.ltp(chunk).await?);
    }
    Ok(merged)
}
