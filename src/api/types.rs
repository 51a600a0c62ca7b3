//! Wire types for the brokerage REST API.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;

/// Standard response envelope: `{"status": "success", "data": ...}`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: String,
    pub data: T,
}

/// Error body returned on non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_type: String,
}

/// One row of the day/net position books.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionEntry {
    pub tradingsymbol: String,
    pub exchange: String,
    pub product: String,
    /// Net quantity; negative after same-day sells out of holdings.
    pub quantity: i64,
    pub average_price: Decimal,
    #[serde(default)]
    pub last_price: Decimal,
    #[serde(default)]
    pub pnl: Decimal,
}

/// The positions endpoint splits day and net books.
#[derive(Debug, Deserialize)]
pub struct PositionBook {
    pub net: Vec<PositionEntry>,
    #[serde(default)]
    pub day: Vec<PositionEntry>,
}

/// One demat holding, with the settled/pending-settlement split.
#[derive(Debug, Clone, Deserialize)]
pub struct HoldingEntry {
    pub tradingsymbol: String,
    pub exchange: String,
    /// Settled quantity.
    pub quantity: i64,
    /// Bought but not yet settled (T+1).
    #[serde(default)]
    pub t1_quantity: i64,
    pub average_price: Decimal,
    #[serde(default)]
    pub last_price: Decimal,
    #[serde(default)]
    pub pnl: Decimal,
}

impl HoldingEntry {
    /// Sellable quantity: settled plus pending settlement.
    pub fn live_quantity(&self) -> i64 {
        self.quantity + self.t1_quantity
    }
}

/// Per-symbol last-traded-price quote.
#[derive(Debug, Clone, Deserialize)]
pub struct LtpQuote {
    pub last_price: Decimal,
}

pub type QuoteMap = HashMap<String, LtpQuote>;

/// Historical-candles payload: rows of
/// `[timestamp, open, high, low, close, volume]`.
#[derive(Debug, Deserialize)]
pub struct CandleSeries {
    pub candles: Vec<CandleRow>,
}

#[derive(Debug, Deserialize)]
pub struct CandleRow(
    pub String,  // timestamp, venue-local RFC3339
    pub Decimal, // open
    pub Decimal, // high
    pub Decimal, // low
    pub Decimal, // close
    pub i64,     // volume
);

/// Response to a successful order placement.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
}

/// Account profile; fetched once at startup as an authentication probe.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
}
