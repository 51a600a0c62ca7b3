//! Typed error taxonomy for the control loop.
//!
//! The retry/backoff decision point branches on these classifications, so
//! they are real types rather than strings:
//! - transient broker failures (timeouts, rate limits) are retried with
//!   bounded backoff,
//! - validation failures (tick-size mismatch) are auto-corrected,
//! - terminal order failures update position state immediately,
//! - data-unavailable conditions skip the ticker's cycle and preserve the
//!   previous stop.

use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

/// Errors surfaced by the brokerage port.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Session token rejected. Fatal when hit by the startup probe, before
    /// any position is tracked.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// The venue has no instrument mapping for this symbol.
    #[error("no instrument mapping for {0}")]
    MissingInstrument(String),

    /// Non-2xx API response that is not an auth or rate-limit failure.
    #[error("broker API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BrokerError::Timeout(err.to_string())
        } else {
            BrokerError::Http(err.to_string())
        }
    }
}

/// How the order worker should react to a failed placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderErrorKind {
    /// The venue already holds or completed an identical order. Terminal
    /// success.
    Duplicate,
    /// Nothing left to sell. Terminal; the position is gone.
    InsufficientHoldings,
    /// Price not aligned to the instrument's tick; carries the tick the
    /// venue asked for when it could be extracted from the message.
    TickSizeMismatch { tick: Option<Decimal> },
    /// Back off and retry.
    RateLimited,
    /// Unclassified failure worth a bounded retry.
    Transient,
}

impl BrokerError {
    /// Classify an order-placement failure. Venue rejection text is the only
    /// signal available for the terminal cases, so this is message matching
    /// by necessity.
    pub fn order_kind(&self) -> OrderErrorKind {
        match self {
            BrokerError::RateLimited(_) => OrderErrorKind::RateLimited,
            BrokerError::Timeout(_) | BrokerError::Http(_) => OrderErrorKind::Transient,
            BrokerError::Api { message, .. } => classify_rejection(message),
            _ => OrderErrorKind::Transient,
        }
    }
}

fn classify_rejection(message: &str) -> OrderErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("duplicate") || lower.contains("already complete") || lower.contains("already executed") {
        OrderErrorKind::Duplicate
    } else if lower.contains("insufficient") || lower.contains("holding not available") || lower.contains("quantity not available") {
        OrderErrorKind::InsufficientHoldings
    } else if lower.contains("multiple of") || lower.contains("tick size") {
        OrderErrorKind::TickSizeMismatch {
            tick: extract_tick(&lower),
        }
    } else {
        OrderErrorKind::Transient
    }
}

/// Pull the required tick out of messages like
/// "price should be a multiple of 0.05".
fn extract_tick(message: &str) -> Option<Decimal> {
    let tail = message.split("multiple of").nth(1)?;
    let token: String = tail
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    Decimal::from_str(token.trim_end_matches('.')).ok()
}

/// A ticker's inputs are missing or degenerate. The affected cycle is
/// skipped; previous stop state is kept unchanged, never cleared.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataUnavailable {
    #[error("insufficient candle history: have {have}, need {need}")]
    InsufficientCandles { have: usize, need: usize },

    #[error("computed ATR is non-positive")]
    NonPositiveAtr,

    #[error("no quote for {0}")]
    MissingQuote(String),
}
