//! Kite Connect REST client: quotes, portfolio, historical candles, and
//! order placement for one authenticated account.
//!
//! All calls carry a client-level timeout. Non-2xx responses are mapped into
//! the typed taxonomy: 403 to an auth failure, 429 to a rate limit, anything
//! else to an API error carrying the venue's message (which the order worker
//! classifies further).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::api::broker::{BrokerPort, SellOrder};
use crate::api::types::*;
use crate::error::BrokerError;
use crate::models::Candle;

const API_BASE: &str = "https://api.kite.trade";
const API_VERSION: &str = "3";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// REST client for the brokerage API.
pub struct KiteClient {
    http: Client,
    base_url: String,
    exchange: String,
    api_key: String,
    access_token: String,
    /// tradingsymbol -> instrument token, loaded lazily per process from the
    /// instruments dump.
    instruments: RwLock<HashMap<String, u64>>,
}

impl KiteClient {
    pub fn new(api_key: &str, access_token: &str) -> Result<Self, BrokerError> {
        Self::with_base_url(API_BASE.to_string(), api_key, access_token)
    }

    /// Custom base URL, for tests against a local stub.
    pub fn with_base_url(
        base_url: String,
        api_key: &str,
        access_token: &str,
    ) -> Result<Self, BrokerError> {
        let http = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;

        Ok(Self {
            http,
            base_url,
            exchange: "NSE".to_string(),
            api_key: api_key.to_string(),
            access_token: access_token.to_string(),
            instruments: RwLock::new(HashMap::new()),
        })
    }

    /// Route quotes and instrument lookups through a different exchange
    /// segment.
    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_string();
        self
    }

    /// Create from `KITE_API_KEY` / `KITE_ACCESS_TOKEN`.
    pub fn from_env() -> Result<Self, BrokerError> {
        let api_key = std::env::var("KITE_API_KEY")
            .map_err(|_| BrokerError::Auth("KITE_API_KEY not set".to_string()))?;
        let access_token = std::env::var("KITE_ACCESS_TOKEN")
            .map_err(|_| BrokerError::Auth("KITE_ACCESS_TOKEN not set".to_string()))?;
        Self::new(&api_key, &access_token)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let auth = format!("token {}:{}", self.api_key, self.access_token);
        if let Ok(value) = HeaderValue::from_str(&auth) {
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert("X-Kite-Version", HeaderValue::from_static(API_VERSION));
        headers
    }

    /// Check the response status and parse the success envelope.
    async fn parse<T: serde::de::DeserializeOwned>(
        &self,
        resp: Response,
    ) -> Result<T, BrokerError> {
        let status = resp.status();
        if status.is_success() {
            let envelope: ApiEnvelope<T> = resp.json().await?;
            return Ok(envelope.data);
        }

        let message = match resp.json::<ApiErrorBody>().await {
            Ok(body) => body.message,
            Err(_) => status.to_string(),
        };

        Err(match status {
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => BrokerError::Auth(message),
            StatusCode::TOO_MANY_REQUESTS => BrokerError::RateLimited(message),
            _ => BrokerError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }

    /// Resolve a tradingsymbol to its instrument token, loading the
    /// instruments dump on first use.
    async fn instrument_token(&self, symbol: &str) -> Result<u64, BrokerError> {
        {
            let cache = self.instruments.read().await;
            if let Some(token) = cache.get(symbol) {
                return Ok(*token);
            }
            if !cache.is_empty() {
                return Err(BrokerError::MissingInstrument(symbol.to_string()));
            }
        }

        let url = format!("{}/instruments/{}", self.base_url, self.exchange);
        debug!(url = %url, "Loading instruments dump");
        let resp = self.http.get(&url).headers(self.headers()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BrokerError::Api {
                status: status.as_u16(),
                message: format!("instruments dump failed: {}", status),
            });
        }

        // CSV dump: instrument_token,exchange_token,tradingsymbol,...
        let body = resp.text().await?;
        let mut cache = self.instruments.write().await;
        for line in body.lines().skip(1) {
            let mut fields = line.split(',');
            let token = fields.next().and_then(|t| t.parse::<u64>().ok());
            let tradingsymbol = fields.nth(1);
            if let (Some(token), Some(sym)) = (token, tradingsymbol) {
                cache.insert(sym.to_string(), token);
            }
        }
        debug!(count = cache.len(), "Instruments loaded");

        cache
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::MissingInstrument(symbol.to_string()))
    }

    async fn historical(
        &self,
        symbol: &str,
        interval: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<Candle>, BrokerError> {
        let token = self.instrument_token(symbol).await?;
        let url = format!(
            "{}/instruments/historical/{}/{}",
            self.base_url, token, interval
        );
        let resp = self
            .http
            .get(&url)
            .query(&[("from", from), ("to", to)])
            .headers(self.headers())
            .send()
            .await?;
        let series: CandleSeries = self.parse(resp).await?;

        let mut candles = Vec::with_capacity(series.candles.len());
        for row in series.candles {
            match parse_candle_timestamp(&row.0) {
                Some(timestamp) => candles.push(Candle {
                    timestamp,
                    open: row.1,
                    high: row.2,
                    low: row.3,
                    close: row.4,
                    volume: row.5,
                }),
                None => warn!(symbol = %symbol, ts = %row.0, "Unparseable candle timestamp, skipping"),
            }
        }
        Ok(candles)
    }
}

/// Candle timestamps come back in exchange-local time, either RFC3339 or
/// with a bare `+0530` offset.
fn parse_candle_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn format_ist(at: DateTime<Utc>) -> String {
    at.with_timezone(&Kolkata)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[async_trait]
impl BrokerPort for KiteClient {
    async fn profile(&self) -> Result<Profile, BrokerError> {
        let url = format!("{}/user/profile", self.base_url);
        let resp = self.http.get(&url).headers(self.headers()).send().await?;
        self.parse(resp).await
    }

    async fn positions(&self) -> Result<PositionBook, BrokerError> {
        let url = format!("{}/portfolio/positions", self.base_url);
        let resp = self.http.get(&url).headers(self.headers()).send().await?;
        self.parse(resp).await
    }

    async fn holdings(&self) -> Result<Vec<HoldingEntry>, BrokerError> {
        let url = format!("{}/portfolio/holdings", self.base_url);
        let resp = self.http.get(&url).headers(self.headers()).send().await?;
        self.parse(resp).await
    }

    async fn ltp(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>, BrokerError> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let params: Vec<(&str, String)> = symbols
            .iter()
            .map(|s| ("i", format!("{}:{}", self.exchange, s)))
            .collect();
        let url = format!("{}/quote/ltp", self.base_url);
        debug!(count = symbols.len(), "Fetching quotes");

        let resp = self
            .http
            .get(&url)
            .query(&params)
            .headers(self.headers())
            .send()
            .await?;
        let quotes: QuoteMap = self.parse(resp).await?;

        // Keys come back as "NSE:INFY"; strip back to the bare symbol.
        Ok(quotes
            .into_iter()
            .map(|(key, quote)| {
                let symbol = key.split_once(':').map(|(_, s)| s).unwrap_or(&key);
                (symbol.to_string(), quote.last_price)
            })
            .collect())
    }

    async fn daily_candles(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>, BrokerError> {
        self.historical(
            symbol,
            "day",
            &from.format("%Y-%m-%d").to_string(),
            &to.format("%Y-%m-%d").to_string(),
        )
        .await
    }

    async fn intraday_candles(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval_minutes: u32,
    ) -> Result<Vec<Candle>, BrokerError> {
        let interval = format!("{}minute", interval_minutes);
        self.historical(symbol, &interval, &format_ist(from), &format_ist(to))
            .await
    }

    async fn place_sell(&self, order: &SellOrder) -> Result<OrderReceipt, BrokerError> {
        let order_type = if order.price.is_some() { "LIMIT" } else { "MARKET" };
        let mut form: Vec<(&str, String)> = vec![
            ("tradingsymbol", order.tradingsymbol.clone()),
            ("exchange", order.exchange.clone()),
            ("transaction_type", "SELL".to_string()),
            ("order_type", order_type.to_string()),
            ("quantity", order.quantity.to_string()),
            ("product", order.product.clone()),
            ("validity", "DAY".to_string()),
            ("tag", order.tag.clone()),
        ];
        if let Some(price) = order.price {
            form.push(("price", price.to_string()));
        }

        let url = format!("{}/orders/regular", self.base_url);
        let resp = self
            .http
            .post(&url)
            .headers(self.headers())
            .form(&form)
            .send()
            .await?;
        self.parse(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_timestamp_accepts_both_offsets() {
        assert!(parse_candle_timestamp("2026-08-07T09:15:00+05:30").is_some());
        assert!(parse_candle_timestamp("2026-08-07T09:15:00+0530").is_some());
        assert!(parse_candle_timestamp("garbage").is_none());
    }

    #[test]
    fn ist_formatting_is_exchange_local() {
        let at = Utc.with_ymd_and_hms(2026, 8, 7, 3, 45, 0).unwrap(); // 09:15 IST
        assert_eq!(format_ist(at), "2026-08-07 09:15:00");
    }
}
