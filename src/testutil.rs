//! Scripted mock broker for exercising the control loop in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::api::{BrokerPort, HoldingEntry, OrderReceipt, PositionBook, PositionEntry, Profile, SellOrder};
use crate::error::BrokerError;
use crate::models::Candle;

#[derive(Default)]
pub struct MockBroker {
    pub holdings: Mutex<Vec<HoldingEntry>>,
    pub net_positions: Mutex<Vec<PositionEntry>>,
    pub day_positions: Mutex<Vec<PositionEntry>>,
    pub quotes: Mutex<HashMap<String, Decimal>>,
    pub daily: Mutex<HashMap<String, Vec<Candle>>>,
    pub intraday: Mutex<HashMap<String, Vec<Candle>>>,
    /// Scripted outcomes for `place_sell`, consumed front to back; when
    /// empty every order succeeds.
    pub sell_script: Mutex<VecDeque<Result<OrderReceipt, BrokerError>>>,
    /// Every order the engine actually placed.
    pub placed: Mutex<Vec<SellOrder>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holding(&self, ticker: &str, quantity: i64, t1: i64, average_price: Decimal) {
        self.holdings.lock().unwrap().push(HoldingEntry {
            tradingsymbol: ticker.to_string(),
            exchange: "NSE".to_string(),
            quantity,
            t1_quantity: t1,
            average_price,
            last_price: average_price,
            pnl: Decimal::ZERO,
        });
    }

    pub fn day_position(&self, ticker: &str, quantity: i64, average_price: Decimal) {
        self.day_positions.lock().unwrap().push(PositionEntry {
            tradingsymbol: ticker.to_string(),
            exchange: "NSE".to_string(),
            product: "CNC".to_string(),
            quantity,
            average_price,
            last_price: average_price,
            pnl: Decimal::ZERO,
        });
    }

    pub fn net_position(&self, ticker: &str, quantity: i64, average_price: Decimal) {
        self.net_positions.lock().unwrap().push(PositionEntry {
            tradingsymbol: ticker.to_string(),
            exchange: "NSE".to_string(),
            product: "CNC".to_string(),
            quantity,
            average_price,
            last_price: average_price,
            pnl: Decimal::ZERO,
        });
    }

    pub fn quote(&self, ticker: &str, price: Decimal) {
        self.quotes.lock().unwrap().insert(ticker.to_string(), price);
    }

    pub fn daily_series(&self, ticker: &str, candles: Vec<Candle>) {
        self.daily.lock().unwrap().insert(ticker.to_string(), candles);
    }

    pub fn script_sell(&self, outcome: Result<OrderReceipt, BrokerError>) {
        self.sell_script.lock().unwrap().push_back(outcome);
    }

    pub fn placed_count(&self) -> usize {
        self.placed.lock().unwrap().len()
    }
}

#[async_trait]
impl BrokerPort for MockBroker {
    async fn profile(&self) -> Result<Profile, BrokerError> {
        Ok(Profile {
            user_id: "AB1234".to_string(),
            user_name: "Mock".to_string(),
        })
    }

    async fn positions(&self) -> Result<PositionBook, BrokerError> {
        Ok(PositionBook {
            net: self.net_positions.lock().unwrap().clone(),
            day: self.day_positions.lock().unwrap().clone(),
        })
    }

    async fn holdings(&self) -> Result<Vec<HoldingEntry>, BrokerError> {
        Ok(self.holdings.lock().unwrap().clone())
    }

    async fn ltp(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>, BrokerError> {
        let quotes = self.quotes.lock().unwrap();
        Ok(symbols
            .iter()
            .filter_map(|s| quotes.get(s).map(|p| (s.clone(), *p)))
            .collect())
    }

    async fn daily_candles(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>, BrokerError> {
        let daily = self.daily.lock().unwrap();
        Ok(daily
            .get(symbol)
            .map(|series| {
                series
                    .iter()
                    .filter(|c| {
                        let date = c.timestamp.date_naive();
                        date >= from && date <= to
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn intraday_candles(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        _interval_minutes: u32,
    ) -> Result<Vec<Candle>, BrokerError> {
        let intraday = self.intraday.lock().unwrap();
        Ok(intraday
            .get(symbol)
            .map(|series| {
                series
                    .iter()
                    .filter(|c| c.timestamp >= from && c.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn place_sell(&self, order: &SellOrder) -> Result<OrderReceipt, BrokerError> {
        self.placed.lock().unwrap().push(order.clone());
        match self.sell_script.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(OrderReceipt {
                order_id: format!("mock-{}", self.placed.lock().unwrap().len()),
            }),
        }
    }
}
