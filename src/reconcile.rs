//! Reconciliation against the brokerage's authoritative state.
//!
//! Startup reconstruction rebuilds every tracked position from the live
//! position/holdings listing plus the historical order records, then runs a
//! gap check so a weekend gap-down exits immediately instead of waiting for
//! the first poll. A periodic resync drops ghost positions, corrects
//! quantities the venue disagrees with, and aggregates PnL for the logs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Asia::Kolkata;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::api::{batched_ltp, BrokerPort, HoldingEntry, PositionBook};
use crate::config::EngineConfig;
use crate::models::{ExitPrice, ExitReason, ExitRequest, TrackedPosition};
use crate::records::OrderRecordStore;
use crate::risk::TrailingStopTracker;
use crate::store::PositionStore;

/// How far back daily candles are pulled for ATR, independent of entry age.
const ATR_CANDLE_DAYS: i64 = 90;

/// The venue's merged view of one ticker.
#[derive(Debug, Clone)]
pub struct BrokerView {
    pub quantity: i64,
    pub average_price: Decimal,
    pub pnl: Decimal,
}

/// Merge holdings (settled + T1) with the day/net position books into one
/// live quantity per ticker.
///
/// Holdings are preferred: a negative day-position against a positive
/// holding is a partial sell and the holdings-derived remaining quantity
/// wins. Positions with positive net quantity but no holding row are
/// same-day buys that have not reached the demat listing yet.
pub fn merge_broker_view(
    book: &PositionBook,
    holdings: &[HoldingEntry],
) -> HashMap<String, BrokerView> {
    let mut view = HashMap::new();

    for holding in holdings {
        let live = holding.live_quantity();
        if live <= 0 {
            continue;
        }
        view.insert(
            holding.tradingsymbol.clone(),
            BrokerView {
                quantity: live,
                average_price: holding.average_price,
                pnl: holding.pnl,
            },
        );
    }

    for entry in &book.net {
        if entry.quantity > 0 && !view.contains_key(&entry.tradingsymbol) {
            view.insert(
                entry.tradingsymbol.clone(),
                BrokerView {
                    quantity: entry.quantity,
                    average_price: entry.average_price,
                    pnl: entry.pnl,
                },
            );
        } else if entry.quantity < 0 && view.contains_key(&entry.tradingsymbol) {
            // Partial sell this session; the holdings row already reflects
            // what remains.
            debug!(
                ticker = %entry.tradingsymbol,
                sold = -entry.quantity,
                "Partial sell detected in day positions"
            );
        }
    }

    view
}

/// Outcome of one periodic resync pass.
#[derive(Debug, Default)]
pub struct ResyncReport {
    pub ghosts: Vec<String>,
    pub corrected: Vec<String>,
    pub adopted: Vec<String>,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

pub struct ReconciliationService {
    broker: Arc<dyn BrokerPort>,
    store: Arc<PositionStore>,
    tracker: Arc<TrailingStopTracker>,
    records: OrderRecordStore,
    config: EngineConfig,
}

impl ReconciliationService {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        store: Arc<PositionStore>,
        tracker: Arc<TrailingStopTracker>,
        records: OrderRecordStore,
        config: EngineConfig,
    ) -> Self {
        Self {
            broker,
            store,
            tracker,
            records,
            config,
        }
    }

    /// Rebuild tracked positions from the venue and the order records, then
    /// gap-check each freshly computed stop against the live quote. Returns
    /// the exits that must be submitted immediately.
    pub async fn reconstruct(&self) -> Result<Vec<ExitRequest>> {
        let now = Utc::now();
        let book = self.broker.positions().await.context("Position listing failed")?;
        let holdings = self.broker.holdings().await.context("Holdings listing failed")?;
        let view = merge_broker_view(&book, &holdings);

        info!(tickers = view.len(), "Reconstructing positions from broker state");

        // Tickers rebuild independently; fetch their candle histories
        // concurrently.
        futures::future::join_all(
            view.iter()
                .map(|(ticker, broker_view)| self.reconstruct_ticker(ticker, broker_view, now)),
        )
        .await;

        self.gap_check().await
    }

    /// Rebuild one ticker: entry from the earliest recorded buy fill (or the
    /// conservative lookback fallback), position-high from candles since
    /// entry, stop from the volatility calculator floored at any recorded
    /// original stop.
    async fn reconstruct_ticker(&self, ticker: &str, view: &BrokerView, now: DateTime<Utc>) {
        let since = now - Duration::days(self.config.lookback_days);
        let record = self.records.earliest_buy(ticker, since);

        let (entry_price, entry_time, stop_floor) = match &record {
            Some(r) => (r.price, r.filled_at, r.stop_loss),
            None => {
                debug!(ticker = %ticker, "No order record; using lookback fallback entry");
                (view.average_price, since, None)
            }
        };

        let mut position = TrackedPosition::new(
            ticker.to_string(),
            view.quantity,
            entry_price,
            entry_time,
            self.config.product.clone(),
        );

        // Daily candles back far enough for both the high scan and the ATR
        // window.
        let today = now.date_naive();
        let fetch_from = (now - Duration::days(ATR_CANDLE_DAYS))
            .date_naive()
            .min(entry_time.date_naive());
        let daily = match self.broker.daily_candles(ticker, fetch_from, today).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "Daily candles unavailable; tracking without a stop");
                self.store.upsert(position).await;
                return;
            }
        };

        // Position-high: max daily high since the entry date, floored at the
        // entry price itself.
        let entry_date = entry_time.date_naive();
        let mut high = entry_price;
        for candle in daily.iter().filter(|c| c.timestamp.date_naive() >= entry_date) {
            high = high.max(candle.high);
        }

        // Same-session entries fold in intraday highs for precision; the
        // daily candle may not exist yet.
        if entered_today(entry_time, now) {
            match self
                .broker
                .intraday_candles(ticker, entry_time, now, 5)
                .await
            {
                Ok(intraday) => {
                    for candle in &intraday {
                        high = high.max(candle.high);
                    }
                }
                Err(e) => debug!(ticker = %ticker, error = %e, "Intraday candles unavailable"),
            }
        }

        position.position_high = high;
        // The trend check only applies to same-session entries; older
        // positions are marked checked up front.
        position.trend_checked = !entered_today(entry_time, now);

        match self.tracker.seed(&position, &daily, stop_floor, now) {
            Ok(state) => {
                info!(
                    ticker = %ticker,
                    quantity = position.quantity,
                    entry = %entry_price,
                    high = %high,
                    stop = %state.stop_price,
                    from_record = record.is_some(),
                    "Position reconstructed"
                );
                self.store.upsert(position).await;
                self.store.set_stop(ticker, state).await;
            }
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "Stop seeding failed; tracking without a stop");
                self.store.upsert(position).await;
            }
        }
    }

    /// Compare each freshly computed stop against the live quote; positions
    /// that gapped through their stop exit now rather than on the next poll.
    async fn gap_check(&self) -> Result<Vec<ExitRequest>> {
        let tickers = self.store.tickers().await;
        if tickers.is_empty() {
            return Ok(Vec::new());
        }

        let quotes = batched_ltp(self.broker.as_ref(), &tickers, self.config.quote_batch_size)
            .await
            .context("Gap-check quotes failed")?;

        let mut exits = Vec::new();
        for ticker in &tickers {
            let Some(price) = quotes.get(ticker) else {
                debug!(ticker = %ticker, "No quote for gap check");
                continue;
            };
            let Some(position) = self.store.observe_tick(ticker, *price).await else {
                continue;
            };
            let Some(stop) = self.store.stop(ticker).await else {
                continue;
            };
            if *price <= stop.stop_price {
                warn!(
                    ticker = %ticker,
                    price = %price,
                    stop = %stop.stop_price,
                    "Already below stop at reconstruction; exiting immediately"
                );
                exits.push(ExitRequest {
                    ticker: ticker.clone(),
                    quantity: position.quantity,
                    price: ExitPrice::Market,
                    reason: ExitReason::GapBreach,
                    tranche: None,
                });
            }
        }
        Ok(exits)
    }

    /// One periodic resync pass: drop ghosts, correct quantities downward to
    /// the venue's view, adopt positions that appeared since startup, and
    /// aggregate PnL.
    pub async fn resync_once(&self) -> Result<ResyncReport> {
        let now = Utc::now();
        let book = self.broker.positions().await.context("Position listing failed")?;
        let holdings = self.broker.holdings().await.context("Holdings listing failed")?;
        let view = merge_broker_view(&book, &holdings);

        let mut report = ResyncReport::default();

        for position in self.store.list().await {
            match view.get(&position.ticker) {
                None => {
                    // Tracked locally, gone remotely: ghost. Removed without
                    // emitting an order.
                    self.store.remove_all(&position.ticker).await;
                    info!(ticker = %position.ticker, "Ghost position removed");
                    report.ghosts.push(position.ticker.clone());
                }
                Some(v) if v.quantity < position.quantity => {
                    // Partial sell not yet reflected locally; the venue wins.
                    self.store.set_quantity(&position.ticker, v.quantity).await;
                    info!(
                        ticker = %position.ticker,
                        local = position.quantity,
                        broker = v.quantity,
                        "Quantity corrected to broker view"
                    );
                    report.corrected.push(position.ticker.clone());
                }
                Some(_) => {}
            }
        }

        // Positions opened since startup (the entry side keeps buying).
        for (ticker, broker_view) in &view {
            if self.store.get(ticker).await.is_none() {
                self.reconstruct_ticker(ticker, broker_view, now).await;
                report.adopted.push(ticker.clone());
            }
        }

        let tracked = self.store.tickers().await;
        report.unrealized_pnl = tracked
            .iter()
            .filter_map(|t| view.get(t))
            .map(|v| v.pnl)
            .sum();
        report.realized_pnl = book
            .day
            .iter()
            .filter(|entry| entry.quantity <= 0)
            .map(|entry| entry.pnl)
            .sum();

        info!(
            tracked = tracked.len(),
            ghosts = report.ghosts.len(),
            corrected = report.corrected.len(),
            adopted = report.adopted.len(),
            unrealized = %report.unrealized_pnl,
            realized = %report.realized_pnl,
            "Resync complete"
        );
        Ok(report)
    }
}

fn entered_today(entry_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    entry_time.with_timezone(&Kolkata).date_naive() == now.with_timezone(&Kolkata).date_naive()
}
