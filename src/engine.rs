//! Engine runner: the poll loop, the resync timer, and the order worker,
//! wired together with cooperative shutdown.
//!
//! Each poll cycle: batch-fetch quotes for every tracked ticker, ratchet the
//! trailing stops, run the exit chain, and enqueue at most one exit request
//! per ticker. Reconciliation runs once at startup (with a gap check) and
//! then periodically on its own slower timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Asia::Kolkata;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::api::{batched_ltp, BrokerPort};
use crate::config::{EngineConfig, StopPolicyKind};
use crate::execution::OrderWorker;
use crate::models::{Candle, ExitRequest, StopState, TrackedPosition};
use crate::reconcile::{merge_broker_view, ReconciliationService};
use crate::records::OrderRecordStore;
use crate::risk::{
    ExitConditionEvaluator, ExitDecision, FileRegimeSource, FixedBucketPolicy, RegimeAwarePolicy,
    StopPolicy, TrailingStopTracker, VolatilityStopCalculator,
};
use crate::store::PositionStore;

/// How long shutdown waits for the workers to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Engine {
    config: EngineConfig,
    broker: Arc<dyn BrokerPort>,
    store: Arc<PositionStore>,
    tracker: Arc<TrailingStopTracker>,
    evaluator: ExitConditionEvaluator,
    reconciler: Arc<ReconciliationService>,
    /// Keep polling outside market hours (operator override).
    force: bool,
    shutdown: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl Engine {
    /// Construct the full component graph. Everything is owned here and torn
    /// down at shutdown; there is no ambient global state.
    pub fn new(
        config: EngineConfig,
        broker: Arc<dyn BrokerPort>,
        records: OrderRecordStore,
        force: bool,
    ) -> Self {
        let policy: Arc<dyn StopPolicy> = match (&config.stop_policy, &config.regime_signal_path) {
            (StopPolicyKind::Regime, Some(path)) => {
                Arc::new(RegimeAwarePolicy::new(Arc::new(FileRegimeSource::new(path))))
            }
            (StopPolicyKind::Regime, None) => {
                warn!("Regime policy selected without a signal path; using fixed buckets");
                Arc::new(FixedBucketPolicy)
            }
            (StopPolicyKind::Fixed, _) => Arc::new(FixedBucketPolicy),
        };

        let store = Arc::new(PositionStore::new());
        let tracker = Arc::new(TrailingStopTracker::new(
            VolatilityStopCalculator::new(policy),
            config.atr_refresh_interval(),
        ));
        let evaluator = ExitConditionEvaluator::new(config.clone());
        let reconciler = Arc::new(ReconciliationService::new(
            broker.clone(),
            store.clone(),
            tracker.clone(),
            records,
            config.clone(),
        ));

        Self {
            config,
            broker,
            store,
            tracker,
            evaluator,
            reconciler,
            force,
            shutdown: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until ctrl-c or the exchange close.
    pub async fn run(&self) -> Result<()> {
        // Auth probe: a bad session aborts before anything is tracked.
        let profile = self
            .broker
            .profile()
            .await
            .context("Broker authentication probe failed")?;
        info!(user = %profile.user_id, "Authenticated with broker");

        let (tx, rx) = mpsc::channel::<ExitRequest>(64);

        // Reconstruct state and submit any gap-down exits immediately.
        let gap_exits = self.reconciler.reconstruct().await?;
        info!(
            positions = self.store.len().await,
            gap_exits = gap_exits.len(),
            "Reconstruction complete"
        );

        let worker = OrderWorker::new(
            self.broker.clone(),
            self.store.clone(),
            self.config.clone(),
            rx,
        )
        .spawn();

        for request in gap_exits {
            self.enqueue(&tx, request).await;
        }

        let resync = self.spawn_resync();

        // Ctrl-c flips the shutdown flag; the loop notices on its next tick.
        let shutdown = self.shutdown.clone();
        let notify = self.stop_notify.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
            notify.notify_waiters();
        });

        let mut poll = interval(Duration::from_secs(self.config.poll_interval_secs));
        while !self.shutdown.load(Ordering::SeqCst) {
            poll.tick().await;

            if !self.force && !market_is_open(Utc::now()) {
                info!("Market closed; stopping");
                break;
            }

            if let Err(e) = self.cycle(&tx).await {
                // One bad cycle is not fatal; the next tick retries.
                error!(error = %e, "Poll cycle failed");
            }
        }

        // Cooperative shutdown: stop the resync timer, close the queue so
        // the worker drains its current item, then join both with a bound.
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        drop(tx);

        if timeout(SHUTDOWN_TIMEOUT, worker).await.is_err() {
            warn!("Order worker did not stop within the shutdown timeout");
        }
        if timeout(SHUTDOWN_TIMEOUT, resync).await.is_err() {
            warn!("Resync task did not stop within the shutdown timeout");
        }

        info!("Engine stopped");
        Ok(())
    }

    /// Periodic broker resync on its own timer; never blocks the poll loop.
    fn spawn_resync(&self) -> tokio::task::JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        let shutdown = self.shutdown.clone();
        let notify = self.stop_notify.clone();
        let period = Duration::from_secs(self.config.resync_interval_secs);

        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.tick().await; // the immediate first tick; startup already reconciled
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Err(e) = reconciler.resync_once().await {
                            warn!(error = %e, "Resync failed");
                        }
                    }
                    _ = notify.notified() => break,
                }
            }
            debug!("Resync task stopped");
        })
    }

    /// One poll cycle over every tracked ticker.
    async fn cycle(&self, tx: &mpsc::Sender<ExitRequest>) -> Result<()> {
        let tickers = self.store.tickers().await;
        if tickers.is_empty() {
            debug!("No tracked positions");
            return Ok(());
        }

        // One venue snapshot per cycle backs the existence guard for every
        // ticker.
        let book = self.broker.positions().await.context("Position snapshot failed")?;
        let holdings = self.broker.holdings().await.context("Holdings snapshot failed")?;
        let live = merge_broker_view(&book, &holdings);

        let quotes = batched_ltp(self.broker.as_ref(), &tickers, self.config.quote_batch_size)
            .await
            .context("Quote batch failed")?;

        let now = Utc::now();
        for ticker in &tickers {
            let Some(price) = quotes.get(ticker).copied() else {
                debug!(ticker = %ticker, "No quote this cycle");
                continue;
            };
            let Some(position) = self.store.observe_tick(ticker, price).await else {
                continue;
            };

            let stop = self.maintain_stop(ticker, &position, now).await;
            let intraday = self.latest_intraday(ticker, now).await;

            let Some(mut momentum) = self.store.momentum(ticker).await else {
                continue;
            };
            let evaluation = self.evaluator.evaluate(
                &position,
                stop.as_ref(),
                &mut momentum,
                price,
                live.get(ticker).map(|v| v.quantity),
                intraday.as_ref(),
                now,
            );
            self.store.set_momentum(ticker, momentum).await;
            if evaluation.trend_checked {
                self.store.mark_trend_checked(ticker).await;
            }

            match evaluation.decision {
                ExitDecision::Hold => {}
                ExitDecision::Remove => {
                    self.store.remove_all(ticker).await;
                    info!(ticker = %ticker, "Removed position absent at broker");
                }
                ExitDecision::Exit(request) => {
                    self.enqueue(tx, request).await;
                }
            }
        }

        Ok(())
    }

    /// Keep a ticker's stop state current: seed it when missing, refresh the
    /// ATR inputs on the daily throttle, and ratchet against the latest
    /// position-high. Data failures leave the previous stop untouched.
    async fn maintain_stop(
        &self,
        ticker: &str,
        position: &TrackedPosition,
        now: DateTime<Utc>,
    ) -> Option<StopState> {
        let existing = self.store.stop(ticker).await;

        let mut state = match existing {
            Some(mut state) => {
                if self.tracker.needs_refresh(&state, now) {
                    match self.fetch_daily(ticker, now).await {
                        Some(candles) => {
                            if let Err(e) = self.tracker.refresh(position, &mut state, &candles, now)
                            {
                                debug!(ticker = %ticker, error = %e, "ATR refresh skipped");
                            }
                        }
                        None => debug!(ticker = %ticker, "Daily candles unavailable for refresh"),
                    }
                }
                state
            }
            None => {
                // Seeding failed earlier (e.g. short history); keep trying.
                let candles = self.fetch_daily(ticker, now).await?;
                match self.tracker.seed(position, &candles, None, now) {
                    Ok(state) => state,
                    Err(e) => {
                        debug!(ticker = %ticker, error = %e, "Stop still unavailable");
                        return None;
                    }
                }
            }
        };

        self.tracker.on_tick(position, &mut state);
        self.store.set_stop(ticker, state.clone()).await;
        Some(state)
    }

    async fn fetch_daily(&self, ticker: &str, now: DateTime<Utc>) -> Option<Vec<Candle>> {
        let to = now.date_naive();
        let from = (now - chrono::Duration::days(90)).date_naive();
        match self.broker.daily_candles(ticker, from, to).await {
            Ok(candles) => Some(candles),
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "Daily candle fetch failed");
                None
            }
        }
    }

    /// Latest completed intraday candle, for the momentum and candle-length
    /// checks. `None` when the venue has nothing; the checks skip.
    async fn latest_intraday(&self, ticker: &str, now: DateTime<Utc>) -> Option<Candle> {
        let from = now - chrono::Duration::minutes(30);
        match self.broker.intraday_candles(ticker, from, now, 5).await {
            Ok(candles) => candles
                .into_iter()
                .filter(|c| c.timestamp <= now - chrono::Duration::minutes(5))
                .last(),
            Err(e) => {
                debug!(ticker = %ticker, error = %e, "Intraday candle fetch failed");
                None
            }
        }
    }

    /// Mark the ticker pending and hand the request to the order worker.
    /// The pending flag is what guarantees a single queued order per ticker.
    async fn enqueue(&self, tx: &mpsc::Sender<ExitRequest>, request: ExitRequest) {
        if !self.store.mark_pending(&request.ticker, Utc::now()).await {
            debug!(ticker = %request.ticker, "Exit already queued; dropping duplicate");
            return;
        }
        info!(
            ticker = %request.ticker,
            quantity = request.quantity,
            reason = request.reason.as_str(),
            "Exit queued"
        );
        if tx.send(request.clone()).await.is_err() {
            warn!(ticker = %request.ticker, "Order queue closed; clearing pending flag");
            self.store.clear_pending(&request.ticker).await;
        }
    }

    /// One-shot reconstruction used by the report command.
    pub async fn snapshot(&self) -> Result<Vec<ReportRow>> {
        self.reconciler.reconstruct().await?;
        let mut rows = Vec::new();
        for position in self.store.list().await {
            let stop = self.store.stop(&position.ticker).await;
            let last_price = self.store.last_price(&position.ticker).await;
            rows.push(ReportRow {
                position,
                stop,
                last_price,
            });
        }
        rows.sort_by(|a, b| a.position.ticker.cmp(&b.position.ticker));
        Ok(rows)
    }
}

/// One line of the `report` command output.
pub struct ReportRow {
    pub position: TrackedPosition,
    pub stop: Option<StopState>,
    pub last_price: Option<rust_decimal::Decimal>,
}

/// Whether the exchange is currently in its regular session
/// (09:15–15:30 IST, weekdays).
pub fn market_is_open(now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&Kolkata);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minutes = local.hour() * 60 + local.minute();
    (9 * 60 + 15..15 * 60 + 30).contains(&minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, VolatilityCategory};
    use crate::testutil::MockBroker;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn engine(broker: Arc<MockBroker>) -> Engine {
        Engine::new(
            EngineConfig::default(),
            broker,
            OrderRecordStore::new(None),
            false,
        )
    }

    async fn seed_position(engine: &Engine, ticker: &str, entry: Decimal, stop: Decimal) {
        engine
            .store
            .upsert(TrackedPosition::new(
                ticker.to_string(),
                100,
                entry,
                Utc::now() - chrono::Duration::days(2),
                "CNC".to_string(),
            ))
            .await;
        engine
            .store
            .set_stop(
                ticker,
                StopState {
                    atr: dec!(2),
                    atr_pct: dec!(2),
                    category: VolatilityCategory::Low,
                    multiplier: dec!(1),
                    stop_distance: dec!(2),
                    stop_price: stop,
                    high_at_set: entry,
                    last_refresh: Utc::now(),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn cycle_enqueues_stop_breach_once() {
        let broker = Arc::new(MockBroker::new());
        broker.holding("RELIANCE", 100, 0, dec!(95));
        broker.quote("RELIANCE", dec!(97));

        let engine = engine(broker);
        // Entry 95: 97 is still up 2.1%, so only the stop at 98 can trigger.
        seed_position(&engine, "RELIANCE", dec!(95), dec!(98)).await;

        let (tx, mut rx) = mpsc::channel(8);
        engine.cycle(&tx).await.unwrap();

        let request = rx.try_recv().unwrap();
        assert_eq!(request.reason, ExitReason::StopBreach);
        assert_eq!(request.ticker, "RELIANCE");

        // Second cycle at the same price: the pending flag suppresses a
        // duplicate submission.
        engine.cycle(&tx).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cycle_removes_positions_the_broker_dropped() {
        let broker = Arc::new(MockBroker::new());
        // No holdings at the broker, but a quote exists.
        broker.quote("GHOST", dec!(50));

        let engine = engine(broker.clone());
        seed_position(&engine, "GHOST", dec!(50), dec!(48)).await;

        let (tx, mut rx) = mpsc::channel(8);
        engine.cycle(&tx).await.unwrap();

        assert!(engine.store.get("GHOST").await.is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.placed_count(), 0);
    }

    #[tokio::test]
    async fn cycle_skips_tickers_without_quotes() {
        let broker = Arc::new(MockBroker::new());
        broker.holding("INFY", 100, 0, dec!(1500));

        let engine = engine(broker);
        seed_position(&engine, "INFY", dec!(1500), dec!(1480)).await;

        let (tx, mut rx) = mpsc::channel(8);
        engine.cycle(&tx).await.unwrap();
        assert!(rx.try_recv().is_err());

        // The stop survives the quiet cycle untouched.
        assert_eq!(engine.store.stop("INFY").await.unwrap().stop_price, dec!(1480));
    }

    #[test]
    fn market_hours_gate() {
        // Friday 10:00 IST.
        let open = Kolkata
            .with_ymd_and_hms(2026, 8, 7, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(market_is_open(open));

        // Friday 15:30 IST: the close itself is out.
        let close = Kolkata
            .with_ymd_and_hms(2026, 8, 7, 15, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(!market_is_open(close));

        // Friday 09:14 IST: pre-open.
        let early = Kolkata
            .with_ymd_and_hms(2026, 8, 7, 9, 14, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(!market_is_open(early));

        // Saturday midday.
        let weekend = Kolkata
            .with_ymd_and_hms(2026, 8, 8, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(!market_is_open(weekend));
    }
}
