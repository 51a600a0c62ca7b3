//! Order execution queue: a single consumer draining exit requests in
//! arrival order, submitting each to the venue with classification-driven
//! retries, and settling position state idempotently.
//!
//! Retries are an explicit bounded state machine: an attempt counter plus
//! jittered exponential delays. Tick-size corrections retry immediately
//! under their own small cap; rate limits and transient failures consume
//! the backoff budget; terminal classifications update the store at once.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{BrokerPort, SellOrder};
use crate::config::EngineConfig;
use crate::error::OrderErrorKind;
use crate::models::{round_down_to_tick, ExitPrice, ExitRequest, QueuedOrder};
use crate::store::{FillOutcome, PositionStore};

pub struct OrderWorker {
    broker: Arc<dyn BrokerPort>,
    store: Arc<PositionStore>,
    config: EngineConfig,
    rx: mpsc::Receiver<ExitRequest>,
}

impl OrderWorker {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        store: Arc<PositionStore>,
        config: EngineConfig,
        rx: mpsc::Receiver<ExitRequest>,
    ) -> Self {
        Self {
            broker,
            store,
            config,
            rx,
        }
    }

    /// Consume the queue until every sender is dropped, then drain and stop.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = self.rx.recv().await {
                self.process(QueuedOrder::new(request)).await;
            }
            info!("Order worker drained and stopped");
        })
    }

    async fn process(&self, mut order: QueuedOrder) {
        let ticker = order.request.ticker.clone();
        info!(
            id = %order.id,
            ticker = %ticker,
            quantity = order.request.quantity,
            reason = order.request.reason.as_str(),
            tranche = ?order.request.tranche,
            "Processing exit order"
        );

        if self.config.dry_run {
            info!(ticker = %ticker, "[DRY RUN] Would submit exit order");
            self.settle(&order).await;
            return;
        }

        let mut limit_price = match order.request.price {
            ExitPrice::Limit(price) => Some(round_down_to_tick(price, self.config.tick_size)),
            ExitPrice::Market => None,
        };
        let mut delays = self.backoff();

        loop {
            let sell = SellOrder {
                tradingsymbol: ticker.clone(),
                exchange: self.config.exchange.clone(),
                product: self.config.product.clone(),
                quantity: order.request.quantity,
                price: limit_price,
                tag: order.request.reason.as_str().to_string(),
            };

            let err = match self.broker.place_sell(&sell).await {
                Ok(receipt) => {
                    info!(
                        ticker = %ticker,
                        order_id = %receipt.order_id,
                        attempts = order.attempts + 1,
                        "Exit order placed"
                    );
                    self.settle(&order).await;
                    return;
                }
                Err(err) => err,
            };

            match err.order_kind() {
                OrderErrorKind::Duplicate => {
                    // The venue already has this exit; nothing more to send.
                    info!(ticker = %ticker, "Order already at venue; treating as success");
                    let tracked = self.store.get(&ticker).await.map(|p| p.quantity).unwrap_or(0);
                    if order.request.quantity >= tracked {
                        self.store.remove_all(&ticker).await;
                    } else {
                        self.store.clear_pending(&ticker).await;
                    }
                    return;
                }
                OrderErrorKind::InsufficientHoldings => {
                    info!(ticker = %ticker, "Nothing left to sell at venue; removing position");
                    self.store.remove_all(&ticker).await;
                    return;
                }
                OrderErrorKind::TickSizeMismatch { tick: Some(tick) }
                    if order.tick_retries < self.config.tick_retry_cap
                        && limit_price.is_some() =>
                {
                    order.tick_retries += 1;
                    let corrected = round_down_to_tick(limit_price.unwrap(), tick);
                    debug!(
                        ticker = %ticker,
                        tick = %tick,
                        price = %corrected,
                        "Re-rounding limit to venue tick"
                    );
                    limit_price = Some(corrected);
                    // Immediate retry; does not consume the backoff budget.
                }
                kind @ (OrderErrorKind::RateLimited
                | OrderErrorKind::Transient
                | OrderErrorKind::TickSizeMismatch { .. }) => {
                    order.attempts += 1;
                    order.last_error = Some(err.to_string());

                    if order.attempts >= self.config.retry_budget {
                        // Not terminal for the position: clearing the flag
                        // makes it eligible again on the next cycle.
                        error!(
                            id = %order.id,
                            ticker = %ticker,
                            attempts = order.attempts,
                            last_error = %err,
                            "Exit order failed after retry budget; will re-evaluate next cycle"
                        );
                        self.store.clear_pending(&ticker).await;
                        return;
                    }

                    let delay = delays
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.config.backoff_base_ms));
                    warn!(
                        ticker = %ticker,
                        attempt = order.attempts,
                        kind = ?kind,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Order attempt failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Apply the fill to the store: decrement, clear pending, mark tranche,
    /// remove when nothing remains.
    async fn settle(&self, order: &QueuedOrder) {
        let outcome = self
            .store
            .apply_fill(
                &order.request.ticker,
                order.request.quantity,
                order.request.tranche,
                Utc::now(),
            )
            .await;
        match outcome {
            FillOutcome::Removed => {
                info!(ticker = %order.request.ticker, "Position fully exited and removed")
            }
            FillOutcome::Remaining(quantity) => {
                info!(ticker = %order.request.ticker, remaining = quantity, "Partial exit settled")
            }
            FillOutcome::Untracked => {
                warn!(ticker = %order.request.ticker, "Fill for an untracked position ignored")
            }
        }
    }

    /// Jittered exponential delays for the transient-failure path.
    fn backoff(&self) -> ExponentialBackoff {
        let base = Duration::from_millis(self.config.backoff_base_ms);
        ExponentialBackoff {
            current_interval: base,
            initial_interval: base,
            multiplier: self.config.backoff_growth,
            randomization_factor: 0.25,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}
