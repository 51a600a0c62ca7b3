//! In-memory position store: tracked positions plus the per-ticker caches
//! derived from them (last price, stop state, momentum baseline).
//!
//! One lock guards one `Inner` holding every map, so removal cascades
//! atomically across all of them and is idempotent. Both long-lived workers
//! mutate ticker state exclusively through the operations here; the lock is
//! held for memory mutation only, never across a network call.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::models::{MomentumState, StopState, TrackedPosition, TrancheKind};

#[derive(Default)]
struct Inner {
    positions: HashMap<String, TrackedPosition>,
    prices: HashMap<String, Decimal>,
    stops: HashMap<String, StopState>,
    momentum: HashMap<String, MomentumState>,
}

/// Result of applying a fill to a tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Quantity reached zero; the ticker was removed everywhere.
    Removed,
    /// Shares remain after the fill.
    Remaining(i64),
    /// The ticker was not tracked (already reconciled away).
    Untracked,
}

#[derive(Default)]
pub struct PositionStore {
    inner: RwLock<Inner>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, position: TrackedPosition) {
        let mut inner = self.inner.write().await;
        inner.positions.insert(position.ticker.clone(), position);
    }

    pub async fn get(&self, ticker: &str) -> Option<TrackedPosition> {
        self.inner.read().await.positions.get(ticker).cloned()
    }

    pub async fn list(&self) -> Vec<TrackedPosition> {
        self.inner.read().await.positions.values().cloned().collect()
    }

    pub async fn tickers(&self) -> Vec<String> {
        self.inner.read().await.positions.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.positions.len()
    }

    /// Remove a ticker and every derived cache entry in one atomic step.
    /// Removing an untracked ticker is a no-op, not an error.
    pub async fn remove_all(&self, ticker: &str) -> bool {
        let mut inner = self.inner.write().await;
        let existed = inner.positions.remove(ticker).is_some();
        inner.prices.remove(ticker);
        inner.stops.remove(ticker);
        inner.momentum.remove(ticker);
        existed
    }

    /// Fold a price tick into the caches and the position-high. Returns the
    /// updated position snapshot, or `None` for untracked tickers.
    pub async fn observe_tick(&self, ticker: &str, price: Decimal) -> Option<TrackedPosition> {
        let mut inner = self.inner.write().await;
        let position = inner.positions.get_mut(ticker)?;
        position.observe_price(price);
        let snapshot = position.clone();
        inner.prices.insert(ticker.to_string(), price);
        Some(snapshot)
    }

    pub async fn last_price(&self, ticker: &str) -> Option<Decimal> {
        self.inner.read().await.prices.get(ticker).copied()
    }

    pub async fn stop(&self, ticker: &str) -> Option<StopState> {
        self.inner.read().await.stops.get(ticker).cloned()
    }

    /// Install stop state for a tracked ticker. Dropped silently when the
    /// position vanished in the meantime, so a slow refresh can never
    /// resurrect cache entries for a removed ticker.
    pub async fn set_stop(&self, ticker: &str, state: StopState) {
        let mut inner = self.inner.write().await;
        if inner.positions.contains_key(ticker) {
            inner.stops.insert(ticker.to_string(), state);
        }
    }

    pub async fn momentum(&self, ticker: &str) -> Option<MomentumState> {
        let inner = self.inner.read().await;
        if !inner.positions.contains_key(ticker) {
            return None;
        }
        Some(inner.momentum.get(ticker).cloned().unwrap_or_default())
    }

    pub async fn set_momentum(&self, ticker: &str, state: MomentumState) {
        let mut inner = self.inner.write().await;
        if inner.positions.contains_key(ticker) {
            inner.momentum.insert(ticker.to_string(), state);
        }
    }

    /// Set the pending flag for a ticker about to be enqueued. Refuses when
    /// an order is already outstanding, which is what keeps the
    /// one-queued-order-per-ticker invariant.
    pub async fn mark_pending(&self, ticker: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write().await;
        match inner.positions.get_mut(ticker) {
            Some(position) if position.pending_since.is_none() => {
                position.pending_since = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Clear the pending flag without recording a completed order (retry
    /// exhaustion path: the ticker becomes eligible again next cycle).
    pub async fn clear_pending(&self, ticker: &str) {
        let mut inner = self.inner.write().await;
        if let Some(position) = inner.positions.get_mut(ticker) {
            position.pending_since = None;
        }
    }

    pub async fn mark_trend_checked(&self, ticker: &str) {
        let mut inner = self.inner.write().await;
        if let Some(position) = inner.positions.get_mut(ticker) {
            position.trend_checked = true;
        }
    }

    /// Overwrite the live quantity after a reconciliation correction.
    pub async fn set_quantity(&self, ticker: &str, quantity: i64) {
        let mut inner = self.inner.write().await;
        if let Some(position) = inner.positions.get_mut(ticker) {
            position.quantity = quantity;
        }
    }

    /// Apply a confirmed fill: decrement quantity, clear the pending flag,
    /// stamp the cool-down timestamp, and mark the tranche as fired. Removes
    /// the ticker entirely when nothing remains.
    pub async fn apply_fill(
        &self,
        ticker: &str,
        filled: i64,
        tranche: Option<TrancheKind>,
        now: DateTime<Utc>,
    ) -> FillOutcome {
        let mut inner = self.inner.write().await;
        let Some(position) = inner.positions.get_mut(ticker) else {
            return FillOutcome::Untracked;
        };

        position.quantity = (position.quantity - filled).max(0);
        position.pending_since = None;
        position.last_order_at = Some(now);
        if let Some(kind) = tranche {
            position.tranches.mark(kind);
        }

        if position.quantity == 0 {
            inner.positions.remove(ticker);
            inner.prices.remove(ticker);
            inner.stops.remove(ticker);
            inner.momentum.remove(ticker);
            FillOutcome::Removed
        } else {
            FillOutcome::Remaining(inner.positions[ticker].quantity)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position(ticker: &str, quantity: i64) -> TrackedPosition {
        TrackedPosition::new(
            ticker.to_string(),
            quantity,
            dec!(100),
            Utc::now(),
            "CNC".to_string(),
        )
    }

    fn stop_state() -> StopState {
        StopState {
            atr: dec!(2),
            atr_pct: dec!(2),
            category: crate::models::VolatilityCategory::Low,
            multiplier: dec!(1),
            stop_distance: dec!(2),
            stop_price: dec!(98),
            high_at_set: dec!(100),
            last_refresh: Utc::now(),
        }
    }

    #[tokio::test]
    async fn remove_all_cascades_and_is_idempotent() {
        let store = PositionStore::new();
        store.upsert(position("INFY", 10)).await;
        store.observe_tick("INFY", dec!(101)).await;
        store.set_stop("INFY", stop_state()).await;
        store.set_momentum("INFY", MomentumState::default()).await;

        assert!(store.remove_all("INFY").await);
        assert!(store.get("INFY").await.is_none());
        assert!(store.last_price("INFY").await.is_none());
        assert!(store.stop("INFY").await.is_none());
        assert!(store.momentum("INFY").await.is_none());

        // Second removal is a no-op.
        assert!(!store.remove_all("INFY").await);
    }

    #[tokio::test]
    async fn caches_never_outlive_the_position() {
        let store = PositionStore::new();
        // No position tracked: cache writes are dropped.
        store.set_stop("TCS", stop_state()).await;
        store.set_momentum("TCS", MomentumState::default()).await;
        assert!(store.stop("TCS").await.is_none());
        assert!(store.momentum("TCS").await.is_none());
        assert!(store.observe_tick("TCS", dec!(50)).await.is_none());
    }

    #[tokio::test]
    async fn mark_pending_refuses_double_enqueue() {
        let store = PositionStore::new();
        store.upsert(position("SBIN", 10)).await;

        let now = Utc::now();
        assert!(store.mark_pending("SBIN", now).await);
        assert!(!store.mark_pending("SBIN", now).await);

        store.clear_pending("SBIN").await;
        assert!(store.mark_pending("SBIN", now).await);
    }

    #[tokio::test]
    async fn apply_fill_partial_then_full() {
        let store = PositionStore::new();
        store.upsert(position("HDFCBANK", 100)).await;
        store.mark_pending("HDFCBANK", Utc::now()).await;

        let outcome = store
            .apply_fill("HDFCBANK", 40, Some(TrancheKind::Target1), Utc::now())
            .await;
        assert_eq!(outcome, FillOutcome::Remaining(60));

        let pos = store.get("HDFCBANK").await.unwrap();
        assert!(pos.pending_since.is_none());
        assert!(pos.last_order_at.is_some());
        assert!(pos.tranches.has_fired(TrancheKind::Target1));

        let outcome = store.apply_fill("HDFCBANK", 60, None, Utc::now()).await;
        assert_eq!(outcome, FillOutcome::Removed);
        assert!(store.get("HDFCBANK").await.is_none());

        let outcome = store.apply_fill("HDFCBANK", 10, None, Utc::now()).await;
        assert_eq!(outcome, FillOutcome::Untracked);
    }

    #[tokio::test]
    async fn quantity_never_goes_negative() {
        let store = PositionStore::new();
        store.upsert(position("ITC", 10)).await;
        // Over-fill (venue filled more than locally tracked): clamps to zero
        // and removes rather than going negative.
        let outcome = store.apply_fill("ITC", 25, None, Utc::now()).await;
        assert_eq!(outcome, FillOutcome::Removed);
    }
}
