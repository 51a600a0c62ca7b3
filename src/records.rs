//! Historical order records: append-only JSON-lines files, one per day,
//! written by the entry side of the account. Reconciliation reads them at
//! startup to recover entry price, entry time, and any stop recorded on the
//! original order. Nothing here writes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One fill from the account's order log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub ticker: String,
    pub side: RecordSide,
    pub quantity: i64,
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
    /// Stop-loss attached to the original order, if any.
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    /// Target attached to the original order, if any.
    #[serde(default)]
    pub target: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordSide {
    Buy,
    Sell,
}

/// Read-only view over a directory of day files plus an optional extra seed
/// file passed on the command line.
pub struct OrderRecordStore {
    dir: Option<PathBuf>,
    seeded: Vec<OrderRecord>,
}

impl OrderRecordStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            seeded: Vec::new(),
        }
    }

    /// Load one extra record file (same JSONL format) into the store.
    pub fn seed_from_file(&mut self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read order records from {}", path.display()))?;
        let records = parse_lines(&raw, path);
        let count = records.len();
        self.seeded.extend(records);
        Ok(count)
    }

    /// Earliest buy fill for a ticker at or after `since`. This is the entry
    /// the position is reconstructed from; `None` sends the caller to the
    /// conservative lookback fallback.
    pub fn earliest_buy(&self, ticker: &str, since: DateTime<Utc>) -> Option<OrderRecord> {
        let mut best: Option<OrderRecord> = None;

        let mut consider = |record: &OrderRecord| {
            if record.ticker != ticker || record.side != RecordSide::Buy || record.filled_at < since
            {
                return;
            }
            match &best {
                Some(current) if current.filled_at <= record.filled_at => {}
                _ => best = Some(record.clone()),
            }
        };

        for record in &self.seeded {
            consider(record);
        }

        if let Some(dir) = &self.dir {
            let mut date = since.date_naive();
            let today = Utc::now().date_naive();
            while date <= today {
                let path = dir.join(format!("orders-{}.jsonl", date.format("%Y-%m-%d")));
                if let Ok(raw) = std::fs::read_to_string(&path) {
                    for record in parse_lines(&raw, &path) {
                        consider(&record);
                    }
                } else {
                    debug!(path = %path.display(), "No order-record file for day");
                }
                date += Duration::days(1);
            }
        }

        best
    }
}

fn parse_lines(raw: &str, path: &Path) -> Vec<OrderRecord> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<OrderRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unparseable order record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(ticker: &str, side: RecordSide, days_ago: i64, price: Decimal) -> String {
        let filled_at = Utc::now() - Duration::days(days_ago);
        serde_json::to_string(&OrderRecord {
            ticker: ticker.to_string(),
            side,
            quantity: 100,
            price,
            filled_at,
            stop_loss: Some(price - dec!(2)),
            target: None,
        })
        .unwrap()
    }

    fn store_with_dir(lines_by_days_ago: &[(i64, String)]) -> (OrderRecordStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("trailguard-records-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for (days_ago, line) in lines_by_days_ago {
            let date = (Utc::now() - Duration::days(*days_ago)).date_naive();
            let path = dir.join(format!("orders-{}.jsonl", date.format("%Y-%m-%d")));
            let mut content = std::fs::read_to_string(&path).unwrap_or_default();
            content.push_str(line);
            content.push('\n');
            std::fs::write(&path, content).unwrap();
        }
        (OrderRecordStore::new(Some(dir.clone())), dir)
    }

    #[test]
    fn earliest_buy_wins_over_later_fills() {
        let (store, dir) = store_with_dir(&[
            (5, record("INFY", RecordSide::Buy, 5, dec!(1500))),
            (2, record("INFY", RecordSide::Buy, 2, dec!(1550))),
            (3, record("INFY", RecordSide::Sell, 3, dec!(1520))),
            (4, record("TCS", RecordSide::Buy, 4, dec!(3900))),
        ]);

        let hit = store
            .earliest_buy("INFY", Utc::now() - Duration::days(30))
            .unwrap();
        assert_eq!(hit.price, dec!(1500));
        assert_eq!(hit.stop_loss, Some(dec!(1498)));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn fills_before_the_window_are_ignored() {
        let (store, dir) = store_with_dir(&[(5, record("INFY", RecordSide::Buy, 5, dec!(1500)))]);

        assert!(store
            .earliest_buy("INFY", Utc::now() - Duration::days(2))
            .is_none());

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn seed_file_participates_and_bad_lines_are_skipped() {
        let path = std::env::temp_dir().join(format!("trailguard-seed-{}.jsonl", uuid::Uuid::new_v4()));
        let mut content = record("SBIN", RecordSide::Buy, 1, dec!(820));
        content.push('\n');
        content.push_str("not json at all\n");
        std::fs::write(&path, content).unwrap();

        let mut store = OrderRecordStore::new(None);
        let count = store.seed_from_file(&path).unwrap();
        assert_eq!(count, 1);
        assert!(store
            .earliest_buy("SBIN", Utc::now() - Duration::days(30))
            .is_some());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_directory_is_not_an_error() {
        let store = OrderRecordStore::new(Some(PathBuf::from("/nonexistent/trailguard")));
        assert!(store
            .earliest_buy("INFY", Utc::now() - Duration::days(3))
            .is_none());
    }
}
