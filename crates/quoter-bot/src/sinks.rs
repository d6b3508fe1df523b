//! Append-only data sinks.
//!
//! Structured records flow out through the `EventSink` trait: one record
//! per local fill, periodic reward snapshots per resting order, periodic
//! position snapshots. The CSV implementation lazily opens one file per
//! record kind; failures are logged and swallowed, a sink must never take
//! the trading core down.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use quoter_common::{PositionSnapshotRecord, RewardSnapshotRecord, TradeLogRecord};

const TRADES_FILE: &str = "trades.csv";
const REWARD_SNAPSHOTS_FILE: &str = "reward_snapshots.csv";
const POSITION_SNAPSHOTS_FILE: &str = "position_snapshots.csv";

/// Destination for the bot's structured records.
pub trait EventSink: Send + Sync {
    fn log_trade(&self, record: &TradeLogRecord);
    fn log_reward(&self, record: &RewardSnapshotRecord);
    fn log_position(&self, record: &PositionSnapshotRecord);
}

/// Sink that drops everything; used in tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn log_trade(&self, _record: &TradeLogRecord) {}
    fn log_reward(&self, _record: &RewardSnapshotRecord) {}
    fn log_position(&self, _record: &PositionSnapshotRecord) {}
}

/// CSV sink writing one file per record kind under an output directory.
pub struct CsvSink {
    dir: PathBuf,
    trades: Mutex<Option<csv::Writer<File>>>,
    rewards: Mutex<Option<csv::Writer<File>>>,
    positions: Mutex<Option<csv::Writer<File>>>,
}

impl CsvSink {
    /// Create the sink, making the output directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create sink directory {:?}", dir))?;
        Ok(Self {
            dir,
            trades: Mutex::new(None),
            rewards: Mutex::new(None),
            positions: Mutex::new(None),
        })
    }

    fn append<T: Serialize>(
        &self,
        slot: &Mutex<Option<csv::Writer<File>>>,
        file_name: &str,
        record: &T,
    ) {
        let mut guard = match slot.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            let path = self.dir.join(file_name);
            let needs_headers = !path.exists();
            let file = match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path.display(), "failed to open sink file: {e}");
                    return;
                }
            };
            *guard = Some(
                csv::WriterBuilder::new()
                    .has_headers(needs_headers)
                    .from_writer(file),
            );
        }
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = writer.serialize(record) {
                warn!(file_name, "failed to append sink record: {e}");
                return;
            }
            if let Err(e) = writer.flush() {
                warn!(file_name, "failed to flush sink file: {e}");
            }
        }
    }
}

impl EventSink for CsvSink {
    fn log_trade(&self, record: &TradeLogRecord) {
        self.append(&self.trades, TRADES_FILE, record);
    }

    fn log_reward(&self, record: &RewardSnapshotRecord) {
        self.append(&self.rewards, REWARD_SNAPSHOTS_FILE, record);
    }

    fn log_position(&self, record: &PositionSnapshotRecord) {
        self.append(&self.positions, POSITION_SNAPSHOTS_FILE, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use quoter_common::Side;
    use rust_decimal_macros::dec;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "quoter-sink-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_csv_sink_appends_trades() {
        let dir = temp_dir();
        let sink = CsvSink::new(&dir).unwrap();

        let record = TradeLogRecord {
            timestamp: Utc::now(),
            condition_id: "cond1".to_string(),
            token_id: "token1".to_string(),
            side: Side::Buy,
            price: dec!(0.50),
            size: dec!(40),
            trade_id: "t-1".to_string(),
            status: "MATCHED".to_string(),
            position_before: dec!(0),
            position_after: dec!(40),
        };
        sink.log_trade(&record);
        sink.log_trade(&record);

        let contents = std::fs::read_to_string(dir.join(TRADES_FILE)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        // Header plus two records
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("condition_id"));
        assert!(lines[1].contains("MATCHED"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_csv_sink_separate_files() {
        let dir = temp_dir();
        let sink = CsvSink::new(&dir).unwrap();

        sink.log_reward(&RewardSnapshotRecord {
            timestamp: Utc::now(),
            condition_id: "cond1".to_string(),
            token_id: "token1".to_string(),
            side: Side::Sell,
            price: dec!(0.55),
            size: dec!(40),
            distance_from_mid: dec!(0.04),
        });
        sink.log_position(&PositionSnapshotRecord {
            timestamp: Utc::now(),
            token_id: "token1".to_string(),
            size: dec!(40),
            avg_price: dec!(0.50),
            notional: dec!(20),
        });

        assert!(dir.join(REWARD_SNAPSHOTS_FILE).exists());
        assert!(dir.join(POSITION_SNAPSHOTS_FILE).exists());
        assert!(!dir.join(TRADES_FILE).exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
