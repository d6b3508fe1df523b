//! Risk evaluation and the durable risk-off registry.
//!
//! The evaluator is a pure function over a held position and the current
//! book; the registry records per-market pauses as one JSON file per
//! condition id so a restart cannot forget that a market is sleeping.

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use quoter_common::RiskReason;
use quoter_market::{BookTop, StrategyParameters};

use crate::position::Position;

/// Evaluate whether a held position should trip risk-off.
///
/// Stop-loss: unrealized pnl percent against the mid below the threshold,
/// but only while the book is tight enough for the mark to mean anything.
/// Volatility: the external scalar exceeding the profile ceiling.
pub fn evaluate(
    position: &Position,
    top: BookTop,
    volatility: Decimal,
    params: &StrategyParameters,
) -> Option<RiskReason> {
    let avg = position.avg_price?;
    if position.is_empty() || avg <= Decimal::ZERO {
        return None;
    }

    if volatility > params.volatility_threshold {
        return Some(RiskReason::Volatility);
    }

    let mid = top.mid();
    let pnl_pct = (mid - avg) / avg * Decimal::ONE_HUNDRED;
    if pnl_pct < params.stop_loss_threshold && top.spread() <= params.spread_threshold {
        return Some(RiskReason::StopLoss);
    }

    None
}

/// Errors from the risk-off registry's persistence.
#[derive(Debug, Error)]
pub enum RiskOffError {
    #[error("risk-off I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("risk-off record parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Durable record of a tripped market.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskOffRecord {
    /// Unix seconds until which the market stays paused.
    pub sleep_until_epoch: i64,
    pub reason: RiskReason,
}

impl RiskOffRecord {
    pub fn sleep_until(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.sleep_until_epoch, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Per-market risk-off registry, cached in memory and persisted as one
/// JSON file per condition id. Writes go through a temp file and an
/// atomic rename.
#[derive(Debug)]
pub struct RiskOffRegistry {
    dir: PathBuf,
    records: DashMap<String, RiskOffRecord>,
}

impl RiskOffRegistry {
    /// Open the registry, creating the directory and loading any existing
    /// records. Unreadable files are skipped with a warning.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RiskOffError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let records = DashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let condition_id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            match std::fs::read_to_string(&path)
                .map_err(RiskOffError::from)
                .and_then(|raw| serde_json::from_str::<RiskOffRecord>(&raw).map_err(Into::into))
            {
                Ok(record) => {
                    records.insert(condition_id, record);
                }
                Err(e) => warn!(path = %path.display(), "skipping unreadable risk-off record: {e}"),
            }
        }
        info!(count = records.len(), dir = %dir.display(), "loaded risk-off records");
        Ok(Self { dir, records })
    }

    fn path_for(&self, condition_id: &str) -> PathBuf {
        self.dir.join(format!("{condition_id}.json"))
    }

    /// Whether the market is currently paused.
    pub fn is_sleeping(&self, condition_id: &str, now: DateTime<Utc>) -> bool {
        self.records
            .get(condition_id)
            .is_some_and(|r| r.sleep_until() > now)
    }

    /// The current record, if any.
    pub fn get(&self, condition_id: &str) -> Option<RiskOffRecord> {
        self.records.get(condition_id).map(|r| *r)
    }

    /// Pause a market until `sleep_until` and persist the record.
    pub fn trip(
        &self,
        condition_id: &str,
        reason: RiskReason,
        sleep_until: DateTime<Utc>,
    ) -> Result<(), RiskOffError> {
        let record = RiskOffRecord {
            sleep_until_epoch: sleep_until.timestamp(),
            reason,
        };
        self.records.insert(condition_id.to_string(), record);

        let path = self.path_for(condition_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        std::fs::rename(&tmp, &path)?;
        info!(condition_id, %reason, sleep_until = %sleep_until, "market tripped risk-off");
        Ok(())
    }

    /// Remove an expired record; the market resumes quoting.
    pub fn clear(&self, condition_id: &str) -> Result<(), RiskOffError> {
        if self.records.remove(condition_id).is_some() {
            let path = self.path_for(condition_id);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            info!(condition_id, "risk-off record cleared");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn params() -> StrategyParameters {
        StrategyParameters {
            stop_loss_threshold: dec!(-5),
            take_profit_threshold: dec!(10),
            volatility_threshold: dec!(20),
            spread_threshold: dec!(0.02),
            sleep_period_hours: 4,
        }
    }

    fn top(bid: Decimal, ask: Decimal) -> BookTop {
        BookTop {
            best_bid: bid,
            best_bid_size: dec!(100),
            best_ask: ask,
            best_ask_size: dec!(100),
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "quoter-riskoff-{tag}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_no_position_no_trigger() {
        let position = Position::default();
        assert_eq!(
            evaluate(&position, top(dec!(0.40), dec!(0.41)), dec!(50), &params()),
            None
        );
    }

    #[test]
    fn test_volatility_trigger() {
        let position = Position::new(dec!(40), dec!(0.50));
        assert_eq!(
            evaluate(&position, top(dec!(0.50), dec!(0.52)), dec!(30), &params()),
            Some(RiskReason::Volatility)
        );
    }

    #[test]
    fn test_stop_loss_trigger_requires_tight_spread() {
        let position = Position::new(dec!(40), dec!(0.50));
        // mid 0.44 -> pnl -12% < -5%, spread 0.02 <= threshold
        assert_eq!(
            evaluate(&position, top(dec!(0.43), dec!(0.45)), dec!(5), &params()),
            Some(RiskReason::StopLoss)
        );
        // Same mark but wide spread: no trigger
        assert_eq!(
            evaluate(&position, top(dec!(0.40), dec!(0.48)), dec!(5), &params()),
            None
        );
    }

    #[test]
    fn test_small_drawdown_no_trigger() {
        let position = Position::new(dec!(40), dec!(0.50));
        // mid 0.49 -> pnl -2% within threshold
        assert_eq!(
            evaluate(&position, top(dec!(0.48), dec!(0.50)), dec!(5), &params()),
            None
        );
    }

    #[test]
    fn test_registry_trip_persist_reload() {
        let dir = temp_dir("reload");
        let registry = RiskOffRegistry::open(&dir).unwrap();

        let until = Utc::now() + chrono::Duration::hours(4);
        registry
            .trip("cond1", RiskReason::Volatility, until)
            .unwrap();
        assert!(registry.is_sleeping("cond1", Utc::now()));

        // A fresh registry over the same directory sees the record
        let reloaded = RiskOffRegistry::open(&dir).unwrap();
        assert!(reloaded.is_sleeping("cond1", Utc::now()));
        assert_eq!(reloaded.get("cond1").unwrap().reason, RiskReason::Volatility);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_registry_expiry_and_clear() {
        let dir = temp_dir("expiry");
        let registry = RiskOffRegistry::open(&dir).unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        registry.trip("cond1", RiskReason::StopLoss, past).unwrap();
        // Expired record: not sleeping, but still present until cleared
        assert!(!registry.is_sleeping("cond1", Utc::now()));
        assert!(registry.get("cond1").is_some());

        registry.clear("cond1").unwrap();
        assert!(registry.get("cond1").is_none());
        assert!(registry.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_registry_skips_garbage_files() {
        let dir = temp_dir("garbage");
        std::fs::write(dir.join("broken.json"), b"{not json").unwrap();

        let registry = RiskOffRegistry::open(&dir).unwrap();
        assert!(registry.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
