//! Shared types for the poly-quoter workspace.

pub mod types;

pub use types::{PositionSnapshotRecord, RewardSnapshotRecord, RiskReason, Side, TradeLogRecord};
