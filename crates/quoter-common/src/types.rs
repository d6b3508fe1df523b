//! Shared types for the poly-quoter market-making bot.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side for trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Parse from the loose casing the exchange uses on the wire.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "BID" => Some(Side::Buy),
            "SELL" | "ASK" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Why a market was put to sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    /// Mark moved against the position beyond the stop-loss threshold.
    StopLoss,
    /// External volatility signal exceeded the profile threshold.
    Volatility,
}

impl std::fmt::Display for RiskReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskReason::StopLoss => write!(f, "stop_loss"),
            RiskReason::Volatility => write!(f, "volatility"),
        }
    }
}

/// One record per local fill, appended to the trade-log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLogRecord {
    /// Fill timestamp.
    pub timestamp: DateTime<Utc>,
    /// Condition ID of the market.
    pub condition_id: String,
    /// Token that was traded.
    pub token_id: String,
    /// BUY or SELL after maker/taker resolution.
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    /// Exchange trade ID.
    pub trade_id: String,
    /// Trade status at log time (MATCHED / CONFIRMED / FAILED).
    pub status: String,
    /// Position size before the fill was applied.
    #[serde(with = "rust_decimal::serde::str")]
    pub position_before: Decimal,
    /// Position size after the fill was applied.
    #[serde(with = "rust_decimal::serde::str")]
    pub position_after: Decimal,
}

/// Periodic snapshot of one resting order, for reward accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardSnapshotRecord {
    pub timestamp: DateTime<Utc>,
    pub condition_id: String,
    pub token_id: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    /// Distance from the book mid at snapshot time.
    #[serde(with = "rust_decimal::serde::str")]
    pub distance_from_mid: Decimal,
}

/// Periodic snapshot of one nonzero position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshotRecord {
    pub timestamp: DateTime<Utc>,
    pub token_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
    /// size * avg_price, in the stablecoin.
    #[serde(with = "rust_decimal::serde::str")]
    pub notional: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_side_parse() {
        assert_eq!(Side::parse("buy"), Some(Side::Buy));
        assert_eq!(Side::parse("BID"), Some(Side::Buy));
        assert_eq!(Side::parse("Sell"), Some(Side::Sell));
        assert_eq!(Side::parse("ask"), Some(Side::Sell));
        assert_eq!(Side::parse("hold"), None);
    }

    #[test]
    fn test_risk_reason_serde() {
        let json = serde_json::to_string(&RiskReason::StopLoss).unwrap();
        assert_eq!(json, "\"stop_loss\"");
        let back: RiskReason = serde_json::from_str("\"volatility\"").unwrap();
        assert_eq!(back, RiskReason::Volatility);
    }

    #[test]
    fn test_trade_log_record_serde() {
        let rec = TradeLogRecord {
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
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"side\":\"BUY\""));
        assert!(json.contains("\"price\":\"0.50\""));
    }
}
