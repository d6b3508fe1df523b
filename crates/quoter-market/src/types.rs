//! Wire types for the public CLOB websocket.
//!
//! Prices and sizes arrive as strings and are parsed into `Decimal`
//! at the boundary.

use serde::{Deserialize, Serialize};

/// Initial subscription message for the market channel.
#[derive(Debug, Serialize)]
pub struct SubscribeMessage {
    pub assets_ids: Vec<String>,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

/// Incremental subscription operation on an open connection.
#[derive(Debug, Serialize)]
pub struct SubscriptionOp {
    pub assets_ids: Vec<String>,
    pub operation: &'static str,
}

/// One price level in a book snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderSummary {
    pub price: String,
    pub size: String,
}

/// Full orderbook snapshot (`event_type == "book"`).
#[derive(Debug, Clone, Deserialize)]
pub struct BookMessage {
    pub event_type: String,
    pub asset_id: String,
    /// Condition ID of the owning market.
    pub market: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub bids: Vec<OrderSummary>,
    pub asks: Vec<OrderSummary>,
}

/// One delta inside a `price_change` message.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChange {
    pub price: String,
    pub size: String,
    pub side: String,
}

/// Delta message (`event_type == "price_change"`).
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeMessage {
    pub event_type: String,
    pub asset_id: String,
    pub market: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Newer payloads use `price_changes`, older ones `changes`.
    #[serde(default, alias = "changes")]
    pub price_changes: Vec<PriceChange>,
}

/// Minimal probe used to dispatch on `event_type`.
#[derive(Debug, Deserialize)]
pub struct GenericMessage {
    pub event_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_message_parsing() {
        let json = r#"{
            "event_type": "book",
            "asset_id": "token123",
            "market": "cond456",
            "timestamp": "1704067200000",
            "bids": [{"price": "0.45", "size": "100"}],
            "asks": [{"price": "0.55", "size": "150"}]
        }"#;

        let book: BookMessage = serde_json::from_str(json).unwrap();
        assert_eq!(book.event_type, "book");
        assert_eq!(book.asset_id, "token123");
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.asks.len(), 1);
    }

    #[test]
    fn test_price_change_message_parsing() {
        let json = r#"{
            "event_type": "price_change",
            "asset_id": "token123",
            "market": "cond456",
            "price_changes": [
                {"price": "0.46", "size": "50", "side": "BUY"}
            ]
        }"#;

        let msg: PriceChangeMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.price_changes.len(), 1);
        assert_eq!(msg.price_changes[0].price, "0.46");
    }

    #[test]
    fn test_price_change_legacy_alias() {
        let json = r#"{
            "event_type": "price_change",
            "asset_id": "token123",
            "market": "cond456",
            "changes": [
                {"price": "0.46", "size": "0", "side": "SELL"}
            ]
        }"#;

        let msg: PriceChangeMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.price_changes.len(), 1);
    }

    #[test]
    fn test_subscribe_message_serialization() {
        let msg = SubscribeMessage {
            assets_ids: vec!["token1".to_string(), "token2".to_string()],
            msg_type: "market",
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"assets_ids\""));
        assert!(json.contains("\"type\":\"market\""));
    }
}
