//! In-memory order book state.
//!
//! Each token carries two ordered price->size mappings fed by snapshot and
//! delta events from the market websocket. The store is keyed by token and
//! guarded per entry; writers are the owning stream handler, readers take a
//! cheap top-of-book copy while the lock is held.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::warn;

use quoter_common::Side;

use crate::types::{BookMessage, PriceChangeMessage};

/// Ordered bid/ask levels for a single token.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    /// Bid levels, price -> size. Best bid is the max key.
    pub bids: BTreeMap<Decimal, Decimal>,
    /// Ask levels, price -> size. Best ask is the min key.
    pub asks: BTreeMap<Decimal, Decimal>,
    /// Last update timestamp, from the wire when present.
    pub last_update: Option<DateTime<Utc>>,
}

/// Best bid/ask and the sizes resting there.
///
/// A crossed book (best_bid >= best_ask) is passed through as-is; callers
/// that care gate on the spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookTop {
    pub best_bid: Decimal,
    pub best_bid_size: Decimal,
    pub best_ask: Decimal,
    pub best_ask_size: Decimal,
}

impl BookTop {
    /// `best_ask - best_bid`; negative when crossed.
    pub fn spread(&self) -> Decimal {
        self.best_ask - self.best_bid
    }

    /// Midpoint of the top of book.
    pub fn mid(&self) -> Decimal {
        (self.best_bid + self.best_ask) / Decimal::TWO
    }
}

impl OrderBook {
    /// Replace all levels from a full snapshot.
    pub fn apply_snapshot(&mut self, msg: &BookMessage) {
        self.bids.clear();
        self.asks.clear();

        for level in &msg.bids {
            if let (Ok(price), Ok(size)) = (level.price.parse(), level.size.parse()) {
                insert_level(&mut self.bids, price, size);
            }
        }
        for level in &msg.asks {
            if let (Ok(price), Ok(size)) = (level.price.parse(), level.size.parse()) {
                insert_level(&mut self.asks, price, size);
            }
        }

        self.last_update = msg.timestamp.as_deref().and_then(parse_timestamp);
    }

    /// Apply a single delta. A size of zero removes the level.
    ///
    /// Negative sizes are invariant violations from upstream; the delta is
    /// dropped with a warning rather than poisoning the book.
    pub fn apply_delta(&mut self, side: Side, price: Decimal, size: Decimal) {
        if size < Decimal::ZERO {
            warn!(%price, %size, "dropping delta with negative size");
            return;
        }
        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        if size.is_zero() {
            levels.remove(&price);
        } else {
            levels.insert(price, size);
        }
    }

    /// Top of book, or `None` when either side is empty.
    pub fn top(&self) -> Option<BookTop> {
        let (bid, bid_size) = self.bids.iter().next_back()?;
        let (ask, ask_size) = self.asks.iter().next()?;
        Some(BookTop {
            best_bid: *bid,
            best_bid_size: *bid_size,
            best_ask: *ask,
            best_ask_size: *ask_size,
        })
    }

    /// Size resting at an exact price level, zero if absent.
    pub fn size_at(&self, side: Side, price: Decimal) -> Decimal {
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels.get(&price).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

fn insert_level(levels: &mut BTreeMap<Decimal, Decimal>, price: Decimal, size: Decimal) {
    if size > Decimal::ZERO {
        levels.insert(price, size);
    }
}

/// Parse a millisecond-epoch string timestamp.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    ts.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Concurrent per-token book store.
///
/// Writers hold the per-token lock only for the duration of a snapshot or
/// delta application; readers copy the top of book out under the read lock.
#[derive(Debug, Default)]
pub struct BookStore {
    books: DashMap<String, RwLock<OrderBook>>,
}

impl BookStore {
    pub fn new() -> Self {
        Self {
            books: DashMap::new(),
        }
    }

    /// Apply a full snapshot for a token, creating the book if needed.
    pub fn apply_snapshot(&self, msg: &BookMessage) {
        let entry = self
            .books
            .entry(msg.asset_id.clone())
            .or_insert_with(|| RwLock::new(OrderBook::default()));
        entry.write().apply_snapshot(msg);
    }

    /// Apply every delta in a `price_change` message in arrival order.
    pub fn apply_price_changes(&self, msg: &PriceChangeMessage) {
        let entry = self
            .books
            .entry(msg.asset_id.clone())
            .or_insert_with(|| RwLock::new(OrderBook::default()));
        let mut book = entry.write();
        for change in &msg.price_changes {
            let side = match Side::parse(&change.side) {
                Some(s) => s,
                None => {
                    warn!(side = %change.side, "unknown side in price change");
                    continue;
                }
            };
            let (price, size) = match (change.price.parse(), change.size.parse()) {
                (Ok(p), Ok(s)) => (p, s),
                _ => {
                    warn!(price = %change.price, size = %change.size, "unparseable delta");
                    continue;
                }
            };
            book.apply_delta(side, price, size);
        }
        if let Some(ts) = msg.timestamp.as_deref().and_then(parse_timestamp) {
            book.last_update = Some(ts);
        }
    }

    /// Top of book for a token, `None` when unknown or one-sided.
    pub fn top(&self, token_id: &str) -> Option<BookTop> {
        self.books.get(token_id).and_then(|b| b.read().top())
    }

    /// Full copy of a token's book, for snapshot sinks and diagnostics.
    pub fn snapshot(&self, token_id: &str) -> Option<OrderBook> {
        self.books.get(token_id).map(|b| b.read().clone())
    }

    /// Drop books for tokens no longer subscribed.
    pub fn retain_tokens(&self, keep: &std::collections::HashSet<String>) {
        self.books.retain(|token, _| keep.contains(token));
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSummary, PriceChange};
    use rust_decimal_macros::dec;

    fn book_msg(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> BookMessage {
        BookMessage {
            event_type: "book".to_string(),
            asset_id: "token1".to_string(),
            market: "cond1".to_string(),
            timestamp: Some("1704067200000".to_string()),
            bids: bids
                .iter()
                .map(|(p, s)| OrderSummary {
                    price: p.to_string(),
                    size: s.to_string(),
                })
                .collect(),
            asks: asks
                .iter()
                .map(|(p, s)| OrderSummary {
                    price: p.to_string(),
                    size: s.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_snapshot_and_top() {
        let mut book = OrderBook::default();
        book.apply_snapshot(&book_msg(
            &[("0.45", "100"), ("0.44", "200")],
            &[("0.55", "150"), ("0.56", "250")],
        ));

        let top = book.top().unwrap();
        assert_eq!(top.best_bid, dec!(0.45));
        assert_eq!(top.best_bid_size, dec!(100));
        assert_eq!(top.best_ask, dec!(0.55));
        assert_eq!(top.best_ask_size, dec!(150));
        assert_eq!(top.spread(), dec!(0.10));
        assert_eq!(top.mid(), dec!(0.50));
    }

    #[test]
    fn test_snapshot_drops_zero_levels() {
        let mut book = OrderBook::default();
        book.apply_snapshot(&book_msg(&[("0.45", "0"), ("0.44", "10")], &[("0.55", "5")]));
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.top().unwrap().best_bid, dec!(0.44));
    }

    #[test]
    fn test_delta_update_and_remove() {
        let mut book = OrderBook::default();
        book.apply_delta(Side::Buy, dec!(0.45), dec!(100));
        book.apply_delta(Side::Sell, dec!(0.55), dec!(50));
        assert_eq!(book.size_at(Side::Buy, dec!(0.45)), dec!(100));

        // Update existing level
        book.apply_delta(Side::Buy, dec!(0.45), dec!(150));
        assert_eq!(book.size_at(Side::Buy, dec!(0.45)), dec!(150));

        // Remove level (size = 0)
        book.apply_delta(Side::Buy, dec!(0.45), dec!(0));
        assert_eq!(book.size_at(Side::Buy, dec!(0.45)), dec!(0));
        assert!(book.top().is_none());
    }

    #[test]
    fn test_negative_size_dropped() {
        let mut book = OrderBook::default();
        book.apply_delta(Side::Buy, dec!(0.45), dec!(100));
        book.apply_delta(Side::Buy, dec!(0.45), dec!(-5));
        assert_eq!(book.size_at(Side::Buy, dec!(0.45)), dec!(100));
    }

    #[test]
    fn test_best_tracks_max_and_min_after_sequence() {
        let mut book = OrderBook::default();
        book.apply_delta(Side::Buy, dec!(0.40), dec!(10));
        book.apply_delta(Side::Buy, dec!(0.48), dec!(20));
        book.apply_delta(Side::Buy, dec!(0.44), dec!(30));
        book.apply_delta(Side::Sell, dec!(0.60), dec!(10));
        book.apply_delta(Side::Sell, dec!(0.52), dec!(20));

        let top = book.top().unwrap();
        assert_eq!(top.best_bid, dec!(0.48));
        assert_eq!(top.best_ask, dec!(0.52));

        // Removing the best exposes the next level
        book.apply_delta(Side::Buy, dec!(0.48), dec!(0));
        assert_eq!(book.top().unwrap().best_bid, dec!(0.44));
    }

    #[test]
    fn test_crossed_book_tolerated() {
        let mut book = OrderBook::default();
        book.apply_delta(Side::Buy, dec!(0.55), dec!(10));
        book.apply_delta(Side::Sell, dec!(0.50), dec!(10));

        let top = book.top().unwrap();
        assert_eq!(top.best_bid, dec!(0.55));
        assert_eq!(top.best_ask, dec!(0.50));
        assert!(top.spread() < Decimal::ZERO);
    }

    #[test]
    fn test_store_apply_and_top() {
        let store = BookStore::new();
        store.apply_snapshot(&book_msg(&[("0.50", "100")], &[("0.52", "100")]));

        let top = store.top("token1").unwrap();
        assert_eq!(top.best_bid, dec!(0.50));
        assert!(store.top("unknown").is_none());
    }

    #[test]
    fn test_store_price_changes_in_order() {
        let store = BookStore::new();
        store.apply_snapshot(&book_msg(&[("0.50", "100")], &[("0.52", "100")]));

        let msg = PriceChangeMessage {
            event_type: "price_change".to_string(),
            asset_id: "token1".to_string(),
            market: "cond1".to_string(),
            timestamp: None,
            price_changes: vec![
                PriceChange {
                    price: "0.51".to_string(),
                    size: "40".to_string(),
                    side: "BUY".to_string(),
                },
                PriceChange {
                    price: "0.51".to_string(),
                    size: "0".to_string(),
                    side: "BUY".to_string(),
                },
            ],
        };
        store.apply_price_changes(&msg);

        // Insert then delete at the same level nets out
        assert_eq!(store.top("token1").unwrap().best_bid, dec!(0.50));
    }

    #[test]
    fn test_retain_tokens() {
        let store = BookStore::new();
        let mut msg = book_msg(&[("0.50", "1")], &[("0.52", "1")]);
        store.apply_snapshot(&msg);
        msg.asset_id = "token2".to_string();
        store.apply_snapshot(&msg);
        assert_eq!(store.len(), 2);

        let keep: std::collections::HashSet<String> = ["token2".to_string()].into();
        store.retain_tokens(&keep);
        assert_eq!(store.len(), 1);
        assert!(store.top("token1").is_none());
    }

    #[test]
    fn test_parse_timestamp() {
        let dt = parse_timestamp("1704067200000").unwrap();
        assert_eq!(dt.timestamp_millis(), 1704067200000);
        assert!(parse_timestamp("nope").is_none());
    }
}
