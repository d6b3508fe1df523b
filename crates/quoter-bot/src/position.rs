//! Position and open-order store.
//!
//! Single source of truth for per-token inventory and the (at most one)
//! tracked order per side. Updated eagerly from the private stream and
//! reconciled against periodic authoritative pulls; while pending intents
//! exist for a token, a pull only refreshes the average price and the
//! locally-accounted size is retained.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use quoter_common::Side;

use crate::exchange::{OpenOrderRow, PositionRow};

/// Inventory in one token. `avg_price` is defined iff `size > 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    pub size: Decimal,
    pub avg_price: Option<Decimal>,
}

impl Position {
    pub fn new(size: Decimal, avg_price: Decimal) -> Self {
        if size > Decimal::ZERO {
            Self {
                size,
                avg_price: Some(avg_price),
            }
        } else {
            Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size <= Decimal::ZERO
    }

    /// size * avg_price, in the stablecoin. Zero when flat.
    pub fn notional(&self) -> Decimal {
        match self.avg_price {
            Some(avg) => self.size * avg,
            None => Decimal::ZERO,
        }
    }
}

/// One tracked resting order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOrder {
    pub order_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub placed_at: DateTime<Utc>,
}

/// The tracked orders of one token, one slot per side.
#[derive(Debug, Clone, Default)]
pub struct TokenOrders {
    pub buy: Option<OpenOrder>,
    pub sell: Option<OpenOrder>,
}

impl TokenOrders {
    pub fn get(&self, side: Side) -> Option<&OpenOrder> {
        match side {
            Side::Buy => self.buy.as_ref(),
            Side::Sell => self.sell.as_ref(),
        }
    }

    fn slot_mut(&mut self, side: Side) -> &mut Option<OpenOrder> {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buy.is_none() && self.sell.is_none()
    }
}

/// Concurrent position and order store.
#[derive(Debug, Default)]
pub struct PositionStore {
    positions: DashMap<String, Position>,
    orders: DashMap<String, TokenOrders>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position, empty when unknown.
    pub fn position(&self, token_id: &str) -> Position {
        self.positions
            .get(token_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Current tracked orders, empty when unknown.
    pub fn orders(&self, token_id: &str) -> TokenOrders {
        self.orders
            .get(token_id)
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    /// Tokens with a nonzero position.
    pub fn nonzero_positions(&self) -> Vec<(String, Position)> {
        self.positions
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Tokens with at least one tracked order.
    pub fn tokens_with_orders(&self) -> Vec<(String, TokenOrders)> {
        self.orders
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Apply a fill eagerly.
    ///
    /// Buys fold into the size-weighted average price; sells reduce size
    /// and leave the average untouched until the position is flat.
    pub fn apply_fill(&self, token_id: &str, side: Side, size: Decimal, price: Decimal) {
        if size <= Decimal::ZERO {
            warn!(token_id, %size, "ignoring fill with non-positive size");
            return;
        }
        let mut entry = self.positions.entry(token_id.to_string()).or_default();
        match side {
            Side::Buy => {
                let old_size = entry.size;
                let old_notional = entry.notional();
                entry.size = old_size + size;
                entry.avg_price = Some((old_notional + price * size) / entry.size);
            }
            Side::Sell => {
                entry.size = (entry.size - size).max(Decimal::ZERO);
                if entry.size.is_zero() {
                    entry.avg_price = None;
                }
            }
        }
        debug!(token_id, %side, %size, %price, new_size = %entry.size, "fill applied");
    }

    /// Record a freshly-placed order (optimistic, ahead of the stream ack).
    pub fn apply_order_ack(
        &self,
        token_id: &str,
        side: Side,
        order_id: String,
        price: Decimal,
        size: Decimal,
    ) {
        let mut entry = self.orders.entry(token_id.to_string()).or_default();
        *entry.slot_mut(side) = Some(OpenOrder {
            order_id,
            price,
            size,
            placed_at: Utc::now(),
        });
    }

    /// Update a tracked order from a private-stream order event. A
    /// remaining size of zero removes the slot.
    pub fn apply_order_update(
        &self,
        token_id: &str,
        side: Side,
        order_id: &str,
        price: Decimal,
        remaining: Decimal,
    ) {
        let mut entry = self.orders.entry(token_id.to_string()).or_default();
        let slot = entry.slot_mut(side);
        if remaining <= Decimal::ZERO {
            // Only clear if it refers to the order we track; a stale gone
            // event for a replaced order must not drop the replacement.
            if slot.as_ref().is_some_and(|o| o.order_id == order_id) {
                *slot = None;
            }
        } else {
            *slot = Some(OpenOrder {
                order_id: order_id.to_string(),
                price,
                size: remaining,
                placed_at: slot
                    .as_ref()
                    .filter(|o| o.order_id == order_id)
                    .map(|o| o.placed_at)
                    .unwrap_or_else(Utc::now),
            });
        }
    }

    /// Remove a tracked order by id, wherever it is.
    pub fn apply_order_gone(&self, order_id: &str) {
        for mut entry in self.orders.iter_mut() {
            let orders = entry.value_mut();
            if orders.buy.as_ref().is_some_and(|o| o.order_id == order_id) {
                orders.buy = None;
                return;
            }
            if orders.sell.as_ref().is_some_and(|o| o.order_id == order_id) {
                orders.sell = None;
                return;
            }
        }
    }

    /// Drop all tracked orders for a token (after a token-wide cancel).
    pub fn clear_orders(&self, token_id: &str) {
        self.orders.remove(token_id);
    }

    /// Replace state from an authoritative pull.
    ///
    /// Tokens with live pending intents keep their locally-accounted size;
    /// only the average price is taken from the pull, since the REST view
    /// may lag fills that are already applied locally.
    ///
    /// Returns the tokens whose position or orders materially changed.
    pub fn merge_authoritative(
        &self,
        positions: &[PositionRow],
        orders: &[OpenOrderRow],
        pending_tokens: &HashSet<String>,
    ) -> Vec<String> {
        let mut changed: HashSet<String> = HashSet::new();

        // Positions: full replace, except size under pending.
        let mut new_positions: HashMap<String, Position> = HashMap::new();
        for row in positions {
            if row.size <= Decimal::ZERO {
                continue;
            }
            new_positions.insert(row.token_id.clone(), Position::new(row.size, row.avg_price));
        }

        let existing: Vec<String> = self.positions.iter().map(|e| e.key().clone()).collect();
        for token in existing {
            let incoming = new_positions.remove(&token);
            let mut entry = match self.positions.get_mut(&token) {
                Some(e) => e,
                None => continue,
            };
            let pending = pending_tokens.contains(&token);
            let next = match (incoming, pending) {
                (Some(new), true) => Position {
                    size: entry.size,
                    avg_price: new.avg_price.or(entry.avg_price),
                },
                (Some(new), false) => new,
                // Pull saw nothing; trust local while pending, flat otherwise.
                (None, true) => entry.clone(),
                (None, false) => Position::default(),
            };
            if *entry != next {
                changed.insert(token.clone());
                *entry = next;
            }
        }
        for (token, position) in new_positions {
            changed.insert(token.clone());
            self.positions.insert(token, position);
        }

        // Orders: full replace, collapsing multiple per (token, side) into
        // the aggregate view (total size, volume-weighted price).
        let mut grouped: HashMap<(String, Side), Vec<&OpenOrderRow>> = HashMap::new();
        for row in orders {
            grouped
                .entry((row.token_id.clone(), row.side))
                .or_default()
                .push(row);
        }

        let mut new_orders: HashMap<String, TokenOrders> = HashMap::new();
        for ((token, side), rows) in grouped {
            let total: Decimal = rows.iter().map(|r| r.size).sum();
            if total <= Decimal::ZERO {
                continue;
            }
            let weighted: Decimal = rows.iter().map(|r| r.price * r.size).sum::<Decimal>() / total;
            let slot = OpenOrder {
                order_id: rows[0].order_id.clone(),
                price: weighted,
                size: total,
                placed_at: Utc::now(),
            };
            *new_orders.entry(token).or_default().slot_mut(side) = Some(slot);
        }

        let existing: Vec<String> = self.orders.iter().map(|e| e.key().clone()).collect();
        for token in existing {
            if !new_orders.contains_key(&token) {
                if self
                    .orders
                    .remove(&token)
                    .is_some_and(|(_, o)| !o.is_empty())
                {
                    changed.insert(token);
                }
            }
        }
        for (token, orders) in new_orders {
            let differs = {
                let current = self.orders(&token);
                !orders_equivalent(&current, &orders)
            };
            if differs {
                changed.insert(token.clone());
            }
            self.orders.insert(token, orders);
        }

        changed.into_iter().collect()
    }
}

/// Same price/size per side; order ids and timestamps are incidental.
fn orders_equivalent(a: &TokenOrders, b: &TokenOrders) -> bool {
    let same = |x: &Option<OpenOrder>, y: &Option<OpenOrder>| match (x, y) {
        (None, None) => true,
        (Some(x), Some(y)) => x.price == y.price && x.size == y.size,
        _ => false,
    };
    same(&a.buy, &b.buy) && same(&a.sell, &b.sell)
}
