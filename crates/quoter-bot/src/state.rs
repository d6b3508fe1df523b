//! Shared state for the trading core.
//!
//! One explicit `CoreState` value threaded to the stream handlers, the
//! scheduler, and the reconciler. Containers are fine-grained and keyed
//! by token or market; nothing here is held across an await point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, Notify};

use quoter_market::{BookStore, RegistrySnapshot};

use crate::pending::PendingIntents;
use crate::position::PositionStore;

/// Per-market serialization cell.
///
/// `lock` is the critical section; `rerun` coalesces triggers that arrive
/// while a reconciliation is in flight.
#[derive(Debug, Default)]
pub struct MarketGate {
    pub lock: Mutex<()>,
    pub rerun: AtomicBool,
}

/// The core's shared state.
#[derive(Debug)]
pub struct CoreState {
    /// Per-token order books, written by the market stream.
    pub books: Arc<BookStore>,
    /// Positions and tracked open orders.
    pub store: PositionStore,
    /// Observed-but-unconfirmed trades.
    pub pending: PendingIntents,
    /// Latest registry snapshot; swapped wholesale on reload.
    registry: RwLock<Arc<RegistrySnapshot>>,
    /// Stablecoin balance from the last pull.
    balance: RwLock<Decimal>,
    /// Per-market reconciliation gates.
    gates: DashMap<String, Arc<MarketGate>>,
    /// Last exchange-facing action per market, for the book-trigger rate limit.
    last_action: DashMap<String, Instant>,
    /// Tokens whose order state is unknown after a timed-out call; no new
    /// actions on these until the next authoritative pull.
    pub unknown_orders: DashSet<String>,
    /// Wakes the scheduler for an immediate pull (reconnects, failed trades).
    pub pull_notify: Notify,
    /// Requests an immediate registry reload (control surface).
    pub reload_notify: Notify,
    /// Cooperative shutdown flag.
    shutdown: AtomicBool,
}

impl CoreState {
    pub fn new(pending_expiry_secs: u64) -> Self {
        Self {
            books: Arc::new(BookStore::new()),
            store: PositionStore::new(),
            pending: PendingIntents::new(pending_expiry_secs),
            registry: RwLock::new(Arc::new(RegistrySnapshot::default())),
            balance: RwLock::new(Decimal::ZERO),
            gates: DashMap::new(),
            last_action: DashMap::new(),
            unknown_orders: DashSet::new(),
            pull_notify: Notify::new(),
            reload_notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Current registry snapshot (cheap Arc clone).
    pub fn registry(&self) -> Arc<RegistrySnapshot> {
        self.registry.read().clone()
    }

    pub fn set_registry(&self, snapshot: Arc<RegistrySnapshot>) {
        *self.registry.write() = snapshot;
    }

    pub fn balance(&self) -> Decimal {
        *self.balance.read()
    }

    pub fn set_balance(&self, balance: Decimal) {
        *self.balance.write() = balance;
    }

    /// The serialization gate for a market, created on first use.
    pub fn gate(&self, condition_id: &str) -> Arc<MarketGate> {
        self.gates
            .entry(condition_id.to_string())
            .or_default()
            .clone()
    }

    /// Record that an exchange-facing action ran for this market.
    pub fn mark_action(&self, condition_id: &str) {
        self.last_action.insert(condition_id.to_string(), Instant::now());
    }

    /// Whether a book-only trigger should be dropped under the cooldown.
    pub fn within_cooldown(&self, condition_id: &str, cooldown: Duration) -> bool {
        self.last_action
            .get(condition_id)
            .is_some_and(|t| t.elapsed() < cooldown)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_registry_swap() {
        let state = CoreState::new(60);
        assert!(state.registry().is_empty());
        state.set_registry(Arc::new(RegistrySnapshot::default()));
        assert!(state.registry().is_empty());
    }

    #[test]
    fn test_balance() {
        let state = CoreState::new(60);
        assert_eq!(state.balance(), Decimal::ZERO);
        state.set_balance(dec!(1234.56));
        assert_eq!(state.balance(), dec!(1234.56));
    }

    #[test]
    fn test_gate_identity() {
        let state = CoreState::new(60);
        let a = state.gate("cond1");
        let b = state.gate("cond1");
        let c = state.gate("cond2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_cooldown() {
        let state = CoreState::new(60);
        assert!(!state.within_cooldown("cond1", Duration::from_secs(30)));
        state.mark_action("cond1");
        assert!(state.within_cooldown("cond1", Duration::from_secs(30)));
        assert!(!state.within_cooldown("cond1", Duration::from_nanos(1)));
    }

    #[test]
    fn test_shutdown_flag() {
        let state = CoreState::new(60);
        assert!(!state.is_shutdown());
        state.request_shutdown();
        assert!(state.is_shutdown());
    }
}
