//! Periodic control loop.
//!
//! One scheduler, three cadences: a fast tick pulls authoritative orders,
//! positions, and balance and sweeps stale pending intents; a slower one
//! reloads the market registry and diffs the websocket subscription set;
//! the slowest snapshots reward and position state to the sinks. A pull
//! can also be forced early through `CoreState::pull_notify` (reconnects,
//! failed trades, timed-out exchange calls).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use quoter_common::{PositionSnapshotRecord, RewardSnapshotRecord};
use quoter_market::RegistrySource;

use crate::exchange::ExchangeClient;
use crate::reconciler::{Trigger, TriggerKind};
use crate::sinks::EventSink;
use crate::state::CoreState;

/// Scheduler cadences, in units of the base pull tick.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub pull_interval: Duration,
    /// Reload the registry every N pull ticks.
    pub registry_every: u64,
    /// Snapshot to sinks every N pull ticks.
    pub snapshot_every: u64,
    pub call_timeout: Duration,
}

impl SchedulerConfig {
    /// Derive tick multiples from second-denominated cadences.
    pub fn from_secs(pull_secs: u64, registry_secs: u64, snapshot_secs: u64, call_timeout_secs: u64) -> Self {
        let pull = pull_secs.max(1);
        Self {
            pull_interval: Duration::from_secs(pull),
            registry_every: (registry_secs / pull).max(1),
            snapshot_every: (snapshot_secs / pull).max(1),
            call_timeout: Duration::from_secs(call_timeout_secs),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_secs(10, 60, 300, 10)
    }
}

/// The periodic control loop.
pub struct Scheduler {
    state: Arc<CoreState>,
    exchange: Arc<dyn ExchangeClient>,
    registry_source: Arc<dyn RegistrySource>,
    sink: Arc<dyn EventSink>,
    trigger_tx: mpsc::Sender<Trigger>,
    tokens_tx: watch::Sender<Vec<String>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        state: Arc<CoreState>,
        exchange: Arc<dyn ExchangeClient>,
        registry_source: Arc<dyn RegistrySource>,
        sink: Arc<dyn EventSink>,
        trigger_tx: mpsc::Sender<Trigger>,
        tokens_tx: watch::Sender<Vec<String>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            state,
            exchange,
            registry_source,
            sink,
            trigger_tx,
            tokens_tx,
            config,
        }
    }

    /// First load at startup: registry then authoritative state. A
    /// registry that cannot be loaded at all is fatal; an empty universe
    /// is not worth running against.
    pub async fn bootstrap(&self) -> Result<()> {
        self.reload_registry()
            .await
            .context("initial registry load failed")?;
        let markets = self.state.registry().len();
        info!(markets, "registry bootstrapped");
        self.pull_cycle().await;
        Ok(())
    }

    /// Run until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = interval(self.config.pull_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; bootstrap
        // already pulled, so swallow it.
        tick.tick().await;

        let mut cycle: u64 = 0;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    cycle += 1;
                }
                _ = self.state.pull_notify.notified() => {
                    debug!("early pull requested");
                }
                _ = self.state.reload_notify.notified() => {
                    info!("registry reload requested");
                    if let Err(e) = self.reload_registry().await {
                        warn!("registry reload failed: {e:#}");
                    }
                }
                _ = shutdown.recv() => {
                    info!("scheduler: shutdown signal received");
                    return;
                }
            }

            self.pull_cycle().await;

            if cycle > 0 && cycle % self.config.registry_every == 0 {
                if let Err(e) = self.reload_registry().await {
                    warn!("registry reload failed: {e:#}");
                }
            }
            if cycle > 0 && cycle % self.config.snapshot_every == 0 {
                self.snapshot();
            }
        }
    }

    /// Pull authoritative orders, positions, and balance; sweep pending;
    /// trigger reconciliation for markets whose state materially changed.
    pub async fn pull_cycle(&self) {
        let swept = self.state.pending.sweep(Utc::now());
        if swept > 0 {
            debug!(swept, "swept stale pending intents");
        }

        let orders = match timeout(self.config.call_timeout, self.exchange.list_open_orders()).await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!("open-order pull failed: {e}");
                return;
            }
            Err(_) => {
                warn!("open-order pull timed out");
                return;
            }
        };
        let positions =
            match timeout(self.config.call_timeout, self.exchange.list_positions()).await {
                Ok(Ok(rows)) => rows,
                Ok(Err(e)) => {
                    warn!("position pull failed: {e}");
                    return;
                }
                Err(_) => {
                    warn!("position pull timed out");
                    return;
                }
            };
        match timeout(self.config.call_timeout, self.exchange.stablecoin_balance()).await {
            Ok(Ok(balance)) => self.state.set_balance(balance),
            Ok(Err(e)) => warn!("balance pull failed: {e}"),
            Err(_) => warn!("balance pull timed out"),
        }

        let pending_tokens = self.state.pending.pending_tokens();
        let changed = self
            .state
            .store
            .merge_authoritative(&positions, &orders, &pending_tokens);

        // The pull is the authoritative answer for any order whose fate a
        // timed-out call left open.
        self.state.unknown_orders.clear();

        let registry = self.state.registry();
        let conditions: HashSet<String> = changed
            .iter()
            .filter_map(|token| registry.condition_for_token(token))
            .map(String::from)
            .collect();
        for condition_id in conditions {
            let _ = self
                .trigger_tx
                .send(Trigger {
                    condition_id,
                    kind: TriggerKind::Periodic,
                })
                .await;
        }
    }

    /// Reload the registry and diff the subscription set.
    pub async fn reload_registry(&self) -> Result<()> {
        let snapshot = self
            .registry_source
            .fetch()
            .await
            .context("registry fetch failed")?;
        let tokens = snapshot.subscribed_tokens();
        let markets = snapshot.len();
        self.state.set_registry(Arc::new(snapshot));

        let updated = self.tokens_tx.send_if_modified(|current| {
            if *current != tokens {
                *current = tokens.clone();
                true
            } else {
                false
            }
        });
        if updated {
            info!(markets, tokens = tokens.len(), "subscription set updated");
        }
        Ok(())
    }

    /// Snapshot reward and position state to the sinks.
    pub fn snapshot(&self) {
        let now = Utc::now();
        let registry = self.state.registry();

        for (token_id, orders) in self.state.store.tokens_with_orders() {
            let Some(condition_id) = registry.condition_for_token(&token_id) else {
                continue;
            };
            let mid = self.state.books.top(&token_id).map(|t| t.mid());
            for (side, order) in [
                (quoter_common::Side::Buy, &orders.buy),
                (quoter_common::Side::Sell, &orders.sell),
            ] {
                let Some(order) = order else { continue };
                let distance = mid
                    .map(|m| (order.price - m).abs())
                    .unwrap_or(rust_decimal::Decimal::ZERO);
                self.sink.log_reward(&RewardSnapshotRecord {
                    timestamp: now,
                    condition_id: condition_id.to_string(),
                    token_id: token_id.clone(),
                    side,
                    price: order.price,
                    size: order.size,
                    distance_from_mid: distance,
                });
            }
        }

        for (token_id, position) in self.state.store.nonzero_positions() {
            self.sink.log_position(&PositionSnapshotRecord {
                timestamp: now,
                token_id,
                size: position.size,
                avg_price: position.avg_price.unwrap_or_default(),
                notional: position.notional(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PaperExchange, PositionRow};
    use crate::sinks::NullSink;
    use quoter_market::{
        Market, MarketEntry, RegistrySnapshot, StrategyProfile, TradeConfig,
    };
    use async_trait::async_trait;
    use quoter_market::RegistryError;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct StaticRegistry(Vec<MarketEntry>);

    #[async_trait]
    impl RegistrySource for StaticRegistry {
        async fn fetch(&self) -> Result<RegistrySnapshot, RegistryError> {
            Ok(RegistrySnapshot::new(self.0.clone(), HashMap::new()))
        }
    }

    fn entry() -> MarketEntry {
        MarketEntry {
            market: Market {
                condition_id: "cond1".to_string(),
                token_a: "tokenA".to_string(),
                token_b: "tokenB".to_string(),
                neg_risk: false,
                tick_size: dec!(0.01),
                min_size: dec!(5),
                max_spread: dec!(0.06),
                profile: StrategyProfile::Default,
            },
            trade: TradeConfig {
                trade_size: dec!(20),
                max_size: dec!(60),
                enabled: true,
                low_price_multiplier: Decimal::ONE,
            },
            volatility: dec!(5),
        }
    }

    fn harness(
        positions: Vec<PositionRow>,
    ) -> (Scheduler, Arc<CoreState>, mpsc::Receiver<Trigger>, watch::Receiver<Vec<String>>) {
        let state = Arc::new(CoreState::new(60));
        let exchange = Arc::new(PaperExchange::new(dec!(500)));
        exchange.set_positions(positions);
        let (trigger_tx, trigger_rx) = mpsc::channel(64);
        let (tokens_tx, tokens_rx) = watch::channel(Vec::new());
        let scheduler = Scheduler::new(
            Arc::clone(&state),
            exchange,
            Arc::new(StaticRegistry(vec![entry()])),
            Arc::new(NullSink),
            trigger_tx,
            tokens_tx,
            SchedulerConfig::default(),
        );
        (scheduler, state, trigger_rx, tokens_rx)
    }

    #[tokio::test]
    async fn test_bootstrap_loads_registry_and_state() {
        let (scheduler, state, mut trigger_rx, tokens_rx) = harness(vec![PositionRow {
            token_id: "tokenA".to_string(),
            size: dec!(40),
            avg_price: dec!(0.50),
        }]);

        scheduler.bootstrap().await.unwrap();

        assert_eq!(state.registry().len(), 1);
        assert_eq!(state.balance(), dec!(500));
        assert_eq!(state.store.position("tokenA").size, dec!(40));
        assert_eq!(
            *tokens_rx.borrow(),
            vec!["tokenA".to_string(), "tokenB".to_string()]
        );

        // The appearing position is a material change
        let trigger = trigger_rx.recv().await.unwrap();
        assert_eq!(trigger.condition_id, "cond1");
        assert_eq!(trigger.kind, TriggerKind::Periodic);
    }

    #[tokio::test]
    async fn test_pull_clears_unknown_orders() {
        let (scheduler, state, _trigger_rx, _tokens_rx) = harness(Vec::new());
        scheduler.reload_registry().await.unwrap();

        state.unknown_orders.insert("tokenA".to_string());
        scheduler.pull_cycle().await;
        assert!(state.unknown_orders.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_pull_emits_no_triggers() {
        let (scheduler, _state, mut trigger_rx, _tokens_rx) = harness(vec![PositionRow {
            token_id: "tokenA".to_string(),
            size: dec!(40),
            avg_price: dec!(0.50),
        }]);
        scheduler.bootstrap().await.unwrap();
        let _ = trigger_rx.recv().await.unwrap();

        scheduler.pull_cycle().await;
        assert!(trigger_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_does_not_panic_without_books() {
        let (scheduler, state, _trigger_rx, _tokens_rx) = harness(Vec::new());
        scheduler.reload_registry().await.unwrap();
        state
            .store
            .apply_fill("tokenA", quoter_common::Side::Buy, dec!(10), dec!(0.40));
        state.store.apply_order_ack(
            "tokenA",
            quoter_common::Side::Buy,
            "o1".to_string(),
            dec!(0.40),
            dec!(10),
        );
        scheduler.snapshot();
    }
}
