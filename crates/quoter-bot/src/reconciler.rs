//! Per-market order reconciliation.
//!
//! The reconciler drives the set of live exchange orders toward the quote
//! engine's desired state with the minimum set of calls. All work for one
//! market runs under that market's gate; markets proceed in parallel.
//! Triggers coalesce: while a cycle is running, any number of further
//! triggers collapse into a single rerun.
//!
//! The exchange only supports cancel-all-for-token, so per-side cancel
//! decisions are batched: one token-wide cancel when at least one live
//! side needs replacing, then both sides are re-placed as desired.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use quoter_common::{RiskReason, Side};
use quoter_market::{BookTop, MarketEntry, StrategyParameters};

use crate::engine::{self, Quote, QuoteInputs, QuoteThresholds};
use crate::exchange::ExchangeClient;
use crate::position::Position;
use crate::risk::{self, RiskOffRegistry};
use crate::state::CoreState;

/// What woke the reconciler up for a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Order book changed; rate limited.
    Book,
    /// Private fill or order event; bypasses the rate limit.
    Private,
    /// Periodic tick; bypasses the rate limit.
    Periodic,
}

/// A reconciliation trigger for one market.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub condition_id: String,
    pub kind: TriggerKind,
}

/// Reconciler tuning, lifted from the trading config.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub action_cooldown: Duration,
    pub call_timeout: Duration,
    pub hard_cap_shares: Decimal,
    pub low_price_cutoff: Decimal,
    pub merge_threshold_shares: Decimal,
    pub thresholds: QuoteThresholds,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            action_cooldown: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            hard_cap_shares: Decimal::new(250, 0),
            low_price_cutoff: Decimal::new(10, 2),
            merge_threshold_shares: Decimal::new(20, 0),
            thresholds: QuoteThresholds::default(),
        }
    }
}

/// The active controller: consumes triggers, consults the engine, talks
/// to the exchange.
pub struct Reconciler {
    state: Arc<CoreState>,
    exchange: Arc<dyn ExchangeClient>,
    risk_off: Arc<RiskOffRegistry>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        state: Arc<CoreState>,
        exchange: Arc<dyn ExchangeClient>,
        risk_off: Arc<RiskOffRegistry>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            state,
            exchange,
            risk_off,
            config,
        }
    }

    /// Consume triggers until shutdown. Each trigger is dispatched onto a
    /// task that competes for the market's gate; losers just flag a rerun.
    pub async fn run(
        self: Arc<Self>,
        mut trigger_rx: mpsc::Receiver<Trigger>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                trigger = trigger_rx.recv() => {
                    let Some(trigger) = trigger else {
                        info!("reconciler: trigger channel closed");
                        return;
                    };
                    if trigger.kind == TriggerKind::Book
                        && self.state.within_cooldown(&trigger.condition_id, self.config.action_cooldown)
                    {
                        debug!(condition_id = %trigger.condition_id, "book trigger inside cooldown, dropped");
                        continue;
                    }
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.drive(trigger.condition_id).await;
                    });
                }
                _ = shutdown.recv() => {
                    info!("reconciler: shutdown signal received");
                    return;
                }
            }
        }
    }

    /// Run cycles for a market until the rerun flag stays clear. If the
    /// gate is held, the holder picks the flag up before releasing.
    pub async fn drive(&self, condition_id: String) {
        let gate = self.state.gate(&condition_id);
        gate.rerun.store(true, Ordering::Release);
        loop {
            let Ok(guard) = gate.lock.try_lock() else {
                return;
            };
            while gate.rerun.swap(false, Ordering::AcqRel) {
                if self.state.is_shutdown() {
                    return;
                }
                if let Err(e) = self.reconcile_market(&condition_id).await {
                    warn!(condition_id, "reconciliation cycle failed: {e:#}");
                }
            }
            drop(guard);
            // A trigger may have slipped in between the final flag check
            // and the release; reacquire if so.
            if !gate.rerun.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// One reconciliation cycle for a market: both tokens of the pair.
    pub async fn reconcile_market(&self, condition_id: &str) -> Result<()> {
        let now = Utc::now();
        if self.risk_off.is_sleeping(condition_id, now) {
            debug!(condition_id, "market is sleeping, no action");
            return Ok(());
        }
        if self.risk_off.get(condition_id).is_some() {
            self.risk_off.clear(condition_id)?;
        }

        let registry = self.state.registry();
        let Some(entry) = registry.get(condition_id) else {
            debug!(condition_id, "market not in registry, no action");
            return Ok(());
        };
        let params = registry.params_for(entry);

        self.maybe_merge(entry).await;

        let pair = [
            (
                entry.market.token_a.clone(),
                entry.market.token_b.clone(),
            ),
            (
                entry.market.token_b.clone(),
                entry.market.token_a.clone(),
            ),
        ];
        for (token, reverse_token) in pair {
            self.reconcile_token(condition_id, entry, &params, &token, &reverse_token)
                .await?;
            if self.risk_off.is_sleeping(condition_id, Utc::now()) {
                break;
            }
        }
        Ok(())
    }

    async fn reconcile_token(
        &self,
        condition_id: &str,
        entry: &MarketEntry,
        params: &StrategyParameters,
        token: &str,
        reverse_token: &str,
    ) -> Result<()> {
        if self.state.unknown_orders.contains(token) {
            debug!(token, "order state unknown, waiting for next pull");
            return Ok(());
        }
        let Some(top) = self.state.books.top(token) else {
            debug!(token, "no book yet, no action");
            return Ok(());
        };

        // Read the stores once into locals; the pure engine runs on these.
        let position = self.state.store.position(token);
        let reverse_position = self.state.store.position(reverse_token).size;
        let orders = self.state.store.orders(token);
        let balance = self.state.balance();

        if let Some(reason) = risk::evaluate(&position, top, entry.volatility, params) {
            return self
                .liquidate(condition_id, token, &position, top, reason, params)
                .await;
        }

        let inputs = QuoteInputs {
            top,
            position: &position,
            reverse_position,
            orders: &orders,
            market: &entry.market,
            params,
            trade: &entry.trade,
            volatility: entry.volatility,
            balance,
            risk_off: false,
            hard_cap_shares: self.config.hard_cap_shares,
            low_price_cutoff: self.config.low_price_cutoff,
            thresholds: &self.config.thresholds,
        };
        let plan = engine::compute_quotes(&inputs);
        if plan.is_noop(&orders) {
            return Ok(());
        }

        let do_cancel = (plan.cancel_buy && orders.buy.is_some())
            || (plan.cancel_sell && orders.sell.is_some());
        if do_cancel {
            self.call_cancel_all(token).await?;
            self.state.store.clear_orders(token);
        }

        // After a token-wide cancel both desired sides re-place; without
        // one, only sides with nothing resting are placed.
        let place_buy = plan.buy.filter(|_| do_cancel || orders.buy.is_none());
        let place_sell = plan.sell.filter(|_| do_cancel || orders.sell.is_none());

        if let Some(quote) = place_buy {
            self.call_place(token, Side::Buy, quote).await;
        }
        if let Some(quote) = place_sell {
            self.call_place(token, Side::Sell, quote).await;
        }

        if do_cancel || place_buy.is_some() || place_sell.is_some() {
            self.state.mark_action(condition_id);
        }
        Ok(())
    }

    /// Risk-off mid-cycle: flatten quotes, post one exit sell at the best
    /// bid for the whole position, write the durable record.
    async fn liquidate(
        &self,
        condition_id: &str,
        token: &str,
        position: &Position,
        top: BookTop,
        reason: RiskReason,
        params: &StrategyParameters,
    ) -> Result<()> {
        warn!(condition_id, token, %reason, size = %position.size, "risk-off tripped, liquidating");

        self.call_cancel_all(token).await?;
        self.state.store.clear_orders(token);

        if position.size > Decimal::ZERO && top.best_bid > Decimal::ZERO {
            self.call_place(
                token,
                Side::Sell,
                Quote {
                    price: top.best_bid,
                    size: position.size,
                },
            )
            .await;
        }

        let sleep_until = Utc::now() + chrono::Duration::hours(params.sleep_period_hours as i64);
        self.risk_off.trip(condition_id, reason, sleep_until)?;
        self.state.mark_action(condition_id);
        Ok(())
    }

    /// Merge complementary inventory back into stablecoin once both sides
    /// hold enough shares.
    async fn maybe_merge(&self, entry: &MarketEntry) {
        let a = self.state.store.position(&entry.market.token_a).size;
        let b = self.state.store.position(&entry.market.token_b).size;
        let mergeable = a.min(b);
        if mergeable < self.config.merge_threshold_shares {
            return;
        }
        let Some(micro) = (mergeable * Decimal::new(1_000_000, 0)).floor().to_u64() else {
            return;
        };
        let condition_id = &entry.market.condition_id;
        match timeout(
            self.config.call_timeout,
            self.exchange
                .merge_complementary(condition_id, micro, entry.market.neg_risk),
        )
        .await
        {
            Ok(Ok(())) => {
                info!(condition_id, shares = %mergeable, "merged complementary positions");
                // On-chain balances moved; refresh the authoritative view.
                self.state.pull_notify.notify_one();
            }
            Ok(Err(e)) => warn!(condition_id, "merge failed: {e}"),
            Err(_) => warn!(condition_id, "merge timed out"),
        }
    }

    /// Token-wide cancel with timeout handling. A timeout leaves the
    /// token's order state unknown until the next authoritative pull.
    async fn call_cancel_all(&self, token: &str) -> Result<()> {
        match timeout(
            self.config.call_timeout,
            self.exchange.cancel_all_for_token(token),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.state.pull_notify.notify_one();
                anyhow::bail!("cancel-all failed for {token}: {e}");
            }
            Err(_) => {
                self.state.unknown_orders.insert(token.to_string());
                self.state.pull_notify.notify_one();
                anyhow::bail!("cancel-all timed out for {token}");
            }
        }
    }

    /// Place one order. Success updates the store optimistically; the
    /// private stream remains authoritative. Failures are logged and left
    /// for the next pull, never retried inline.
    async fn call_place(&self, token: &str, side: Side, quote: Quote) {
        match timeout(
            self.config.call_timeout,
            self.exchange
                .create_order(token, side, quote.price, quote.size),
        )
        .await
        {
            Ok(Ok(ack)) => {
                self.state.store.apply_order_ack(
                    token,
                    side,
                    ack.order_id,
                    quote.price,
                    quote.size,
                );
            }
            Ok(Err(e)) => {
                warn!(token, %side, price = %quote.price, "place rejected: {e}");
                self.state.pull_notify.notify_one();
            }
            Err(_) => {
                warn!(token, %side, "place timed out, order state unknown");
                self.state.unknown_orders.insert(token.to_string());
                self.state.pull_notify.notify_one();
            }
        }
    }
}
