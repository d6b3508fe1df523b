//! Application wiring.
//!
//! Builds the shared state, connects the streams, scheduler, and
//! reconciler, and runs until a shutdown signal. On the way out, resting
//! orders are cancelled token by token so nothing is left quoting while
//! the bot is not watching.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{error, info, warn};

use quoter_market::{
    FileRegistry, HttpRegistry, MarketStream, MarketStreamConfig, MarketStreamEvent,
    RegistrySource,
};

use crate::config::{BotConfig, RunMode};
use crate::exchange::{ExchangeClient, HttpGateway, PaperExchange};
use crate::reconciler::{Reconciler, ReconcilerConfig, Trigger, TriggerKind};
use crate::risk::RiskOffRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::sinks::{CsvSink, EventSink};
use crate::state::CoreState;
use crate::user_stream::{UserStream, UserStreamConfig, UserStreamEvent};

/// The assembled application.
pub struct App {
    config: BotConfig,
    state: Arc<CoreState>,
    exchange: Arc<dyn ExchangeClient>,
    registry_source: Arc<dyn RegistrySource>,
    sink: Arc<dyn EventSink>,
    risk_off: Arc<RiskOffRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl App {
    /// Build the application from configuration, constructing the default
    /// collaborators for the configured mode.
    pub fn from_config(config: BotConfig) -> Result<Self> {
        let exchange: Arc<dyn ExchangeClient> = match config.mode {
            RunMode::Live => Arc::new(HttpGateway::new(
                config.gateway.url.clone(),
                Duration::from_secs(config.trading.call_timeout_secs),
            )),
            RunMode::Paper => Arc::new(PaperExchange::new(rust_decimal::Decimal::new(10_000, 0))),
        };

        let registry_source: Arc<dyn RegistrySource> = if config.registry.source == "http" {
            Arc::new(HttpRegistry::new(config.registry.url.clone()))
        } else {
            Arc::new(FileRegistry::new(config.registry.path.clone()))
        };

        let sink: Arc<dyn EventSink> =
            Arc::new(CsvSink::new(&config.paths.sink_dir).context("failed to open sinks")?);

        Self::new(config, exchange, registry_source, sink)
    }

    /// Build with explicit collaborators (tests, alternative gateways).
    pub fn new(
        config: BotConfig,
        exchange: Arc<dyn ExchangeClient>,
        registry_source: Arc<dyn RegistrySource>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let state = Arc::new(CoreState::new(config.trading.pending_expiry_secs));
        let risk_off = Arc::new(
            RiskOffRegistry::open(&config.paths.risk_off_dir)
                .context("failed to open risk-off registry")?,
        );
        let (shutdown_tx, _) = broadcast::channel(16);
        Ok(Self {
            config,
            state,
            exchange,
            registry_source,
            sink,
            risk_off,
            shutdown_tx,
        })
    }

    pub fn state(&self) -> Arc<CoreState> {
        Arc::clone(&self.state)
    }

    /// Sender used to request a graceful shutdown.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(mode = %self.config.mode, "starting quoter");

        let (trigger_tx, trigger_rx) = mpsc::channel::<Trigger>(1024);
        let (market_tx, mut market_rx) = mpsc::channel::<MarketStreamEvent>(1024);
        let (user_tx, mut user_rx) = mpsc::channel::<UserStreamEvent>(256);
        let (tokens_tx, tokens_rx) = watch::channel(Vec::<String>::new());

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&self.state),
            Arc::clone(&self.exchange),
            Arc::clone(&self.registry_source),
            Arc::clone(&self.sink),
            trigger_tx.clone(),
            tokens_tx,
            SchedulerConfig::from_secs(
                self.config.cadence.pull_secs,
                self.config.cadence.registry_secs,
                self.config.cadence.snapshot_secs,
                self.config.trading.call_timeout_secs,
            ),
        ));

        // First registry + state load before anything quotes.
        scheduler.bootstrap().await?;
        info!(
            markets = self.state.registry().len(),
            positions = self.state.store.nonzero_positions().len(),
            "initial state loaded"
        );

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&self.state),
            Arc::clone(&self.exchange),
            Arc::clone(&self.risk_off),
            ReconcilerConfig {
                action_cooldown: Duration::from_secs(self.config.trading.action_cooldown_secs),
                call_timeout: Duration::from_secs(self.config.trading.call_timeout_secs),
                hard_cap_shares: self.config.trading.hard_cap_shares,
                low_price_cutoff: self.config.trading.low_price_cutoff,
                merge_threshold_shares: self.config.trading.merge_threshold_shares,
                thresholds: crate::engine::QuoteThresholds {
                    buy_price_tolerance: self.config.trading.buy_price_tolerance,
                    buy_size_tolerance: self.config.trading.buy_size_tolerance,
                    sell_price_tolerance: self.config.trading.sell_price_tolerance,
                    sell_size_tolerance: self.config.trading.sell_size_tolerance,
                },
            },
        ));

        let mut market_stream = MarketStream::new(
            MarketStreamConfig {
                url: self.config.streams.market_ws_url.clone(),
                ..MarketStreamConfig::default()
            },
            Arc::clone(&self.state.books),
            market_tx,
            tokens_rx,
        );
        let user_stream = UserStream::new(
            UserStreamConfig {
                url: self.config.streams.user_ws_url.clone(),
                api_key: self.config.credentials.api_key.clone(),
                api_secret: self.config.credentials.api_secret.clone(),
                api_passphrase: self.config.credentials.api_passphrase.clone(),
                funder_address: self.config.credentials.funder_address.clone(),
                ..UserStreamConfig::default()
            },
            Arc::clone(&self.state),
            Arc::clone(&self.sink),
            user_tx,
        );

        let mut tasks = Vec::new();

        // SIGHUP asks for an immediate registry reload.
        #[cfg(unix)]
        {
            let state = Arc::clone(&self.state);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                let Ok(mut sighup) = signal(SignalKind::hangup()) else {
                    return;
                };
                loop {
                    tokio::select! {
                        _ = sighup.recv() => {
                            info!("SIGHUP received, reloading registry");
                            state.reload_notify.notify_one();
                        }
                        _ = shutdown.recv() => return,
                    }
                }
            }));
        }

        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = market_stream.run(shutdown).await {
                error!("market stream terminated: {e}");
            }
        }));

        let shutdown = self.shutdown_tx.subscribe();
        let run_user_stream = self.config.mode == RunMode::Live;
        if run_user_stream {
            tasks.push(tokio::spawn(async move {
                if let Err(e) = user_stream.run(shutdown).await {
                    error!("user stream terminated: {e}");
                }
            }));
        }

        let shutdown = self.shutdown_tx.subscribe();
        let scheduler_task = Arc::clone(&scheduler);
        tasks.push(tokio::spawn(async move {
            scheduler_task.run(shutdown).await;
        }));

        let shutdown = self.shutdown_tx.subscribe();
        let reconciler_task = Arc::clone(&reconciler);
        tasks.push(tokio::spawn(async move {
            reconciler_task.run(trigger_rx, shutdown).await;
        }));

        // Forward stream events into reconciliation triggers.
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                event = market_rx.recv() => {
                    match event {
                        Some(MarketStreamEvent::Update { condition_id }) => {
                            let _ = trigger_tx.send(Trigger {
                                condition_id,
                                kind: TriggerKind::Book,
                            }).await;
                        }
                        Some(MarketStreamEvent::Connected) => {
                            self.state.pull_notify.notify_one();
                        }
                        Some(MarketStreamEvent::Disconnected(reason)) => {
                            warn!("market stream disconnected: {reason}");
                        }
                        None => break,
                    }
                }
                event = user_rx.recv() => {
                    match event {
                        Some(UserStreamEvent::Update { condition_id }) => {
                            let _ = trigger_tx.send(Trigger {
                                condition_id,
                                kind: TriggerKind::Private,
                            }).await;
                        }
                        Some(UserStreamEvent::Connected) => {
                            self.state.pull_notify.notify_one();
                        }
                        Some(UserStreamEvent::Disconnected(reason)) => {
                            warn!("user stream disconnected: {reason}");
                        }
                        None => {
                            if run_user_stream {
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        info!("shutting down");
        self.state.request_shutdown();
        let _ = self.shutdown_tx.send(());

        self.cancel_open_orders().await;

        for task in tasks {
            let _ = task.await;
        }
        info!("shutdown complete");
        Ok(())
    }

    /// Cancel resting orders for every token we track, best effort and
    /// bounded by the per-call timeout.
    async fn cancel_open_orders(&self) {
        let call_timeout = Duration::from_secs(self.config.trading.call_timeout_secs);
        for (token_id, _) in self.state.store.tokens_with_orders() {
            match timeout(call_timeout, self.exchange.cancel_all_for_token(&token_id)).await {
                Ok(Ok(())) => info!(token_id, "cancelled resting orders"),
                Ok(Err(e)) => warn!(token_id, "cancel on shutdown failed: {e}"),
                Err(_) => warn!(token_id, "cancel on shutdown timed out"),
            }
        }
    }
}
