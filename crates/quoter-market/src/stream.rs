//! Public market websocket client.
//!
//! Connects to the exchange's market channel, subscribes to the token set
//! of all enabled markets, applies book snapshots and deltas to the
//! `BookStore`, and emits one event per affected market so the reconciler
//! can react. The subscription set is watched and diffed live; removed
//! tokens are filtered out, added tokens are subscribed on the open
//! connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
};
use tracing::{debug, info, warn};

use crate::book::BookStore;
use crate::types::{BookMessage, GenericMessage, PriceChangeMessage, SubscribeMessage, SubscriptionOp};

/// Keepalive interval; the exchange drops quiet connections after ~10s.
const PING_INTERVAL: Duration = Duration::from_secs(9);

/// Errors from the market stream.
#[derive(Debug, Error)]
pub enum BookStreamError {
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("connection timeout")]
    Timeout,

    #[error("stream ended unexpectedly")]
    StreamEnded,
}

/// Configuration for the market stream.
#[derive(Debug, Clone)]
pub struct MarketStreamConfig {
    /// Market channel websocket URL.
    pub url: String,
    pub connect_timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// How often to diff the watched subscription set on a live connection.
    pub subscription_check_interval: Duration,
}

impl Default for MarketStreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            connect_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            subscription_check_interval: Duration::from_secs(30),
        }
    }
}

/// Events emitted toward the trading core.
#[derive(Debug, Clone)]
pub enum MarketStreamEvent {
    /// Book state changed for a market.
    Update { condition_id: String },
    /// Connection (re)established and subscribed; a full pull should follow.
    Connected,
    /// Connection lost; the client will reconnect on its own.
    Disconnected(String),
}

/// Market websocket client with automatic reconnection.
pub struct MarketStream {
    config: MarketStreamConfig,
    books: Arc<BookStore>,
    event_tx: mpsc::Sender<MarketStreamEvent>,
    /// Current subscription set, updated by the scheduler on registry reload.
    tokens_rx: watch::Receiver<Vec<String>>,
}

impl MarketStream {
    pub fn new(
        config: MarketStreamConfig,
        books: Arc<BookStore>,
        event_tx: mpsc::Sender<MarketStreamEvent>,
        tokens_rx: watch::Receiver<Vec<String>>,
    ) -> Self {
        Self {
            config,
            books,
            event_tx,
            tokens_rx,
        }
    }

    /// Run with reconnection until shutdown. Backoff doubles from the
    /// initial delay up to the cap, with jitter so a fleet of bots does
    /// not thunder back in lockstep.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), BookStreamError> {
        let mut reconnect_delay = self.config.initial_reconnect_delay;

        loop {
            if shutdown.try_recv().is_ok() {
                info!("market stream: shutdown signal received");
                return Ok(());
            }

            if self.tokens_rx.borrow().is_empty() {
                debug!("no tokens to subscribe to, waiting");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    _ = shutdown.recv() => return Ok(()),
                }
            }

            match self.run_connection(&mut shutdown).await {
                Ok(()) => {
                    info!("market stream: clean shutdown");
                    return Ok(());
                }
                Err(e) => {
                    let delay = with_jitter(reconnect_delay);
                    warn!("market stream error: {e}, reconnecting in {delay:?}");
                    let _ = self
                        .event_tx
                        .send(MarketStreamEvent::Disconnected(e.to_string()))
                        .await;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => return Ok(()),
                    }
                    reconnect_delay = (reconnect_delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }
    }

    async fn run_connection(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), BookStreamError> {
        info!(url = %self.config.url, "connecting to market websocket");

        let connect_result = timeout(self.config.connect_timeout, connect_async(&self.config.url)).await;
        let (ws_stream, _response) = match connect_result {
            Ok(Ok((stream, response))) => (stream, response),
            Ok(Err(e)) => return Err(BookStreamError::Connection(e.to_string())),
            Err(_) => return Err(BookStreamError::Timeout),
        };

        let (mut write, mut read) = ws_stream.split();

        let token_ids: Vec<String> = self.tokens_rx.borrow().clone();
        if token_ids.is_empty() {
            return Err(BookStreamError::StreamEnded);
        }

        let subscribe = SubscribeMessage {
            assets_ids: token_ids.clone(),
            msg_type: "market",
        };
        let msg = serde_json::to_string(&subscribe)
            .map_err(|e| BookStreamError::Connection(e.to_string()))?;
        write.send(Message::Text(msg)).await?;
        info!("subscribed to {} market tokens", token_ids.len());

        let mut subscribed: HashSet<String> = token_ids.into_iter().collect();
        let _ = self.event_tx.send(MarketStreamEvent::Connected).await;

        let mut ping_timer = interval(PING_INTERVAL);
        let mut subscription_check = interval(self.config.subscription_check_interval);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_message(&text, &subscribed).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            info!("market websocket closed by server: {:?}", frame);
                            return Err(BookStreamError::StreamEnded);
                        }
                        Some(Err(e)) => return Err(BookStreamError::WebSocket(e)),
                        None => return Err(BookStreamError::StreamEnded),
                        _ => {}
                    }
                }

                _ = ping_timer.tick() => {
                    write.send(Message::Text("PING".to_string())).await?;
                }

                _ = subscription_check.tick() => {
                    let desired: HashSet<String> =
                        self.tokens_rx.borrow().iter().cloned().collect();

                    let added: Vec<String> =
                        desired.difference(&subscribed).cloned().collect();
                    if !added.is_empty() {
                        info!("subscribing to {} new tokens", added.len());
                        let op = SubscriptionOp {
                            assets_ids: added.clone(),
                            operation: "subscribe",
                        };
                        let msg = serde_json::to_string(&op)
                            .map_err(|e| BookStreamError::Connection(e.to_string()))?;
                        write.send(Message::Text(msg)).await?;
                        subscribed.extend(added);
                    }

                    // Dropped tokens are filtered on receive; prune their books.
                    if subscribed.iter().any(|t| !desired.contains(t)) {
                        subscribed.retain(|t| desired.contains(t));
                        self.books.retain_tokens(&subscribed);
                    }
                }

                _ = shutdown.recv() => {
                    info!("market stream: shutdown signal received");
                    return Ok(());
                }
            }
        }
    }

    /// The channel delivers single events or batches; handle both.
    async fn handle_message(&self, text: &str, subscribed: &HashSet<String>) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                // PONG and other non-JSON frames
                debug!("non-JSON market message: {text}");
                return;
            }
        };
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    self.handle_event(item, subscribed).await;
                }
            }
            other => self.handle_event(other, subscribed).await,
        }
    }

    async fn handle_event(&self, value: serde_json::Value, subscribed: &HashSet<String>) {
        let generic: GenericMessage = match serde_json::from_value(value.clone()) {
            Ok(m) => m,
            Err(e) => {
                warn!("unparseable market event: {e}");
                return;
            }
        };

        match generic.event_type.as_deref() {
            Some("book") => {
                let book: BookMessage = match serde_json::from_value(value) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("failed to parse book message: {e}");
                        return;
                    }
                };
                if !subscribed.contains(&book.asset_id) {
                    debug!(token = %book.asset_id, "ignoring book for unsubscribed token");
                    return;
                }
                self.books.apply_snapshot(&book);
                let _ = self
                    .event_tx
                    .send(MarketStreamEvent::Update {
                        condition_id: book.market,
                    })
                    .await;
            }
            Some("price_change") => {
                let msg: PriceChangeMessage = match serde_json::from_value(value) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("failed to parse price_change message: {e}");
                        return;
                    }
                };
                if !subscribed.contains(&msg.asset_id) {
                    debug!(token = %msg.asset_id, "ignoring delta for unsubscribed token");
                    return;
                }
                self.books.apply_price_changes(&msg);
                let _ = self
                    .event_tx
                    .send(MarketStreamEvent::Update {
                        condition_id: msg.market,
                    })
                    .await;
            }
            Some("last_trade_price") | Some("tick_size_change") => {
                debug!(event = ?generic.event_type, "ignoring market event");
            }
            other => {
                debug!("unknown market message type: {other:?}");
            }
        }
    }
}

/// Add up to 25% random jitter to a reconnect delay.
pub fn with_jitter(base: Duration) -> Duration {
    let jitter_ms = base.as_millis() as u64 / 4;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
