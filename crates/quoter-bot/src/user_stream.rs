//! Private user websocket.
//!
//! Authenticated stream of our own trades and order updates. Trade events
//! are resolved against our funder address to decide whether we were maker
//! or taker (and on which token of the pair); fills are applied eagerly
//! and tracked as pending intents until the exchange confirms them. Order
//! events keep the open-order store current between pulls.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
};
use tracing::{debug, info, warn};

use quoter_common::{Side, TradeLogRecord};

use crate::sinks::EventSink;
use crate::state::CoreState;

const PING_INTERVAL: Duration = Duration::from_secs(9);

/// Errors from the user stream.
#[derive(Debug, Error)]
pub enum UserStreamError {
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("connection timeout")]
    Timeout,

    #[error("stream ended unexpectedly")]
    StreamEnded,

    #[error("authentication rejected: {0}")]
    Auth(String),
}

/// Configuration for the user stream.
#[derive(Debug, Clone)]
pub struct UserStreamConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    /// Funder wallet address; identifies our maker orders inside trades.
    pub funder_address: String,
}

impl Default for UserStreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws-subscriptions-clob.polymarket.com/ws/user".to_string(),
            connect_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            api_key: String::new(),
            api_secret: String::new(),
            api_passphrase: String::new(),
            funder_address: String::new(),
        }
    }
}

/// Events emitted toward the trading core.
#[derive(Debug, Clone)]
pub enum UserStreamEvent {
    /// A fill or order update touched this market.
    Update { condition_id: String },
    /// Authenticated and listening; a full pull should follow.
    Connected,
    Disconnected(String),
}

#[derive(Debug, Serialize)]
struct AuthEnvelope<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    auth: AuthFields<'a>,
}

#[derive(Debug, Serialize)]
struct AuthFields<'a> {
    #[serde(rename = "apiKey")]
    api_key: &'a str,
    secret: &'a str,
    passphrase: &'a str,
}

#[derive(Debug, Deserialize)]
struct UserGenericMessage {
    event_type: Option<String>,
    #[serde(rename = "type")]
    msg_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// One maker order inside a trade event.
#[derive(Debug, Clone, Deserialize)]
struct MakerOrder {
    #[serde(default)]
    maker_address: String,
    #[serde(default)]
    matched_amount: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    outcome: String,
    #[serde(default)]
    asset_id: Option<String>,
}

/// Trade event from the user channel.
#[derive(Debug, Clone, Deserialize)]
struct UserTradeMessage {
    id: String,
    /// Condition ID of the market.
    market: String,
    asset_id: String,
    side: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    price: String,
    status: String,
    #[serde(default)]
    outcome: String,
    #[serde(default)]
    maker_orders: Vec<MakerOrder>,
}

/// Order event from the user channel.
#[derive(Debug, Clone, Deserialize)]
struct UserOrderMessage {
    id: String,
    market: String,
    asset_id: String,
    side: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    original_size: String,
    #[serde(default)]
    size_matched: String,
    #[serde(default)]
    status: String,
}

/// A trade event resolved to the fill we actually received.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedFill {
    token_id: String,
    side: Side,
    size: Decimal,
    price: Decimal,
}

/// Private user websocket client with automatic reconnection.
pub struct UserStream {
    config: UserStreamConfig,
    state: Arc<CoreState>,
    sink: Arc<dyn EventSink>,
    event_tx: mpsc::Sender<UserStreamEvent>,
}

impl UserStream {
    pub fn new(
        config: UserStreamConfig,
        state: Arc<CoreState>,
        sink: Arc<dyn EventSink>,
        event_tx: mpsc::Sender<UserStreamEvent>,
    ) -> Self {
        Self {
            config,
            state,
            sink,
            event_tx,
        }
    }

    /// Run with reconnection until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), UserStreamError> {
        let mut reconnect_delay = self.config.initial_reconnect_delay;

        loop {
            if shutdown.try_recv().is_ok() {
                info!("user stream: shutdown signal received");
                return Ok(());
            }

            match self.run_connection(&mut shutdown).await {
                Ok(()) => {
                    info!("user stream: clean shutdown");
                    return Ok(());
                }
                Err(UserStreamError::Auth(msg)) => {
                    // Bad credentials will not heal on retry.
                    return Err(UserStreamError::Auth(msg));
                }
                Err(e) => {
                    let delay = quoter_market::with_jitter(reconnect_delay);
                    warn!("user stream error: {e}, reconnecting in {delay:?}");
                    let _ = self
                        .event_tx
                        .send(UserStreamEvent::Disconnected(e.to_string()))
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
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), UserStreamError> {
        info!(url = %self.config.url, "connecting to user websocket");

        let connect_result = timeout(self.config.connect_timeout, connect_async(&self.config.url)).await;
        let (ws_stream, _response) = match connect_result {
            Ok(Ok((stream, response))) => (stream, response),
            Ok(Err(e)) => return Err(UserStreamError::Connection(e.to_string())),
            Err(_) => return Err(UserStreamError::Timeout),
        };

        let (mut write, mut read) = ws_stream.split();

        let auth = AuthEnvelope {
            msg_type: "user",
            auth: AuthFields {
                api_key: &self.config.api_key,
                secret: &self.config.api_secret,
                passphrase: &self.config.api_passphrase,
            },
        };
        let msg = serde_json::to_string(&auth)
            .map_err(|e| UserStreamError::Connection(e.to_string()))?;
        write.send(Message::Text(msg)).await?;
        info!("sent user websocket authentication");

        let _ = self.event_tx.send(UserStreamEvent::Connected).await;
        // Reconnects may have missed fills; force an authoritative pull.
        self.state.pull_notify.notify_one();

        let mut ping_timer = interval(PING_INTERVAL);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            info!("user websocket closed by server: {:?}", frame);
                            return Err(UserStreamError::StreamEnded);
                        }
                        Some(Err(e)) => return Err(UserStreamError::WebSocket(e)),
                        None => return Err(UserStreamError::StreamEnded),
                        _ => {}
                    }
                }

                _ = ping_timer.tick() => {
                    write.send(Message::Text("PING".to_string())).await?;
                }

                _ = shutdown.recv() => {
                    info!("user stream: shutdown signal received");
                    return Ok(());
                }
            }
        }
    }

    /// The channel delivers single objects or batches; handle both.
    async fn handle_text(&self, text: &str) -> Result<(), UserStreamError> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                debug!("non-JSON user message: {text}");
                return Ok(());
            }
        };
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    self.handle_event(item).await?;
                }
            }
            other => self.handle_event(other).await?,
        }
        Ok(())
    }

    async fn handle_event(&self, value: serde_json::Value) -> Result<(), UserStreamError> {
        let generic: UserGenericMessage = match serde_json::from_value(value.clone()) {
            Ok(g) => g,
            Err(e) => {
                warn!("unparseable user event: {e}");
                return Ok(());
            }
        };

        if generic.msg_type.as_deref() == Some("error") || generic.error.is_some() {
            let msg = generic
                .message
                .or(generic.error)
                .unwrap_or_else(|| "unknown error".to_string());
            if msg.to_lowercase().contains("auth") || msg.to_lowercase().contains("credential") {
                return Err(UserStreamError::Auth(msg));
            }
            warn!("user websocket error message: {msg}");
            return Ok(());
        }

        match generic.event_type.as_deref() {
            Some("trade") => match serde_json::from_value::<UserTradeMessage>(value) {
                Ok(msg) => self.handle_trade(msg).await,
                Err(e) => warn!("failed to parse trade event: {e}"),
            },
            Some("order") => match serde_json::from_value::<UserOrderMessage>(value) {
                Ok(msg) => self.handle_order(msg).await,
                Err(e) => warn!("failed to parse order event: {e}"),
            },
            other => debug!("unhandled user event type: {other:?}"),
        }
        Ok(())
    }

    async fn handle_trade(&self, msg: UserTradeMessage) {
        let registry = self.state.registry();
        if registry.condition_for_token(&msg.asset_id).is_none() {
            warn!(trade_id = %msg.id, token_id = %msg.asset_id, "trade for unknown token, discarding");
            return;
        }
        let Some(fill) = resolve_trade(&msg, &self.config.funder_address, |token| {
            registry.reverse_token(token).map(String::from)
        }) else {
            warn!(trade_id = %msg.id, "could not resolve trade event, discarding");
            return;
        };

        info!(
            trade_id = %msg.id,
            status = %msg.status,
            token_id = %fill.token_id,
            side = %fill.side,
            size = %fill.size,
            price = %fill.price,
            "trade event"
        );

        match msg.status.as_str() {
            "MATCHED" => {
                let before = self.state.store.position(&fill.token_id).size;
                self.state.pending.insert(&msg.id, &fill.token_id);
                self.state
                    .store
                    .apply_fill(&fill.token_id, fill.side, fill.size, fill.price);
                let after = self.state.store.position(&fill.token_id).size;

                self.sink.log_trade(&TradeLogRecord {
                    timestamp: Utc::now(),
                    condition_id: msg.market.clone(),
                    token_id: fill.token_id.clone(),
                    side: fill.side,
                    price: fill.price,
                    size: fill.size,
                    trade_id: msg.id.clone(),
                    status: msg.status.clone(),
                    position_before: before,
                    position_after: after,
                });
            }
            "CONFIRMED" => {
                self.state.pending.remove(&msg.id);
            }
            "FAILED" => {
                let size = self.state.store.position(&fill.token_id).size;
                self.state.pending.remove(&msg.id);
                // Local accounting is now suspect; get the truth.
                self.state.pull_notify.notify_one();

                self.sink.log_trade(&TradeLogRecord {
                    timestamp: Utc::now(),
                    condition_id: msg.market.clone(),
                    token_id: fill.token_id.clone(),
                    side: fill.side,
                    price: fill.price,
                    size: fill.size,
                    trade_id: msg.id.clone(),
                    status: msg.status.clone(),
                    position_before: size,
                    position_after: size,
                });
            }
            "MINED" => {
                self.state.pending.remove(&msg.id);
                return;
            }
            other => {
                debug!(status = other, "ignoring trade status");
                return;
            }
        }

        let _ = self
            .event_tx
            .send(UserStreamEvent::Update {
                condition_id: msg.market,
            })
            .await;
    }

    async fn handle_order(&self, msg: UserOrderMessage) {
        let side = match Side::parse(&msg.side) {
            Some(s) => s,
            None => {
                warn!(order_id = %msg.id, side = %msg.side, "order event with unknown side");
                return;
            }
        };
        let price: Decimal = msg.price.parse().unwrap_or(Decimal::ZERO);
        let original: Decimal = msg.original_size.parse().unwrap_or(Decimal::ZERO);
        let matched: Decimal = msg.size_matched.parse().unwrap_or(Decimal::ZERO);

        let remaining = if msg.status.eq_ignore_ascii_case("CANCELLATION")
            || msg.status.eq_ignore_ascii_case("CANCELED")
        {
            Decimal::ZERO
        } else {
            (original - matched).max(Decimal::ZERO)
        };

        info!(
            order_id = %msg.id,
            token_id = %msg.asset_id,
            %side,
            status = %msg.status,
            %remaining,
            "order event"
        );
        self.state
            .store
            .apply_order_update(&msg.asset_id, side, &msg.id, price, remaining);

        let _ = self
            .event_tx
            .send(UserStreamEvent::Update {
                condition_id: msg.market,
            })
            .await;
    }
}

/// Resolve a trade event against our funder address.
///
/// If one of the maker orders is ours, the fill size and price come from
/// that maker order; when maker and taker outcomes coincide the side flips
/// (we were on the other side of the print), and when they differ the fill
/// lands on the complementary token. Otherwise we were the taker and the
/// top-level fields stand.
fn resolve_trade(
    msg: &UserTradeMessage,
    funder_address: &str,
    reverse_token: impl Fn(&str) -> Option<String>,
) -> Option<ResolvedFill> {
    let mut side = Side::parse(&msg.side)?;
    let mut token_id = msg.asset_id.clone();
    let mut size: Decimal = msg.size.parse().unwrap_or(Decimal::ZERO);
    let mut price: Decimal = msg.price.parse().unwrap_or(Decimal::ZERO);

    let mut is_maker = false;
    for maker in &msg.maker_orders {
        if !maker.maker_address.eq_ignore_ascii_case(funder_address) {
            continue;
        }
        is_maker = true;
        size = maker.matched_amount.parse().unwrap_or(Decimal::ZERO);
        price = maker.price.parse().unwrap_or(Decimal::ZERO);
        if maker.outcome == msg.outcome {
            side = side.opposite();
        } else if let Some(reverse) = maker
            .asset_id
            .clone()
            .or_else(|| reverse_token(&token_id))
        {
            token_id = reverse;
        }
        break;
    }

    if !is_maker {
        debug!(trade_id = %msg.id, "we were taker");
    }

    if size <= Decimal::ZERO || price <= Decimal::ZERO {
        return None;
    }

    Some(ResolvedFill {
        token_id,
        side,
        size,
        price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const FUNDER: &str = "0xFunder";

    fn trade_msg(side: &str, status: &str) -> UserTradeMessage {
        UserTradeMessage {
            id: "trade-1".to_string(),
            market: "cond1".to_string(),
            asset_id: "tokenA".to_string(),
            side: side.to_string(),
            size: "40".to_string(),
            price: "0.50".to_string(),
            status: status.to_string(),
            outcome: "Yes".to_string(),
            maker_orders: Vec::new(),
        }
    }

    #[test]
    fn test_resolve_taker_trade() {
        let msg = trade_msg("BUY", "MATCHED");
        let fill = resolve_trade(&msg, FUNDER, |_| None).unwrap();
        assert_eq!(
            fill,
            ResolvedFill {
                token_id: "tokenA".to_string(),
                side: Side::Buy,
                size: dec!(40),
                price: dec!(0.50),
            }
        );
    }

    #[test]
    fn test_resolve_maker_same_outcome_flips_side() {
        let mut msg = trade_msg("SELL", "MATCHED");
        msg.maker_orders = vec![MakerOrder {
            maker_address: FUNDER.to_lowercase(),
            matched_amount: "15".to_string(),
            price: "0.49".to_string(),
            outcome: "Yes".to_string(),
            asset_id: None,
        }];

        let fill = resolve_trade(&msg, FUNDER, |_| None).unwrap();
        // Taker sold Yes, our maker order bought Yes
        assert_eq!(fill.side, Side::Buy);
        assert_eq!(fill.size, dec!(15));
        assert_eq!(fill.price, dec!(0.49));
        assert_eq!(fill.token_id, "tokenA");
    }

    #[test]
    fn test_resolve_maker_other_outcome_redirects_token() {
        let mut msg = trade_msg("BUY", "MATCHED");
        msg.maker_orders = vec![MakerOrder {
            maker_address: FUNDER.to_string(),
            matched_amount: "10".to_string(),
            price: "0.52".to_string(),
            outcome: "No".to_string(),
            asset_id: None,
        }];

        let fill = resolve_trade(&msg, FUNDER, |t| {
            assert_eq!(t, "tokenA");
            Some("tokenB".to_string())
        })
        .unwrap();
        assert_eq!(fill.token_id, "tokenB");
        assert_eq!(fill.side, Side::Buy);
        assert_eq!(fill.size, dec!(10));
    }

    #[test]
    fn test_resolve_foreign_maker_is_taker_fill() {
        let mut msg = trade_msg("BUY", "MATCHED");
        msg.maker_orders = vec![MakerOrder {
            maker_address: "0xSomeoneElse".to_string(),
            matched_amount: "99".to_string(),
            price: "0.99".to_string(),
            outcome: "Yes".to_string(),
            asset_id: None,
        }];

        let fill = resolve_trade(&msg, FUNDER, |_| None).unwrap();
        assert_eq!(fill.size, dec!(40));
        assert_eq!(fill.price, dec!(0.50));
    }

    #[test]
    fn test_resolve_rejects_zero_size() {
        let mut msg = trade_msg("BUY", "MATCHED");
        msg.size = "0".to_string();
        assert!(resolve_trade(&msg, FUNDER, |_| None).is_none());
    }

    fn test_registry() -> quoter_market::RegistrySnapshot {
        use quoter_market::{Market, MarketEntry, StrategyProfile, TradeConfig};
        let entry = MarketEntry {
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
        };
        quoter_market::RegistrySnapshot::new(vec![entry], std::collections::HashMap::new())
    }

    fn harness() -> (UserStream, Arc<CoreState>, mpsc::Receiver<UserStreamEvent>) {
        let state = Arc::new(CoreState::new(60));
        state.set_registry(Arc::new(test_registry()));
        let (event_tx, event_rx) = mpsc::channel(16);
        let stream = UserStream::new(
            UserStreamConfig {
                funder_address: FUNDER.to_string(),
                ..UserStreamConfig::default()
            },
            Arc::clone(&state),
            Arc::new(crate::sinks::NullSink),
            event_tx,
        );
        (stream, state, event_rx)
    }

    #[tokio::test]
    async fn test_matched_trade_applies_fill_and_pends() {
        let (stream, state, mut event_rx) = harness();

        stream.handle_trade(trade_msg("BUY", "MATCHED")).await;

        let pos = state.store.position("tokenA");
        assert_eq!(pos.size, dec!(40));
        assert_eq!(pos.avg_price, Some(dec!(0.50)));
        assert!(state.pending.has_pending("tokenA"));

        match event_rx.recv().await.unwrap() {
            UserStreamEvent::Update { condition_id } => assert_eq!(condition_id, "cond1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_confirmed_trade_clears_pending() {
        let (stream, state, _event_rx) = harness();

        stream.handle_trade(trade_msg("BUY", "MATCHED")).await;
        assert_eq!(state.pending.len(), 1);

        stream.handle_trade(trade_msg("BUY", "CONFIRMED")).await;
        assert!(state.pending.is_empty());
        // Fill applied exactly once
        assert_eq!(state.store.position("tokenA").size, dec!(40));
    }

    #[tokio::test]
    async fn test_trade_for_unknown_token_is_discarded() {
        let (stream, state, mut event_rx) = harness();

        let mut msg = trade_msg("BUY", "MATCHED");
        msg.asset_id = "mystery-token".to_string();
        stream.handle_trade(msg).await;

        assert!(state.store.position("mystery-token").is_empty());
        assert!(state.pending.is_empty());
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_order_event_updates_store() {
        let (stream, state, _event_rx) = harness();

        let order = UserOrderMessage {
            id: "o1".to_string(),
            market: "cond1".to_string(),
            asset_id: "tokenA".to_string(),
            side: "BUY".to_string(),
            price: "0.50".to_string(),
            original_size: "40".to_string(),
            size_matched: "15".to_string(),
            status: "UPDATE".to_string(),
        };
        stream.handle_order(order).await;

        let resting = state.store.orders("tokenA").buy.unwrap();
        assert_eq!(resting.size, dec!(25));
        assert_eq!(resting.price, dec!(0.50));
    }

    #[tokio::test]
    async fn test_cancellation_order_event_clears_slot() {
        let (stream, state, _event_rx) = harness();
        state
            .store
            .apply_order_ack("tokenA", Side::Buy, "o1".to_string(), dec!(0.50), dec!(40));

        let order = UserOrderMessage {
            id: "o1".to_string(),
            market: "cond1".to_string(),
            asset_id: "tokenA".to_string(),
            side: "BUY".to_string(),
            price: "0.50".to_string(),
            original_size: "40".to_string(),
            size_matched: "0".to_string(),
            status: "CANCELLATION".to_string(),
        };
        stream.handle_order(order).await;

        assert!(state.store.orders("tokenA").buy.is_none());
    }
}
