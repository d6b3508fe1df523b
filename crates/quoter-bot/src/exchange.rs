//! Exchange client abstraction.
//!
//! The core never signs orders or formats exchange-native HTTP; that lives
//! in an external signing gateway. `HttpGateway` is the thin JSON client
//! for it, `PaperExchange` is an in-memory stub for paper mode and tests.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use quoter_common::Side;

/// Errors from exchange calls.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("exchange call timed out")]
    Timeout,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed exchange response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout
        } else if e.is_status() {
            match e.status() {
                Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => {
                    ExchangeError::Auth(e.to_string())
                }
                _ => ExchangeError::Rejected(e.to_string()),
            }
        } else {
            ExchangeError::Transport(e.to_string())
        }
    }
}

/// Acknowledgement of a placed order.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// One open order as reported by the exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrderRow {
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
}

/// One position as reported by the exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionRow {
    pub token_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
}

/// The exchange surface the core consumes. Implementations must be safe
/// for concurrent calls.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Place a post-only limit order. Size is in shares.
    async fn create_order(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Result<OrderAck, ExchangeError>;

    /// Cancel every resting order on a token. The exchange offers no
    /// per-order cancel, only this token-wide operation.
    async fn cancel_all_for_token(&self, token_id: &str) -> Result<(), ExchangeError>;

    async fn list_open_orders(&self) -> Result<Vec<OpenOrderRow>, ExchangeError>;

    async fn list_positions(&self) -> Result<Vec<PositionRow>, ExchangeError>;

    async fn stablecoin_balance(&self) -> Result<Decimal, ExchangeError>;

    /// Merge equal amounts of complementary tokens back into stablecoin.
    /// Amount is in microshares (1 share = 1_000_000).
    async fn merge_complementary(
        &self,
        condition_id: &str,
        amount_microshares: u64,
        neg_risk: bool,
    ) -> Result<(), ExchangeError>;
}

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    token_id: &'a str,
    side: Side,
    price: String,
    size: String,
    post_only: bool,
}

#[derive(Debug, Serialize)]
struct CancelAllBody<'a> {
    token_id: &'a str,
}

#[derive(Debug, Serialize)]
struct MergeBody<'a> {
    condition_id: &'a str,
    amount_microshares: u64,
    neg_risk: bool,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(with = "rust_decimal::serde::str")]
    balance: Decimal,
}

/// JSON client for the local signing gateway.
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ExchangeClient for HttpGateway {
    async fn create_order(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Result<OrderAck, ExchangeError> {
        let body = CreateOrderBody {
            token_id,
            side,
            price: price.to_string(),
            size: size.to_string(),
            post_only: true,
        };
        let ack = self
            .client
            .post(format!("{}/orders", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<OrderAck>()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        debug!(token_id, %side, %price, %size, order_id = %ack.order_id, "order placed");
        Ok(ack)
    }

    async fn cancel_all_for_token(&self, token_id: &str) -> Result<(), ExchangeError> {
        self.client
            .post(format!("{}/orders/cancel-all", self.base_url))
            .json(&CancelAllBody { token_id })
            .send()
            .await?
            .error_for_status()?;
        debug!(token_id, "cancelled all orders for token");
        Ok(())
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrderRow>, ExchangeError> {
        let rows = self
            .client
            .get(format!("{}/orders", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<OpenOrderRow>>()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        Ok(rows)
    }

    async fn list_positions(&self) -> Result<Vec<PositionRow>, ExchangeError> {
        let rows = self
            .client
            .get(format!("{}/positions", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<PositionRow>>()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        Ok(rows)
    }

    async fn stablecoin_balance(&self) -> Result<Decimal, ExchangeError> {
        let resp = self
            .client
            .get(format!("{}/balance", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json::<BalanceResponse>()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        Ok(resp.balance)
    }

    async fn merge_complementary(
        &self,
        condition_id: &str,
        amount_microshares: u64,
        neg_risk: bool,
    ) -> Result<(), ExchangeError> {
        self.client
            .post(format!("{}/merge", self.base_url))
            .json(&MergeBody {
                condition_id,
                amount_microshares,
                neg_risk,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// One recorded call against the paper exchange, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaperCall {
    Create {
        token_id: String,
        side: Side,
        price: Decimal,
        size: Decimal,
    },
    CancelAll {
        token_id: String,
    },
    Merge {
        condition_id: String,
        amount_microshares: u64,
    },
}

#[derive(Debug, Default)]
struct PaperInner {
    orders: Vec<OpenOrderRow>,
    positions: Vec<PositionRow>,
    balance: Decimal,
    calls: Vec<PaperCall>,
    next_id: u64,
}

/// In-memory exchange stub.
///
/// Records orders and returns generated ids without matching anything;
/// fills never happen here. Positions and balance are settable so tests
/// and paper runs can shape the authoritative pull.
#[derive(Debug, Default)]
pub struct PaperExchange {
    inner: Mutex<PaperInner>,
}

impl PaperExchange {
    pub fn new(balance: Decimal) -> Self {
        Self {
            inner: Mutex::new(PaperInner {
                balance,
                ..PaperInner::default()
            }),
        }
    }

    pub fn set_positions(&self, positions: Vec<PositionRow>) {
        self.inner.lock().positions = positions;
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.inner.lock().balance = balance;
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<PaperCall> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn open_orders(&self) -> Vec<OpenOrderRow> {
        self.inner.lock().orders.clone()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn create_order(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Result<OrderAck, ExchangeError> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let order_id = format!("paper-{}", inner.next_id);
        inner.orders.push(OpenOrderRow {
            order_id: order_id.clone(),
            token_id: token_id.to_string(),
            side,
            price,
            size,
        });
        inner.calls.push(PaperCall::Create {
            token_id: token_id.to_string(),
            side,
            price,
            size,
        });
        Ok(OrderAck { order_id })
    }

    async fn cancel_all_for_token(&self, token_id: &str) -> Result<(), ExchangeError> {
        let mut inner = self.inner.lock();
        inner.orders.retain(|o| o.token_id != token_id);
        inner.calls.push(PaperCall::CancelAll {
            token_id: token_id.to_string(),
        });
        Ok(())
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrderRow>, ExchangeError> {
        Ok(self.inner.lock().orders.clone())
    }

    async fn list_positions(&self) -> Result<Vec<PositionRow>, ExchangeError> {
        Ok(self.inner.lock().positions.clone())
    }

    async fn stablecoin_balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.inner.lock().balance)
    }

    async fn merge_complementary(
        &self,
        condition_id: &str,
        amount_microshares: u64,
        _neg_risk: bool,
    ) -> Result<(), ExchangeError> {
        self.inner.lock().calls.push(PaperCall::Merge {
            condition_id: condition_id.to_string(),
            amount_microshares,
        });
        Ok(())
    }
}
