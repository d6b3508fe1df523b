//! Trading core for the poly-quoter market-making agent.
//!
//! For each configured market the bot keeps resting bid and offer quotes,
//! accumulates inventory up to a per-market cap, hedges with take-profit
//! sells, and pauses markets on adverse moves or excessive volatility.
//!
//! ## Modules
//!
//! - `config`: typed configuration (TOML + env + CLI)
//! - `state`: shared state threaded through the core
//! - `position` / `pending`: inventory, tracked orders, pending intents
//! - `engine`: pure quote computation
//! - `risk`: pure risk evaluation and the durable risk-off registry
//! - `exchange`: exchange client interface and implementations
//! - `reconciler`: per-market serialized order reconciliation
//! - `user_stream`: private fills/orders websocket
//! - `scheduler`: periodic pulls, registry reloads, snapshots
//! - `sinks`: append-only structured record sinks
//! - `app`: wiring and lifecycle

pub mod app;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod pending;
pub mod position;
pub mod reconciler;
pub mod risk;
pub mod scheduler;
pub mod sinks;
pub mod state;
pub mod user_stream;

pub use app::App;
pub use config::{BotConfig, RunMode};
pub use engine::{compute_quotes, Quote, QuoteInputs, QuotePlan, QuoteThresholds};
pub use exchange::{
    ExchangeClient, ExchangeError, HttpGateway, OpenOrderRow, OrderAck, PaperExchange, PositionRow,
};
pub use pending::PendingIntents;
pub use position::{OpenOrder, Position, PositionStore, TokenOrders};
pub use reconciler::{Reconciler, ReconcilerConfig, Trigger, TriggerKind};
pub use risk::{RiskOffRecord, RiskOffRegistry};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use sinks::{CsvSink, EventSink, NullSink};
pub use state::CoreState;
pub use user_stream::{UserStream, UserStreamConfig, UserStreamEvent};
