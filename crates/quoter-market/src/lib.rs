//! Market-data plumbing for poly-quoter.
//!
//! - `book`: in-memory per-token order books fed by the market stream
//! - `stream`: public CLOB websocket client with live resubscription
//! - `registry`: typed market universe loaded from an external collaborator
//! - `types`: wire messages for the market channel

pub mod book;
pub mod registry;
pub mod stream;
pub mod types;

pub use book::{BookStore, BookTop, OrderBook};
pub use registry::{
    FileRegistry, HttpRegistry, Market, MarketEntry, RegistryError, RegistrySnapshot,
    RegistrySource, StrategyParameters, StrategyProfile, TradeConfig,
};
pub use stream::{with_jitter, BookStreamError, MarketStream, MarketStreamConfig, MarketStreamEvent};
