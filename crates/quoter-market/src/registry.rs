//! Market registry: the typed view of the market universe.
//!
//! The universe itself is curated by an external collaborator and exposed
//! as two logical tables: markets with their exchange parameters, and a
//! per-market trade config plus the strategy-profile parameter table. The
//! core reads a parsed snapshot and never writes back.
//!
//! Rows that fail to parse disable the market rather than failing the load.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Request timeout for registry fetches.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from loading the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Named bundle of risk thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyProfile {
    Conservative,
    Default,
    Aggressive,
}

impl StrategyProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyProfile::Conservative => "conservative",
            StrategyProfile::Default => "default",
            StrategyProfile::Aggressive => "aggressive",
        }
    }

    /// Parse the loosely-typed profile column; empty means default.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "conservative" => Some(StrategyProfile::Conservative),
            "default" | "" => Some(StrategyProfile::Default),
            "aggressive" => Some(StrategyProfile::Aggressive),
            _ => None,
        }
    }
}

impl std::fmt::Display for StrategyProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-profile trading hyperparameters.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyParameters {
    /// Stop-loss trigger on unrealized pnl percent (negative, e.g. -5).
    #[serde(with = "rust_decimal::serde::str")]
    pub stop_loss_threshold: Decimal,
    /// Take-profit markup percent over avg price (e.g. 10).
    #[serde(with = "rust_decimal::serde::str")]
    pub take_profit_threshold: Decimal,
    /// Ceiling on the external volatility scalar before pausing buys.
    #[serde(with = "rust_decimal::serde::str")]
    pub volatility_threshold: Decimal,
    /// Max spread at which a stop-loss may fire (tight book required).
    #[serde(with = "rust_decimal::serde::str")]
    pub spread_threshold: Decimal,
    /// How long a risk-off pause lasts.
    pub sleep_period_hours: u32,
}

impl Default for StrategyParameters {
    fn default() -> Self {
        Self {
            stop_loss_threshold: Decimal::new(-5, 0),
            take_profit_threshold: Decimal::new(10, 0),
            volatility_threshold: Decimal::new(20, 0),
            spread_threshold: Decimal::new(2, 2),
            sleep_period_hours: 4,
        }
    }
}

/// Exchange-side parameters for one market.
#[derive(Debug, Clone)]
pub struct Market {
    pub condition_id: String,
    /// First outcome token; its complement is `token_b`.
    pub token_a: String,
    pub token_b: String,
    pub neg_risk: bool,
    pub tick_size: Decimal,
    /// Minimum order size, in shares.
    pub min_size: Decimal,
    /// Max spread at which the engine will still bid.
    pub max_spread: Decimal,
    pub profile: StrategyProfile,
}

impl Market {
    /// The complementary token of `token_id`, if it belongs to this market.
    pub fn reverse(&self, token_id: &str) -> Option<&str> {
        if token_id == self.token_a {
            Some(&self.token_b)
        } else if token_id == self.token_b {
            Some(&self.token_a)
        } else {
            None
        }
    }
}

/// Per-market trade sizing, in stablecoin notional.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeConfig {
    #[serde(with = "rust_decimal::serde::str")]
    pub trade_size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_size: Decimal,
    pub enabled: bool,
    /// Size multiplier applied when the buy price is below 0.10.
    #[serde(default = "default_multiplier", with = "rust_decimal::serde::str")]
    pub low_price_multiplier: Decimal,
}

fn default_multiplier() -> Decimal {
    Decimal::ONE
}

/// One fully-resolved market: parameters, sizing, and volatility signal.
#[derive(Debug, Clone)]
pub struct MarketEntry {
    pub market: Market,
    pub trade: TradeConfig,
    /// Scalar from the external volatility collector.
    pub volatility: Decimal,
}

/// Parsed registry snapshot with lookup indexes.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    entries: HashMap<String, MarketEntry>,
    token_to_condition: HashMap<String, String>,
    profiles: HashMap<String, StrategyParameters>,
}

impl RegistrySnapshot {
    pub fn new(
        entries: Vec<MarketEntry>,
        profiles: HashMap<String, StrategyParameters>,
    ) -> Self {
        let mut by_condition = HashMap::with_capacity(entries.len());
        let mut token_to_condition = HashMap::with_capacity(entries.len() * 2);
        for entry in entries {
            let cid = entry.market.condition_id.clone();
            token_to_condition.insert(entry.market.token_a.clone(), cid.clone());
            token_to_condition.insert(entry.market.token_b.clone(), cid.clone());
            by_condition.insert(cid, entry);
        }
        Self {
            entries: by_condition,
            token_to_condition,
            profiles,
        }
    }

    pub fn get(&self, condition_id: &str) -> Option<&MarketEntry> {
        self.entries.get(condition_id)
    }

    pub fn by_token(&self, token_id: &str) -> Option<&MarketEntry> {
        self.token_to_condition
            .get(token_id)
            .and_then(|cid| self.entries.get(cid))
    }

    pub fn condition_for_token(&self, token_id: &str) -> Option<&str> {
        self.token_to_condition.get(token_id).map(String::as_str)
    }

    /// Complementary token of `token_id`, when known.
    pub fn reverse_token(&self, token_id: &str) -> Option<&str> {
        self.by_token(token_id)
            .and_then(|e| e.market.reverse(token_id))
    }

    /// Parameters for an entry's profile; unknown profiles fall back to
    /// `default`, then to built-in defaults.
    pub fn params_for(&self, entry: &MarketEntry) -> StrategyParameters {
        self.profiles
            .get(entry.market.profile.as_str())
            .or_else(|| self.profiles.get("default"))
            .cloned()
            .unwrap_or_default()
    }

    /// Token ids of all enabled markets: the websocket subscription set.
    pub fn subscribed_tokens(&self) -> Vec<String> {
        let mut tokens = Vec::with_capacity(self.entries.len() * 2);
        for entry in self.entries.values() {
            if entry.trade.enabled {
                tokens.push(entry.market.token_a.clone());
                tokens.push(entry.market.token_b.clone());
            }
        }
        tokens.sort();
        tokens
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarketEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Raw market row as served by the collaborator (string decimals).
#[derive(Debug, Clone, Deserialize)]
struct MarketRow {
    condition_id: String,
    token1: String,
    token2: String,
    #[serde(default)]
    neg_risk: bool,
    tick_size: String,
    min_size: String,
    max_spread: String,
    #[serde(default)]
    strategy_profile: Option<String>,
    #[serde(default)]
    volatility: Option<String>,
}

/// Raw config table: trade configs keyed by condition id plus profiles.
#[derive(Debug, Clone, Deserialize)]
struct ConfigTable {
    #[serde(default)]
    profiles: HashMap<String, StrategyParameters>,
    #[serde(default)]
    markets: HashMap<String, TradeConfig>,
}

fn build_snapshot(rows: Vec<MarketRow>, configs: ConfigTable) -> RegistrySnapshot {
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let parsed = (
            row.tick_size.parse::<Decimal>(),
            row.min_size.parse::<Decimal>(),
            row.max_spread.parse::<Decimal>(),
        );
        let (tick_size, min_size, max_spread) = match parsed {
            (Ok(t), Ok(m), Ok(s)) => (t, m, s),
            _ => {
                warn!(condition_id = %row.condition_id, "unparseable market row, skipping");
                continue;
            }
        };
        let trade = match configs.markets.get(&row.condition_id) {
            Some(t) => t.clone(),
            None => {
                // No trade config means the market exists but must not quote.
                warn!(condition_id = %row.condition_id, "no trade config, market disabled");
                TradeConfig {
                    trade_size: Decimal::ZERO,
                    max_size: Decimal::ZERO,
                    enabled: false,
                    low_price_multiplier: Decimal::ONE,
                }
            }
        };
        let volatility = row
            .volatility
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Decimal::ZERO);
        let profile = match row.strategy_profile.as_deref() {
            None => StrategyProfile::Default,
            Some(raw) => StrategyProfile::parse(raw).unwrap_or_else(|| {
                warn!(condition_id = %row.condition_id, profile = raw, "unknown strategy profile, using default");
                StrategyProfile::Default
            }),
        };
        entries.push(MarketEntry {
            market: Market {
                condition_id: row.condition_id,
                token_a: row.token1,
                token_b: row.token2,
                neg_risk: row.neg_risk,
                tick_size,
                min_size,
                max_spread,
                profile,
            },
            trade,
            volatility,
        });
    }
    RegistrySnapshot::new(entries, configs.profiles)
}

/// Source of registry snapshots.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn fetch(&self) -> Result<RegistrySnapshot, RegistryError>;
}

/// HTTP registry source: `GET {base}/markets` and `GET {base}/configs`.
pub struct HttpRegistry {
    client: Client,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RegistrySource for HttpRegistry {
    async fn fetch(&self) -> Result<RegistrySnapshot, RegistryError> {
        let rows: Vec<MarketRow> = self
            .client
            .get(format!("{}/markets", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let configs: ConfigTable = self
            .client
            .get(format!("{}/configs", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(build_snapshot(rows, configs))
    }
}

/// File-backed registry source for local runs and tests.
///
/// The file holds `{ "markets": [...], "configs": {...} }`.
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    markets: Vec<MarketRow>,
    configs: ConfigTable,
}

#[async_trait]
impl RegistrySource for FileRegistry {
    async fn fetch(&self) -> Result<RegistrySnapshot, RegistryError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let file: RegistryFile = serde_json::from_str(&raw)?;
        Ok(build_snapshot(file.markets, file.configs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const REGISTRY_JSON: &str = r#"{
        "markets": [
            {
                "condition_id": "cond1",
                "token1": "tokenA",
                "token2": "tokenB",
                "neg_risk": true,
                "tick_size": "0.01",
                "min_size": "5",
                "max_spread": "0.06",
                "strategy_profile": "aggressive",
                "volatility": "12.5"
            },
            {
                "condition_id": "cond2",
                "token1": "tokenC",
                "token2": "tokenD",
                "tick_size": "0.001",
                "min_size": "5",
                "max_spread": "0.03"
            },
            {
                "condition_id": "bad",
                "token1": "x",
                "token2": "y",
                "tick_size": "not-a-number",
                "min_size": "5",
                "max_spread": "0.03"
            }
        ],
        "configs": {
            "profiles": {
                "default": {
                    "stop_loss_threshold": "-5",
                    "take_profit_threshold": "10",
                    "volatility_threshold": "20",
                    "spread_threshold": "0.02",
                    "sleep_period_hours": 4
                },
                "aggressive": {
                    "stop_loss_threshold": "-10",
                    "take_profit_threshold": "15",
                    "volatility_threshold": "35",
                    "spread_threshold": "0.04",
                    "sleep_period_hours": 2
                }
            },
            "markets": {
                "cond1": {
                    "trade_size": "20",
                    "max_size": "60",
                    "enabled": true,
                    "low_price_multiplier": "2"
                }
            }
        }
    }"#;

    fn parse_snapshot() -> RegistrySnapshot {
        let file: RegistryFile = serde_json::from_str(REGISTRY_JSON).unwrap();
        build_snapshot(file.markets, file.configs)
    }

    #[test]
    fn test_snapshot_parsing() {
        let snap = parse_snapshot();
        // "bad" row is skipped, cond2 kept but disabled
        assert_eq!(snap.len(), 2);

        let entry = snap.get("cond1").unwrap();
        assert_eq!(entry.market.tick_size, dec!(0.01));
        assert_eq!(entry.market.min_size, dec!(5));
        assert!(entry.market.neg_risk);
        assert_eq!(entry.trade.trade_size, dec!(20));
        assert_eq!(entry.trade.low_price_multiplier, dec!(2));
        assert_eq!(entry.volatility, dec!(12.5));
    }

    #[test]
    fn test_missing_trade_config_disables() {
        let snap = parse_snapshot();
        let entry = snap.get("cond2").unwrap();
        assert!(!entry.trade.enabled);
        assert_eq!(entry.trade.trade_size, Decimal::ZERO);
    }

    #[test]
    fn test_token_lookup_and_reverse() {
        let snap = parse_snapshot();
        assert_eq!(snap.condition_for_token("tokenA"), Some("cond1"));
        assert_eq!(snap.reverse_token("tokenA"), Some("tokenB"));
        assert_eq!(snap.reverse_token("tokenB"), Some("tokenA"));
        assert_eq!(snap.reverse_token("unknown"), None);
    }

    #[test]
    fn test_profile_selection() {
        let snap = parse_snapshot();
        let aggressive = snap.get("cond1").unwrap();
        let params = snap.params_for(aggressive);
        assert_eq!(params.stop_loss_threshold, dec!(-10));
        assert_eq!(params.sleep_period_hours, 2);

        // cond2 has no profile field -> default profile
        let default = snap.get("cond2").unwrap();
        let params = snap.params_for(default);
        assert_eq!(params.take_profit_threshold, dec!(10));
    }

    #[test]
    fn test_subscribed_tokens_only_enabled() {
        let snap = parse_snapshot();
        let tokens = snap.subscribed_tokens();
        assert_eq!(tokens, vec!["tokenA".to_string(), "tokenB".to_string()]);
    }

    #[test]
    fn test_unknown_profile_falls_back_to_default() {
        let json = r#"{
            "markets": [{
                "condition_id": "c1",
                "token1": "a",
                "token2": "b",
                "tick_size": "0.01",
                "min_size": "5",
                "max_spread": "0.05",
                "strategy_profile": "yolo"
            }],
            "configs": {"profiles": {}, "markets": {}}
        }"#;
        let file: RegistryFile = serde_json::from_str(json).unwrap();
        let snap = build_snapshot(file.markets, file.configs);
        assert_eq!(snap.get("c1").unwrap().market.profile, StrategyProfile::Default);
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!(StrategyProfile::parse("Aggressive"), Some(StrategyProfile::Aggressive));
        assert_eq!(StrategyProfile::parse(""), Some(StrategyProfile::Default));
        assert_eq!(StrategyProfile::parse("bogus"), None);
    }

    #[test]
    fn test_params_fallback_without_profiles() {
        let snap = RegistrySnapshot::new(Vec::new(), HashMap::new());
        assert!(snap.is_empty());
        let entry = MarketEntry {
            market: Market {
                condition_id: "c".to_string(),
                token_a: "a".to_string(),
                token_b: "b".to_string(),
                neg_risk: false,
                tick_size: dec!(0.01),
                min_size: dec!(5),
                max_spread: dec!(0.05),
                profile: StrategyProfile::Conservative,
            },
            trade: TradeConfig {
                trade_size: dec!(20),
                max_size: dec!(60),
                enabled: true,
                low_price_multiplier: Decimal::ONE,
            },
            volatility: Decimal::ZERO,
        };
        let params = snap.params_for(&entry);
        assert_eq!(params.volatility_threshold, dec!(20));
    }
}
