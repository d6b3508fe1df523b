//! Configuration for quoter-bot.
//!
//! Runtime behavior lives in a TOML file; environment variables carry only
//! credentials and endpoints. CLI flags override both.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Run mode: real orders through the gateway, or an in-memory stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Live,
    Paper,
}

impl RunMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "live" => Some(RunMode::Live),
            "paper" => Some(RunMode::Paper),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Live => write!(f, "live"),
            RunMode::Paper => write!(f, "paper"),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub mode: RunMode,
    pub log_level: String,
    pub streams: StreamConfig,
    pub registry: RegistryConfig,
    pub gateway: GatewayConfig,
    #[serde(skip)]
    pub credentials: Credentials,
    pub trading: TradingConfig,
    pub cadence: CadenceConfig,
    pub paths: PathsConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Paper,
            log_level: "info".to_string(),
            streams: StreamConfig::default(),
            registry: RegistryConfig::default(),
            gateway: GatewayConfig::default(),
            credentials: Credentials::default(),
            trading: TradingConfig::default(),
            cadence: CadenceConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

/// Websocket endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub market_ws_url: String,
    pub user_ws_url: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            market_ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            user_ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/user".to_string(),
        }
    }
}

/// Where the market universe comes from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// "http" or "file".
    pub source: String,
    pub url: String,
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            source: "file".to_string(),
            url: String::new(),
            path: PathBuf::from("config/registry.json"),
        }
    }
}

/// Signing-gateway endpoint for exchange calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub url: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8787".to_string(),
        }
    }
}

/// Credentials, from the environment only.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    /// Funder wallet address, used to recognize our own maker fills.
    pub funder_address: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty()
            && !self.api_secret.is_empty()
            && !self.api_passphrase.is_empty()
            && !self.funder_address.is_empty()
    }
}

/// Trading constants. Reference values from the deployed parameters; every
/// fixed threshold the engine applies is named here rather than inlined.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Absolute per-token inventory cap, in shares.
    pub hard_cap_shares: Decimal,
    /// Minimum seconds between actions triggered by book changes alone.
    pub action_cooldown_secs: u64,
    /// Timeout applied to every exchange call.
    pub call_timeout_secs: u64,
    /// How long an observed trade stays pending before it is swept.
    pub pending_expiry_secs: u64,
    /// Merge complementary positions once both sides hold this many shares.
    pub merge_threshold_shares: Decimal,
    /// Replace a resting buy when the desired price moved further than this.
    pub buy_price_tolerance: Decimal,
    /// Replace a resting buy when the desired size moved by more than this fraction.
    pub buy_size_tolerance: Decimal,
    pub sell_price_tolerance: Decimal,
    pub sell_size_tolerance: Decimal,
    /// Below this buy price the per-market low-price multiplier kicks in.
    pub low_price_cutoff: Decimal,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            hard_cap_shares: Decimal::new(250, 0),
            action_cooldown_secs: 30,
            call_timeout_secs: 10,
            pending_expiry_secs: 60,
            merge_threshold_shares: Decimal::new(20, 0),
            buy_price_tolerance: Decimal::new(15, 3),
            buy_size_tolerance: Decimal::new(25, 2),
            sell_price_tolerance: Decimal::new(5, 2),
            sell_size_tolerance: Decimal::new(30, 2),
            low_price_cutoff: Decimal::new(10, 2),
        }
    }
}

/// Periodic control-loop cadences, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub pull_secs: u64,
    pub registry_secs: u64,
    pub snapshot_secs: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            pull_secs: 10,
            registry_secs: 60,
            snapshot_secs: 300,
        }
    }
}

/// Filesystem locations owned by the bot.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory of per-market risk-off records.
    pub risk_off_dir: PathBuf,
    /// Directory for sink output files.
    pub sink_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            risk_off_dir: PathBuf::from("state/risk_off"),
            sink_dir: PathBuf::from("data"),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: BotConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(config)
    }

    /// Apply environment overrides: credentials and endpoints only.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("QUOTER_API_KEY") {
            self.credentials.api_key = v;
        }
        if let Ok(v) = std::env::var("QUOTER_API_SECRET") {
            self.credentials.api_secret = v;
        }
        if let Ok(v) = std::env::var("QUOTER_API_PASSPHRASE") {
            self.credentials.api_passphrase = v;
        }
        if let Ok(v) = std::env::var("QUOTER_FUNDER_ADDRESS") {
            self.credentials.funder_address = v;
        }
        if let Ok(v) = std::env::var("QUOTER_GATEWAY_URL") {
            self.gateway.url = v;
        }
        if let Ok(v) = std::env::var("QUOTER_REGISTRY_URL") {
            self.registry.source = "http".to_string();
            self.registry.url = v;
        }
    }

    /// Apply CLI overrides.
    pub fn apply_cli_overrides(&mut self, mode: Option<String>) {
        if let Some(mode_str) = mode {
            if let Some(mode) = RunMode::from_str(&mode_str) {
                self.mode = mode;
            }
        }
    }

    /// Validate invariants before startup.
    pub fn validate(&self) -> Result<()> {
        if self.mode == RunMode::Live && !self.credentials.is_complete() {
            bail!(
                "live mode requires QUOTER_API_KEY, QUOTER_API_SECRET, \
                 QUOTER_API_PASSPHRASE and QUOTER_FUNDER_ADDRESS"
            );
        }
        if self.registry.source == "http" && self.registry.url.is_empty() {
            bail!("registry.source = \"http\" requires registry.url");
        }
        if self.trading.hard_cap_shares <= Decimal::ZERO {
            bail!("trading.hard_cap_shares must be positive");
        }
        if self.cadence.pull_secs == 0 {
            bail!("cadence.pull_secs must be nonzero");
        }
        Ok(())
    }
}
