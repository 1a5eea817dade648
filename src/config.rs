// =============================================================================
// Application Configuration — JSON file + environment overrides
// =============================================================================
//
// Every tunable lives here.  The file is optional: a missing file yields the
// defaults with a warning.  Environment variables (optionally sourced from a
// `.env` file) override whatever the file says, which keeps credentials out of
// the JSON.  All fields carry `#[serde(default)]` so that partial files load.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// OKX epoch floor for candle cursors: 2020-01-01T00:00:00Z in milliseconds.
pub const DEFAULT_EPOCH_FLOOR_MS: i64 = 1_577_836_800_000;

/// Largest page the OKX candle endpoints accept.
pub const MAX_PAGE_LIMIT: usize = 100;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_api_uri() -> String {
    "https://www.okx.com".to_string()
}

fn default_candles_path() -> String {
    "/api/v5/market/history-candles".to_string()
}

fn default_currencies_path() -> String {
    "/api/v5/asset/currencies".to_string()
}

fn default_wss_endpoint() -> String {
    "wss://ws.okx.com:8443/ws/v5/public".to_string()
}

fn default_base_currency() -> String {
    "USDT".to_string()
}

fn default_currencies() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}

fn default_candles_bar() -> String {
    "1D".to_string()
}

fn default_page_limit() -> usize {
    MAX_PAGE_LIMIT
}

fn default_epoch_floor_ms() -> i64 {
    DEFAULT_EPOCH_FLOOR_MS
}

fn default_max_connections() -> u32 {
    5
}

fn default_trades_topic() -> String {
    "trades".to_string()
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_backoff_initial_secs() -> u64 {
    1
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_instrument_sync_secs() -> u64 {
    12 * 60 * 60
}

fn default_candle_refresh_secs() -> u64 {
    60 * 60
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0:3002".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Exchange endpoints and the instrument universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_api_uri")]
    pub api_uri: String,

    #[serde(default = "default_candles_path")]
    pub candles_path: String,

    #[serde(default = "default_currencies_path")]
    pub currencies_path: String,

    #[serde(default = "default_wss_endpoint")]
    pub wss_endpoint: String,

    /// Quote side of every pair (e.g. `USDT`).
    #[serde(default = "default_base_currency")]
    pub base_currency: String,

    /// Counter currencies; each yields the pair `COUNTER-BASE`.
    #[serde(default = "default_currencies")]
    pub currencies: Vec<String>,

    /// Candle interval label as OKX spells it (`1m`, `1H`, `1D`, ...).
    #[serde(default = "default_candles_bar")]
    pub candles_bar: String,

    /// Rows requested per candle page.
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,

    /// Cursor used when nothing is stored yet for a pair.
    #[serde(default = "default_epoch_floor_ms")]
    pub epoch_floor_ms: i64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_uri: default_api_uri(),
            candles_path: default_candles_path(),
            currencies_path: default_currencies_path(),
            wss_endpoint: default_wss_endpoint(),
            base_currency: default_base_currency(),
            currencies: default_currencies(),
            candles_bar: default_candles_bar(),
            page_limit: default_page_limit(),
            epoch_floor_ms: default_epoch_floor_ms(),
        }
    }
}

/// API credentials used to sign private REST requests.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub passphrase: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.secret.is_empty() && !self.passphrase.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. When absent the in-memory store is used.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Redis URL used for `PUBLISH`. When absent trades go to the in-process
    /// bus only.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_trades_topic")]
    pub trades_topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            trades_topic: default_trades_topic(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

impl StreamConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_instrument_sync_secs")]
    pub instrument_sync_secs: u64,

    #[serde(default = "default_candle_refresh_secs")]
    pub candle_refresh_secs: u64,

    /// Run the historical backfill once at startup.
    #[serde(default = "default_true")]
    pub backfill_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            instrument_sync_secs: default_instrument_sync_secs(),
            candle_refresh_secs: default_candle_refresh_secs(),
            backfill_on_start: true,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Bearer token for the status and job-trigger endpoints. Unset means
    /// every authenticated request is rejected.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            admin_token: None,
        }
    }
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_addr", &self.bind_addr)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// AppConfig
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub credentials: Credentials,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise start from defaults; then
    /// apply process environment overrides and validate.
    pub fn from_env_and_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, "config file unavailable, using defaults");
            Self::default()
        });
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment-style lookups. Empty values are
    /// ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().trim_matches(|c: char| c == '\'' || c == '"').to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("API_KEY") {
            self.credentials.api_key = v;
        }
        if let Some(v) = get("SECRET") {
            self.credentials.secret = v;
        }
        if let Some(v) = get("PASSPHRASE") {
            self.credentials.passphrase = v;
        }
        if let Some(v) = get("API_URI") {
            self.exchange.api_uri = v;
        }
        if let Some(v) = get("CANDLES_PATH") {
            self.exchange.candles_path = v;
        }
        if let Some(v) = get("CURRENCIES_PATH") {
            self.exchange.currencies_path = v;
        }
        if let Some(v) = get("WSS_ENDPOINT") {
            self.exchange.wss_endpoint = v;
        }
        if let Some(v) = get("BASE_CURRENCY") {
            self.exchange.base_currency = v;
        }
        if let Some(v) = get("CURRENCIES") {
            self.exchange.currencies = parse_currency_list(&v);
        }
        if let Some(v) = get("CANDLES_BAR") {
            self.exchange.candles_bar = v;
        }
        if let Some(v) = get("DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Some(v) = get("REDIS_URL") {
            self.bus.redis_url = Some(v);
        }
        if let Some(v) = get("TRADES_TOPIC") {
            self.bus.trades_topic = v;
        }
        if let Some(v) = get("MARKET_SYNC_BIND_ADDR") {
            self.api.bind_addr = v;
        }
        if let Some(v) = get("MARKET_SYNC_ADMIN_TOKEN") {
            self.api.admin_token = Some(v);
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.exchange.base_currency.is_empty() {
            bail!("exchange.base_currency must not be empty");
        }
        if self.exchange.currencies.is_empty() {
            bail!("exchange.currencies must list at least one counter currency");
        }
        if self.exchange.page_limit == 0 || self.exchange.page_limit > MAX_PAGE_LIMIT {
            bail!(
                "exchange.page_limit must be within 1..={MAX_PAGE_LIMIT}, got {}",
                self.exchange.page_limit
            );
        }
        if self.stream.backoff_initial_secs == 0
            || self.stream.backoff_initial_secs > self.stream.backoff_max_secs
        {
            bail!("stream backoff must satisfy 0 < initial <= max");
        }
        if self.stream.ping_interval_secs == 0 {
            bail!("stream.ping_interval_secs must be positive");
        }
        if self.schedule.instrument_sync_secs == 0 {
            bail!("schedule.instrument_sync_secs must be positive");
        }
        if self.schedule.candle_refresh_secs == 0 {
            bail!("schedule.candle_refresh_secs must be positive");
        }
        if !self.credentials.is_complete() {
            warn!("exchange credentials incomplete; instrument sync will be rejected by the exchange");
        }
        Ok(())
    }

    /// Trading pairs in `COUNTER-BASE` form.
    pub fn pairs(&self) -> Vec<String> {
        self.exchange
            .currencies
            .iter()
            .map(|c| format!("{}-{}", c, self.exchange.base_currency))
            .collect()
    }
}

/// Parse `BTC,ETH`, `[BTC, ETH]` or `'BTC,ETH'` into a list.
fn parse_currency_list(raw: &str) -> Vec<String> {
    raw.trim_matches(|c: char| c == '[' || c == ']' || c == '\'' || c == '"' || c.is_whitespace())
        .split(',')
        .map(|s| s.trim().trim_matches(|c: char| c == '\'' || c == '"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
