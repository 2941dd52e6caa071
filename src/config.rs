use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// REST endpoint used to create and renew streaming sessions
    pub rest_url: String,
    /// WebSocket endpoint for market data
    pub ws_url: String,
    /// API key sent with the create-session call
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Renew the session this many seconds before it expires
    #[serde(default = "default_renew_before_expiry_secs")]
    pub renew_before_expiry_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Force a reconnect when no data arrives for this long
    #[serde(default = "default_stale_stream_timeout_secs")]
    pub stale_stream_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_renew_before_expiry_secs() -> u64 {
    60
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_stale_stream_timeout_secs() -> u64 {
    90
}

fn default_ping_interval_secs() -> u64 {
    30
}

/// Circuit breaker tuning shared by the upstream and broker breakers
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Initial cooldown once opened (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Cooldown growth factor after a failed half-open trial
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for the extended cooldown (seconds)
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_cooldown_secs() -> u64 {
    600
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackendKind,
    /// Quotes older than this are reported as stale
    #[serde(default = "default_quote_ttl_ms")]
    pub quote_ttl_ms: u64,
    /// Per-call budget for the external backend before it is considered unreachable
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Symbols seeded from the backend at startup
    #[serde(default)]
    pub warm_symbols: Vec<String>,
}

fn default_cache_backend() -> CacheBackendKind {
    CacheBackendKind::Memory
}

fn default_quote_ttl_ms() -> u64 {
    5_000
}

fn default_backend_timeout_ms() -> u64 {
    250
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_max_connections() -> u32 {
    5
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            quote_ttl_ms: default_quote_ttl_ms(),
            backend_timeout_ms: default_backend_timeout_ms(),
            probe_interval_secs: default_probe_interval_secs(),
            database_url: None,
            max_connections: default_max_connections(),
            warm_symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Per (symbol, consumer) queue capacity; overflow drops the oldest event
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Evict a consumer after this many drops without a single read
    #[serde(default = "default_max_consecutive_drops")]
    pub max_consecutive_drops: u64,
    /// Delay before an upstream unsubscribe is sent for a symbol nobody watches
    #[serde(default = "default_unsubscribe_grace_ms")]
    pub unsubscribe_grace_ms: u64,
}

fn default_channel_capacity() -> usize {
    256
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_max_consecutive_drops() -> u64 {
    1_024
}

fn default_unsubscribe_grace_ms() -> u64 {
    2_000
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_consecutive_drops: default_max_consecutive_drops(),
            unsubscribe_grace_ms: default_unsubscribe_grace_ms(),
        }
    }
}

/// What the idempotency store does when its persistent backend is unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyFailureMode {
    /// Reject new orders
    FailClosed,
    /// Accept new orders and accept the duplicate risk, loudly
    FailOpen,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum retry attempts after the first broker call
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_broker_timeout_ms")]
    pub broker_timeout_ms: u64,
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    /// Required; there is no implicit fallback policy
    pub idempotency_failure_mode: IdempotencyFailureMode,
    /// How long a duplicate request waits for the in-flight original
    #[serde(default = "default_duplicate_wait_ms")]
    pub duplicate_wait_ms: u64,
    #[serde(default)]
    pub breaker: BreakerSettings,
}

fn default_max_retries() -> u8 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    2_000
}

fn default_broker_timeout_ms() -> u64 {
    5_000
}

fn default_idempotency_ttl_secs() -> u64 {
    86_400
}

fn default_duplicate_wait_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Paper,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Paper,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_trading_mode")]
    pub mode: TradingMode,
    #[serde(default = "default_broker_kind")]
    pub broker: BrokerKind,
    #[serde(default)]
    pub broker_url: Option<String>,
    #[serde(default)]
    pub broker_key_id: Option<String>,
    #[serde(default)]
    pub broker_secret: Option<String>,
}

fn default_trading_mode() -> TradingMode {
    TradingMode::Paper
}

fn default_broker_kind() -> BrokerKind {
    BrokerKind::Paper
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            mode: default_trading_mode(),
            broker: default_broker_kind(),
            broker_url: None,
            broker_key_id: None,
            broker_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// When set, admin routes require `Authorization: Bearer <token>`
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("QUOTEFLOW_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (QUOTEFLOW__UPSTREAM__WS_URL, etc.)
            .add_source(
                Environment::with_prefix("QUOTEFLOW")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration for local runs against a paper broker
    pub fn paper_defaults(rest_url: &str, ws_url: &str) -> Self {
        Self {
            upstream: UpstreamConfig {
                rest_url: rest_url.to_string(),
                ws_url: ws_url.to_string(),
                api_key: None,
                connect_timeout_ms: default_connect_timeout_ms(),
                renew_before_expiry_secs: default_renew_before_expiry_secs(),
                backoff_base_ms: default_backoff_base_ms(),
                backoff_max_ms: default_backoff_max_ms(),
                breaker: BreakerSettings::default(),
                stale_stream_timeout_secs: default_stale_stream_timeout_secs(),
                ping_interval_secs: default_ping_interval_secs(),
            },
            cache: CacheConfig::default(),
            fanout: FanoutConfig::default(),
            execution: ExecutionConfig {
                max_retries: default_max_retries(),
                retry_base_delay_ms: default_retry_base_delay_ms(),
                retry_max_delay_ms: default_retry_max_delay_ms(),
                broker_timeout_ms: default_broker_timeout_ms(),
                idempotency_ttl_secs: default_idempotency_ttl_secs(),
                idempotency_failure_mode: IdempotencyFailureMode::FailClosed,
                duplicate_wait_ms: default_duplicate_wait_ms(),
                breaker: BreakerSettings::default(),
            },
            trading: TradingConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.trading.mode == TradingMode::Live {
            errors.push(
                "trading.mode = \"live\" is not supported; only paper trading is wired".to_string(),
            );
        }

        if self.trading.broker == BrokerKind::Http && self.trading.broker_url.is_none() {
            errors.push("trading.broker_url is required for the http broker".to_string());
        }

        if self.cache.backend == CacheBackendKind::Postgres && self.cache.database_url.is_none() {
            errors.push("cache.database_url is required for the postgres backend".to_string());
        }

        for (name, breaker) in [
            ("upstream.breaker", &self.upstream.breaker),
            ("execution.breaker", &self.execution.breaker),
        ] {
            if breaker.failure_threshold == 0 {
                errors.push(format!("{name}.failure_threshold must be at least 1"));
            }
            if breaker.backoff_multiplier < 1.0 {
                errors.push(format!("{name}.backoff_multiplier must be >= 1.0"));
            }
            if breaker.max_cooldown_secs < breaker.cooldown_secs {
                errors.push(format!("{name}.max_cooldown_secs must be >= cooldown_secs"));
            }
        }

        if self.upstream.backoff_base_ms == 0 {
            errors.push("upstream.backoff_base_ms must be positive".to_string());
        }

        if self.upstream.ping_interval_secs == 0 {
            errors.push("upstream.ping_interval_secs must be positive".to_string());
        }

        if self.upstream.stale_stream_timeout_secs == 0 {
            errors.push("upstream.stale_stream_timeout_secs must be positive".to_string());
        }

        if self.fanout.channel_capacity == 0 {
            errors.push("fanout.channel_capacity must be positive".to_string());
        }

        if self.fanout.heartbeat_interval_secs == 0 {
            errors.push("fanout.heartbeat_interval_secs must be positive".to_string());
        }

        if self.execution.idempotency_ttl_secs == 0 {
            errors.push("execution.idempotency_ttl_secs must be positive".to_string());
        }

        if self.cache.quote_ttl_ms == 0 {
            errors.push("cache.quote_ttl_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
