use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use thiserror::Error;
use tracing::info;
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_BROKER_URL: &str = "memory://";
const DEFAULT_OUTBOX_BATCH_SIZE: u64 = 100;
const DEFAULT_OUTBOX_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_OUTBOUND_PREFETCH: usize = 10;
const DEFAULT_SYNC_PREFETCH: usize = 5;

/// WMS client configuration: `mock` for the in-memory double, `http` for the
/// real warehouse API (which then requires a URL).
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct WmsConfig {
    #[serde(default = "default_wms_mode")]
    pub mode: String,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Upper bound on any single WMS call; broker consumers rely on this to
    /// stay responsive when the warehouse is slow.
    #[serde(default = "default_wms_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for WmsConfig {
    fn default() -> Self {
        Self {
            mode: default_wms_mode(),
            url: None,
            api_key: None,
            request_timeout_secs: default_wms_timeout_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Broker connection URL (`redis://...`, or `memory://` for in-process)
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom(function = validate_log_level))]
    pub log_level: String,

    /// Whether to run database migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Outbox dispatcher: rows claimed per tick
    #[serde(default = "default_outbox_batch_size")]
    pub outbox_batch_size: u64,

    /// Outbox dispatcher: pause between ticks (milliseconds)
    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,

    /// WMS outbound worker: messages pulled per poll
    #[serde(default = "default_outbound_prefetch")]
    pub outbound_prefetch: usize,

    /// Reconciliation worker: messages pulled per poll
    #[serde(default = "default_sync_prefetch")]
    pub sync_prefetch: usize,

    /// WMS client configuration
    #[serde(default)]
    #[validate(nested)]
    pub wms: WmsConfig,
}

impl AppConfig {
    /// Creates a configuration programmatically; everything not passed in
    /// takes its default. Primarily for tests.
    pub fn new(database_url: String, broker_url: String) -> Self {
        Self {
            database_url,
            broker_url,
            host: default_host(),
            port: default_port(),
            environment: "test".to_string(),
            log_level: default_log_level(),
            auto_migrate: true,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            outbox_batch_size: default_outbox_batch_size(),
            outbox_poll_interval_ms: default_outbox_poll_interval_ms(),
            outbound_prefetch: default_outbound_prefetch(),
            sync_prefetch: default_sync_prefetch(),
            wms: WmsConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_string()
}

fn default_wms_mode() -> String {
    "mock".to_string()
}

fn default_wms_timeout_secs() -> u64 {
    10
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_outbox_batch_size() -> u64 {
    DEFAULT_OUTBOX_BATCH_SIZE
}
fn default_outbox_poll_interval_ms() -> u64 {
    DEFAULT_OUTBOX_POLL_INTERVAL_MS
}
fn default_outbound_prefetch() -> usize {
    DEFAULT_OUTBOUND_PREFETCH
}
fn default_sync_prefetch() -> usize {
    DEFAULT_SYNC_PREFETCH
}
fn default_true_bool() -> bool {
    true
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("inventory_api={},tower_http=info", level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = fmt().with_env_filter(filter).try_init();
}

/// Loads application configuration.
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP_*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    let config = Config::builder()
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;

    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programmatic_config_takes_defaults() {
        let cfg = AppConfig::new("sqlite::memory:".into(), "memory://".into());
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.outbox_batch_size, 100);
        assert_eq!(cfg.outbox_poll_interval_ms, 200);
        assert_eq!(cfg.outbound_prefetch, 10);
        assert_eq!(cfg.sync_prefetch, 5);
        assert_eq!(cfg.wms.mode, "mock");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_log_level_fails_validation() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "memory://".into());
        cfg.log_level = "loud".into();
        assert!(cfg.validate().is_err());
    }
}
