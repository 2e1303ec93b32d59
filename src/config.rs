use std::path::Path;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_trade_queue_capacity() -> usize {
    1000
}

fn default_retry_period_secs() -> u64 {
    10
}

fn default_flush_to_db_period() -> u64 {
    30
}

fn default_buffer_interval() -> u64 {
    60
}

fn default_buffer_clean_period() -> u64 {
    45
}

fn default_storage_max_interval() -> u64 {
    7
}

fn default_storage_clean_period() -> u64 {
    600
}

fn default_quote_consumer_port() -> u16 {
    9001
}

fn default_currency_conversion_port() -> u16 {
    9000
}

fn default_quote_consumer_service() -> String {
    "http://localhost:9001".into()
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub candles: CandleFlowConfig,
    #[serde(default)]
    pub quote_consumer: QuoteConsumerConfig,
    #[serde(default)]
    pub currency_conversion: CurrencyConversionConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct DatabaseConfig {
    /// PostgreSQL DSN. Usually supplied via the `DB_SERVICE` environment
    /// variable rather than the config file.
    pub dsn: Option<String>,
}

impl DatabaseConfig {
    pub fn require_dsn(&self) -> Result<&str, Report<ConfigError>> {
        self.dsn
            .as_deref()
            .filter(|dsn| !dsn.is_empty())
            .ok_or_else(|| {
                Report::new(ConfigError::Validation {
                    field: "database.dsn (or DB_SERVICE env) is required".into(),
                })
            })
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectorConfig {
    /// Capacity of the shared trade channel. The single backpressure knob:
    /// producers block when the aggregator falls behind.
    #[serde(default = "default_trade_queue_capacity")]
    pub trade_queue_capacity: usize,
    /// Delay before re-opening a failed WebSocket connection.
    #[serde(default = "default_retry_period_secs")]
    pub retry_period_secs: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            trade_queue_capacity: default_trade_queue_capacity(),
            retry_period_secs: default_retry_period_secs(),
        }
    }
}

impl ConnectorConfig {
    pub fn retry_period(&self) -> Duration {
        Duration::from_secs(self.retry_period_secs)
    }
}

/// Tuning for the trades-to-candles flow. Field names double as the keys of
/// the `TRADES_TO_CANDLES_CONFIG` environment override (a JSON object).
#[derive(Debug, Deserialize)]
pub struct CandleFlowConfig {
    /// Seconds between flushes of dirty candles to the database.
    #[serde(default = "default_flush_to_db_period")]
    pub flush_to_db_period: u64,
    /// Seconds of recent candles kept in the in-memory buffer.
    #[serde(default = "default_buffer_interval")]
    pub buffer_interval: u64,
    /// Seconds between in-memory buffer eviction passes.
    #[serde(default = "default_buffer_clean_period")]
    pub buffer_clean_period: u64,
    /// Days of candles kept in durable storage.
    #[serde(default = "default_storage_max_interval")]
    pub storage_max_interval: u64,
    /// Seconds between durable-storage eviction passes.
    #[serde(default = "default_storage_clean_period")]
    pub storage_clean_period: u64,
}

impl Default for CandleFlowConfig {
    fn default() -> Self {
        Self {
            flush_to_db_period: default_flush_to_db_period(),
            buffer_interval: default_buffer_interval(),
            buffer_clean_period: default_buffer_clean_period(),
            storage_max_interval: default_storage_max_interval(),
            storage_clean_period: default_storage_clean_period(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QuoteConsumerConfig {
    #[serde(default = "default_quote_consumer_port")]
    pub port: u16,
}

impl Default for QuoteConsumerConfig {
    fn default() -> Self {
        Self {
            port: default_quote_consumer_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CurrencyConversionConfig {
    #[serde(default = "default_currency_conversion_port")]
    pub port: u16,
    /// CORS allow-list for the conversion API.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Base URL of the quote-consumer's in-memory candle endpoint.
    #[serde(default = "default_quote_consumer_service")]
    pub quote_consumer_service: String,
}

impl Default for CurrencyConversionConfig {
    fn default() -> Self {
        Self {
            port: default_currency_conversion_port(),
            allowed_origins: Vec::new(),
            quote_consumer_service: default_quote_consumer_service(),
        }
    }
}

/// Load the TOML config (a missing file means all defaults) and apply
/// environment overrides.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = if path.exists() {
        std::fs::read_to_string(path)
            .change_context(ConfigError::ReadFile)
            .attach_with(|| format!("path: {}", path.display()))?
    } else {
        String::new()
    };

    let mut config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Environment variables take precedence over the config file. The variable
/// names are the deployment contract shared with the original docker setup.
fn apply_env_overrides(
    config: &mut AppConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), Report<ConfigError>> {
    if let Some(dsn) = env("DB_SERVICE") {
        config.database.dsn = Some(dsn);
    }

    if let Some(origins) = env("ALLOWED_ORIGINS") {
        config.currency_conversion.allowed_origins = origins
            .split(',')
            .map(|origin| origin.trim().to_owned())
            .filter(|origin| !origin.is_empty())
            .collect();
    }

    if let Some(port) = env("QUOTE_CONSUMER_APP_PORT") {
        config.quote_consumer.port = parse_env("QUOTE_CONSUMER_APP_PORT", &port)?;
    }

    if let Some(port) = env("CURRENCY_CONVERSION_APP_PORT") {
        config.currency_conversion.port = parse_env("CURRENCY_CONVERSION_APP_PORT", &port)?;
    }

    if let Some(url) = env("QUOTE_CONSUMER_SERVICE") {
        config.currency_conversion.quote_consumer_service = url;
    }

    if let Some(debug) = env("DEBUG")
        && matches!(debug.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
    {
        config.general.log_level = "debug".into();
    }

    if let Some(raw) = env("TRADES_TO_CANDLES_CONFIG") {
        config.candles = serde_json::from_str(&raw).change_context(ConfigError::Parse {
            reason: "TRADES_TO_CANDLES_CONFIG is not a valid JSON object".into(),
        })?;
    }

    Ok(())
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, Report<ConfigError>> {
    raw.parse().map_err(|_| {
        Report::new(ConfigError::Parse {
            reason: format!("{name}: cannot parse \"{raw}\""),
        })
    })
}

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let positive = [
        ("candles.flush_to_db_period", config.candles.flush_to_db_period),
        ("candles.buffer_interval", config.candles.buffer_interval),
        ("candles.buffer_clean_period", config.candles.buffer_clean_period),
        ("candles.storage_max_interval", config.candles.storage_max_interval),
        ("candles.storage_clean_period", config.candles.storage_clean_period),
        ("connector.retry_period_secs", config.connector.retry_period_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            return Err(Report::new(ConfigError::Validation {
                field: format!("{field} must be > 0"),
            }));
        }
    }

    if config.connector.trade_queue_capacity == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "connector.trade_queue_capacity must be > 0".into(),
        }));
    }

    if config.currency_conversion.quote_consumer_service.is_empty() {
        return Err(Report::new(ConfigError::Validation {
            field: "currency_conversion.quote_consumer_service must not be empty".into(),
        }));
    }

    Ok(())
}
