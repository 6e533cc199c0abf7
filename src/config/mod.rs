//! Configuration Module
//!
//! TOML-based configuration for the exchange core:
//! - Logging
//! - Inflight retry policy
//! - Per-connection session limits
//! - Exchange sweep and persistent-session limits
//! - Environment variable overrides (MQTT_EXCHANGE__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[cfg(test)]
mod tests;

/// Prefix for environment overrides, e.g. `MQTT_EXCHANGE__INFLIGHT__MAX_RETRIES=5`
pub const ENV_PREFIX: &str = "MQTT_EXCHANGE";

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
    /// Tracing subscriber could not be installed
    Logging(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ConfigError::Logging(msg) => write!(f, "Logging error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Inflight retry policy
    pub inflight: InflightConfig,
    /// Per-connection limits
    pub session: SessionConfig,
    /// Exchange configuration
    pub exchange: ExchangeConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    /// Install a global `tracing` subscriber.
    ///
    /// `RUST_LOG` wins over the configured level when it is set.
    pub fn init(&self) -> Result<(), ConfigError> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.level.to_lowercase())
                .map_err(|e| ConfigError::Logging(e.to_string()))?,
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|e| ConfigError::Logging(e.to_string()))
    }
}

/// Inflight (QoS 1/2 outbound) retry policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InflightConfig {
    /// Age after which an unacknowledged message is re-sent (e.g. "10s")
    #[serde(default = "default_retry_timeout", with = "humantime_serde")]
    pub retry_timeout: Duration,
    /// Re-sends before a message is abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How often the retry timer scans the table
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

fn default_retry_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_retries() -> u32 {
    3
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for InflightConfig {
    fn default() -> Self {
        Self {
            retry_timeout: default_retry_timeout(),
            max_retries: default_max_retries(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Per-connection limits advertised to clients
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// QoS 1/2 publishes a client may have unacknowledged with us
    #[serde(default = "default_receive_maximum")]
    pub receive_maximum: u16,
    /// Topic aliases a client may register with us (0 = none)
    #[serde(default = "default_topic_alias_maximum")]
    pub topic_alias_maximum: u16,
    /// Largest packet we accept (0 = unbounded)
    pub max_packet_size: u32,
}

fn default_receive_maximum() -> u16 {
    65535
}
fn default_topic_alias_maximum() -> u16 {
    16
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_maximum: default_receive_maximum(),
            topic_alias_maximum: default_topic_alias_maximum(),
            max_packet_size: 0,
        }
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Liveness sweep interval
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Registered sessions idle longer than this are removed ("0s" disables)
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Expiry for persistent sessions that did not ask for one ("0s" = never)
    #[serde(default = "default_session_expiry", with = "humantime_serde")]
    pub session_expiry: Duration,
    /// Offline messages kept per persistent session; the oldest is dropped when full
    #[serde(default = "default_offline_queue_capacity")]
    pub offline_queue_capacity: usize,
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_session_expiry() -> Duration {
    Duration::from_secs(3600)
}
fn default_offline_queue_capacity() -> usize {
    1000
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            idle_timeout: default_idle_timeout(),
            session_expiry: default_session_expiry(),
            offline_queue_capacity: default_offline_queue_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQTT_EXCHANGE__` prefix with double underscores for nesting:
    ///    - `MQTT_EXCHANGE__INFLIGHT__MAX_RETRIES=5` overrides `inflight.max_retries`
    ///    - `MQTT_EXCHANGE__EXCHANGE__SWEEP_INTERVAL=10s` overrides `exchange.sweep_interval`
    ///
    /// A missing file means defaults plus environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("inflight.retry_timeout", "10s")?
            .set_default("inflight.max_retries", 3)?
            .set_default("inflight.poll_interval", "1s")?
            .set_default("session.receive_maximum", 65535)?
            .set_default("session.topic_alias_maximum", 16)?
            .set_default("session.max_packet_size", 0)?
            .set_default("exchange.sweep_interval", "30s")?
            .set_default("exchange.idle_timeout", "5m")?
            .set_default("exchange.session_expiry", "1h")?
            .set_default("exchange.offline_queue_capacity", 1000)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log.level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown log level '{}'",
                self.log.level
            )));
        }

        if self.session.receive_maximum == 0 {
            return Err(ConfigError::Validation(
                "session.receive_maximum must be greater than 0".to_string(),
            ));
        }

        if self.inflight.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "inflight.poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.exchange.sweep_interval.is_zero() {
            return Err(ConfigError::Validation(
                "exchange.sweep_interval must be greater than 0".to_string(),
            ));
        }

        if self.exchange.offline_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "exchange.offline_queue_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
