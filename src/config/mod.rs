//! Configuration Module
//!
//! TOML configuration for HashMQ, layered as:
//! - built-in defaults
//! - the config file, after `${VAR}` / `${VAR:-default}` substitution
//! - `HASHMQ__SECTION__KEY` environment overrides
//!
//! [`Config`] is the file model; [`Config::to_broker_config`] turns it into
//! the runtime [`BrokerConfig`].

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use persistence::{BackendType, PersistenceConfig};

use crate::broker::BrokerConfig;
use crate::protocol::QoS;
use crate::session::{OverflowStrategy, SessionLimits};
use crate::transport::TransportConfig;

mod persistence;


/// Prefix of environment overrides
const ENV_PREFIX: &str = "HASHMQ";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .into_owned())
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
    /// Bad substitution pattern
    Pattern(regex::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Pattern(e) => write!(f, "Pattern error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

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

impl From<regex::Error> for ConfigError {
    fn from(e: regex::Error) -> Self {
        ConfigError::Pattern(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
    /// Socket options for accepted connections
    pub transport: TransportConfig,
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace. The CLI flag wins; unset means warn.
    pub level: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: BrokerConfig::default().bind_addr,
        }
    }
}

/// Connection and queue limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    /// Largest inbound packet in bytes
    pub max_packet_size: usize,
    /// Per-session bound on queued application messages
    pub max_pending_messages: usize,
    /// `drop_new_message` or `drop_oldest_queued_message`
    pub overflow_strategy: String,
    /// Deadline for CONNECT (e.g. "10s")
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Wait before an unacknowledged QoS 1/2 packet is resent; "0s" disables
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    pub max_retries: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        Self {
            max_connections: broker.max_connections,
            max_packet_size: broker.max_packet_size,
            max_pending_messages: broker.session.max_pending_messages,
            overflow_strategy: broker.session.overflow_strategy.to_string(),
            connect_timeout: broker.connect_timeout,
            ack_timeout: broker.ack_timeout,
            max_retries: broker.max_retries,
        }
    }
}

/// Session housekeeping
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often expired sessions and retained messages are purged
    #[serde(with = "humantime_serde")]
    pub expiry_check_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_check_interval: BrokerConfig::default().expiry_check_interval,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    pub max_qos: u8,
    /// Whether retained messages are available
    pub retain_available: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `HASHMQ__` prefix with double underscores for nesting:
    ///    - `HASHMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `HASHMQ__LIMITS__MAX_PENDING_MESSAGES=500` overrides `limits.max_pending_messages`
    ///
    /// A missing file is not an error; defaults and env overrides still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("limits.overflow_strategy", "drop_new_message")?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("persistence.enabled", false)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // double underscore separates sections; single underscores stay in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment overrides only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn max_qos(&self) -> Result<QoS, ConfigError> {
        QoS::from_u8(self.mqtt.max_qos).ok_or_else(|| {
            ConfigError::Validation(format!(
                "max_qos must be 0, 1, or 2 (got {})",
                self.mqtt.max_qos
            ))
        })
    }

    pub fn overflow_strategy(&self) -> Result<OverflowStrategy, ConfigError> {
        self.limits
            .overflow_strategy
            .parse()
            .map_err(ConfigError::Validation)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.max_qos()?;
        self.overflow_strategy()?;

        if self.limits.max_pending_messages == 0 {
            return Err(ConfigError::Validation(
                "max_pending_messages must be at least 1".to_string(),
            ));
        }
        if self.limits.max_retries == 0 && !self.limits.ack_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "max_retries must be at least 1 when ack_timeout is set".to_string(),
            ));
        }
        if self.persistence.enabled
            && self.persistence.backend == BackendType::Fjall
            && self.persistence.path.as_os_str().is_empty()
        {
            return Err(ConfigError::Validation(
                "persistence.path is required when persistence is enabled".to_string(),
            ));
        }

        self.to_broker_config()?
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Build the runtime broker configuration
    pub fn to_broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        Ok(BrokerConfig {
            bind_addr: self.server.bind,
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            connect_timeout: self.limits.connect_timeout,
            ack_timeout: self.limits.ack_timeout,
            max_retries: self.limits.max_retries,
            max_qos: self.max_qos()?,
            retain_available: self.mqtt.retain_available,
            session: SessionLimits {
                max_pending_messages: self.limits.max_pending_messages,
                overflow_strategy: self.overflow_strategy()?,
            },
            expiry_check_interval: self.session.expiry_check_interval,
            transport: self.transport.clone(),
        })
    }
}
