//! Configuration module
//!
//! TOML-based configuration for robridge:
//! - Broker connection parameters and reconnection policy
//! - Per-channel `[[bridge]]` specs
//! - Statistics/heartbeat emission intervals
//! - Chunked transfer parameters
//! - Environment variable overrides (ROBRIDGE_* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use bridge::{BridgeDirection, BridgeMetadata, BridgeSpec, TopicSpec};

mod bridge;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
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
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
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

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection configuration
    pub broker: BrokerConfig,
    /// Statistics and heartbeat emission
    pub statistics: StatisticsConfig,
    /// Chunked large-payload transfer
    pub transfer: TransferConfig,
    /// Bridge channel specs
    #[serde(default)]
    pub bridge: Vec<BridgeSpec>,
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

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Client id used on CONNECT
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Use clean session (no broker-side session persistence)
    #[serde(default = "default_true")]
    pub clean_session: bool,

    /// Initial reconnect backoff in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,

    /// Backoff cap in seconds
    #[serde(default = "default_max_reconnect_interval")]
    pub max_reconnect_interval: u64,

    /// A connection that stays up at least this many seconds resets the
    /// backoff to its initial value
    #[serde(default = "default_stable_threshold")]
    pub stable_connection_threshold: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Topic prefix for all broker-side topics
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Default QoS for bridges that do not set one
    #[serde(default = "default_qos")]
    pub default_qos: u8,

    /// Default retain flag for bridges that do not set one
    #[serde(default)]
    pub default_retain: bool,
}

fn default_client_id() -> String {
    format!("robridge-{}", std::process::id())
}

fn default_keepalive() -> u16 {
    60
}

fn default_reconnect_interval() -> u64 {
    1
}

fn default_max_reconnect_interval() -> u64 {
    60
}

fn default_stable_threshold() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_topic_prefix() -> String {
    "ros2".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: default_client_id(),
            username: None,
            password: None,
            keepalive: default_keepalive(),
            clean_session: true,
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            stable_connection_threshold: default_stable_threshold(),
            connect_timeout: default_connect_timeout(),
            topic_prefix: default_topic_prefix(),
            default_qos: default_qos(),
            default_retain: false,
        }
    }
}

impl BrokerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval.max(1))
    }

    pub fn max_reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval.max(1))
    }

    pub fn stable_connection_duration(&self) -> Duration {
        Duration::from_secs(self.stable_connection_threshold)
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn keepalive_duration(&self) -> Duration {
        Duration::from_secs(self.keepalive as u64)
    }
}

/// Statistics and heartbeat emission configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Emit statistics/heartbeat at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Statistics emission interval in seconds
    #[serde(default = "default_statistics_interval")]
    pub interval: u64,

    /// Heartbeat emission interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
}

fn default_statistics_interval() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    5
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_statistics_interval(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

impl StatisticsConfig {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval.max(1))
    }

    pub fn heartbeat_duration(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }
}

/// Chunked transfer configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Payloads above this many bytes go through the chunk transfer
    /// protocol instead of a single envelope
    #[serde(default = "default_transfer_threshold")]
    pub threshold: usize,

    /// A receiving session with no new chunk for this many seconds is
    /// abandoned and freed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// QoS for meta and chunk messages
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_transfer_threshold() -> usize {
    256 * 1024
}

fn default_idle_timeout() -> u64 {
    30
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            threshold: default_transfer_threshold(),
            idle_timeout: default_idle_timeout(),
            qos: default_qos(),
        }
    }
}

impl TransferConfig {
    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.idle_timeout.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax
    /// 2. Override via env vars with a `ROBRIDGE__` prefix, double
    ///    underscores separating nested keys:
    ///    - `ROBRIDGE__BROKER__HOST=mqtt.fleet.local` overrides `broker.host`
    ///    - `ROBRIDGE__STATISTICS__INTERVAL=30` overrides `statistics.interval`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("ROBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. All failures here are fatal at startup,
    /// before any bridge runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Validation("broker host is empty".to_string()));
        }
        if self.broker.topic_prefix.is_empty()
            || self.broker.topic_prefix.contains(['#', '+'])
        {
            return Err(ConfigError::Validation(format!(
                "invalid topic prefix: `{}`",
                self.broker.topic_prefix
            )));
        }
        if self.broker.default_qos > 2 {
            return Err(ConfigError::Validation(format!(
                "default_qos must be 0..=2, got {}",
                self.broker.default_qos
            )));
        }
        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::Validation(
                "transfer chunk_size must be non-zero".to_string(),
            ));
        }
        if self.transfer.qos > 2 {
            return Err(ConfigError::Validation(format!(
                "transfer qos must be 0..=2, got {}",
                self.transfer.qos
            )));
        }

        let mut names = std::collections::HashSet::new();
        for spec in &self.bridge {
            if spec.name.is_empty() {
                return Err(ConfigError::Validation(
                    "bridge with empty name".to_string(),
                ));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate bridge name: `{}`",
                    spec.name
                )));
            }
            if spec.bus_topic.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "bridge `{}`: bus_topic is empty",
                    spec.name
                )));
            }
            if spec.field_path.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "bridge `{}`: field_path is empty",
                    spec.name
                )));
            }
            if spec.topic.name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "bridge `{}`: topic name is empty",
                    spec.name
                )));
            }
            if let Some(qos) = spec.qos {
                if qos > 2 {
                    return Err(ConfigError::Validation(format!(
                        "bridge `{}`: qos must be 0..=2, got {}",
                        spec.name, qos
                    )));
                }
            }
            if spec.min_interval == Some(Duration::ZERO) {
                return Err(ConfigError::Validation(format!(
                    "bridge `{}`: min_interval must be positive",
                    spec.name
                )));
            }
        }

        Ok(())
    }
}
