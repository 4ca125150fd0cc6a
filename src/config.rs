//! # Configuration Management
//!
//! Centralized configuration for query servers and clients.
//!
//! This module provides structured configuration for the UDP endpoints, challenge
//! lifetimes, fragmentation, the reply cache and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables (`SOURCE_QUERY_*`) via `from_env()`
//! - Direct instantiation with defaults
//!
//! Durations are written in milliseconds.
//!
//! ## Operational Considerations
//! - Fragment sizes above the path MTU cause IP fragmentation; 1248 bytes is the de facto default
//! - Short challenge TTLs cost an extra round trip per query
//! - The reply cache bounds the cost of query floods against the stats provider

use crate::error::{ProtocolError, Result};
use crate::protocol::handler::ClientSettings;
use crate::protocol::server::ServerSettings;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Well-known query port
pub const DEFAULT_QUERY_PORT: u16 = 27015;

/// Smallest fragment size accepted by validation
pub const MIN_FRAGMENT_SIZE: usize = 64;

/// Largest fragment size representable in the long packet header
pub const MAX_FRAGMENT_SIZE: usize = i16::MAX as usize;

/// Main query configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct QueryConfig {
    /// Answering side
    #[serde(default)]
    pub server: ServerConfig,

    /// Asking side
    #[serde(default)]
    pub client: ClientConfig,

    /// Session and fragmentation settings shared by both roles
    #[serde(default)]
    pub session: SessionConfig,

    /// Reply cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl QueryConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SOURCE_QUERY_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("SOURCE_QUERY_CLIENT_ADDRESS") {
            config.client.bind_address = addr;
        }

        if let Some(val) = env_millis("SOURCE_QUERY_RESPONSE_TIMEOUT_MS") {
            config.client.response_timeout = val;
        }

        if let Some(val) = env_millis("SOURCE_QUERY_CHALLENGE_TTL_MS") {
            config.server.challenge_update_ttl = val;
        }

        if let Some(val) = env_millis("SOURCE_QUERY_SESSION_TTL_MS") {
            config.session.session_ttl = val;
        }

        if let Ok(size) = std::env::var("SOURCE_QUERY_MAX_FRAGMENT_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.session.max_fragment_size = val;
            }
        }

        if let Some(val) = env_millis("SOURCE_QUERY_CACHE_TTL_MS") {
            config.cache.reply_ttl = val;
        }

        if let Ok(level) = std::env::var("SOURCE_QUERY_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.session.validate());
        errors.extend(self.cache.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Session tuning for the answering role
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            challenge_update_ttl: self.server.challenge_update_ttl,
            challenge_creation_ttl: self.server.challenge_creation_ttl,
            check_info_payload: self.server.check_info_payload,
            expected_info_payload: self.server.expected_info_payload.clone(),
            reassembly_deadline: self.session.reassembly_deadline,
            max_fragment_size: self.session.max_fragment_size,
        }
    }

    /// Session tuning for the asking role
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            reassembly_deadline: self.session.reassembly_deadline,
            max_fragment_size: self.session.max_fragment_size,
            session_ttl: self.session.session_ttl,
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    /// Bind address of the query socket
    pub address: String,

    /// Idle time after which a client must fetch a new challenge
    #[serde(with = "duration_serde")]
    pub challenge_update_ttl: Duration,

    /// Maximum age of a challenge
    #[serde(with = "duration_serde")]
    pub challenge_creation_ttl: Duration,

    /// Reject A2S_INFO requests whose payload differs from `expected_info_payload`
    pub check_info_payload: bool,

    pub expected_info_payload: String,

    /// Interval between metrics log lines, zero disables them
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let settings = ServerSettings::default();
        Self {
            address: format!("0.0.0.0:{DEFAULT_QUERY_PORT}"),
            challenge_update_ttl: settings.challenge_update_ttl,
            challenge_creation_ttl: settings.challenge_creation_ttl,
            check_info_payload: settings.check_info_payload,
            expected_info_payload: settings.expected_info_payload,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.parse::<SocketAddr>().is_err() {
            errors.push(format!("Invalid server address: {}", self.address));
        }

        if self.challenge_update_ttl.is_zero() {
            errors.push("Challenge update TTL cannot be zero".to_string());
        }

        if self.challenge_creation_ttl.is_zero() {
            errors.push("Challenge creation TTL cannot be zero".to_string());
        } else if self.challenge_creation_ttl < self.challenge_update_ttl {
            errors.push(format!(
                "Challenge creation TTL ({:?}) is shorter than the update TTL ({:?})",
                self.challenge_creation_ttl, self.challenge_update_ttl
            ));
        }

        if self.check_info_payload && self.expected_info_payload.is_empty() {
            errors.push(
                "Expected info payload cannot be empty when payload checking is enabled"
                    .to_string(),
            );
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClientConfig {
    /// Local bind address, port 0 picks an ephemeral port
    pub bind_address: String,

    /// Time to wait for the final reply of a query, challenge round trip included
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("0.0.0.0:0"),
            response_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!("Invalid client bind address: {}", self.bind_address));
        }

        if self.response_timeout.is_zero() {
            errors.push("Response timeout cannot be zero".to_string());
        } else if self.response_timeout > Duration::from_secs(60) {
            errors.push(format!(
                "Response timeout too long: {:?} (maximum: 60s)",
                self.response_timeout
            ));
        }

        errors
    }
}

/// Session and fragmentation configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SessionConfig {
    /// Idle time after which a peer's session is forgotten
    #[serde(with = "duration_serde")]
    pub session_ttl: Duration,

    /// Interval between idle session sweeps on a server
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Time a partially received message may wait for its remaining fragments
    #[serde(with = "duration_serde")]
    pub reassembly_deadline: Duration,

    /// Largest payload carried by one datagram before a message is fragmented
    pub max_fragment_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let settings = ClientSettings::default();
        Self {
            session_ttl: settings.session_ttl,
            sweep_interval: Duration::from_secs(30),
            reassembly_deadline: settings.reassembly_deadline,
            max_fragment_size: settings.max_fragment_size,
        }
    }
}

impl SessionConfig {
    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.session_ttl.is_zero() {
            errors.push("Session TTL cannot be zero".to_string());
        }

        if self.sweep_interval.is_zero() {
            errors.push("Session sweep interval cannot be zero".to_string());
        }

        if self.reassembly_deadline.is_zero() {
            errors.push("Reassembly deadline cannot be zero".to_string());
        }

        if self.max_fragment_size < MIN_FRAGMENT_SIZE {
            errors.push(format!(
                "Max fragment size too small: {} bytes (minimum: {MIN_FRAGMENT_SIZE})",
                self.max_fragment_size
            ));
        } else if self.max_fragment_size > MAX_FRAGMENT_SIZE {
            errors.push(format!(
                "Max fragment size too large: {} bytes (maximum: {MAX_FRAGMENT_SIZE})",
                self.max_fragment_size
            ));
        }

        errors
    }
}

/// Reply cache configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Lifetime of a built reply
    #[serde(with = "duration_serde")]
    pub reply_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reply_ttl: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    /// Validate cache configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.enabled {
            if self.reply_ttl.is_zero() {
                errors.push("Reply cache TTL cannot be zero when the cache is enabled".to_string());
            } else if self.reply_ttl > Duration::from_secs(300) {
                errors.push(format!(
                    "Reply cache TTL too long: {:?} (maximum: 5m)",
                    self.reply_ttl
                ));
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("source-query"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
