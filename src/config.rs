//! # Configuration Management
//!
//! Runtime settings for the message layer: send batching, receive limits, handshake
//! policy and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides (`NETMSG_*`) via `from_env()`
//!
//! Durations are written as integer milliseconds.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default send buffer size, one Ethernet MSS
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 1460;

/// Default flush timer tick
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Default cap on buffered bytes for one incoming message
pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Default time allowed for a handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Outbound batching
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Receive-side resource limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Handshake policy
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `NETMSG_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Unparseable values are an error.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_var::<u64>(&lookup, "NETMSG_FLUSH_INTERVAL_MS")? {
            self.scheduler.flush_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<usize>(&lookup, "NETMSG_SEND_BUFFER_SIZE")? {
            self.scheduler.send_buffer_size = size;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "NETMSG_MAX_PENDING_BYTES")? {
            self.limits.max_pending_bytes = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "NETMSG_HANDSHAKE_TIMEOUT_MS")? {
            self.handshake.timeout = Duration::from_millis(ms);
        }
        if let Some(required) = parse_var::<bool>(&lookup, "NETMSG_REQUIRE_ENCRYPTION")? {
            self.handshake.require_encryption = required;
        }
        if let Some(level) = lookup("NETMSG_LOG_LEVEL") {
            self.logging.log_level = level
                .parse()
                .map_err(|_| ProtocolError::Config(format!("Invalid NETMSG_LOG_LEVEL: {level}")))?;
        }
        Ok(())
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
            .map_err(|e| ProtocolError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| ProtocolError::Config(format!("Failed to write config file: {e}")))?;
        Ok(())
    }

    /// Validate the configuration. An empty list means it is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.scheduler.validate());
        errors.extend(self.limits.validate());
        errors.extend(self.handshake.validate());
        errors.extend(self.logging.validate());

        if self.limits.max_pending_bytes < self.scheduler.send_buffer_size {
            errors.push(format!(
                "max_pending_bytes ({}) is smaller than send_buffer_size ({})",
                self.limits.max_pending_bytes, self.scheduler.send_buffer_size
            ));
        }
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProtocolError::Config(format!("Invalid value for {key}: '{raw}'"))),
    }
}

/// Send batching configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Tick of the shared flush timer
    #[serde(with = "duration_serde")]
    pub flush_interval: Duration,

    /// Pending bytes per connection after which an enqueue flushes immediately
    pub send_buffer_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.flush_interval.is_zero() {
            errors.push("Flush interval must be greater than 0".to_string());
        } else if self.flush_interval > Duration::from_secs(1) {
            errors.push(format!(
                "Flush interval too long: {}ms (maximum: 1000ms)",
                self.flush_interval.as_millis()
            ));
        }

        if self.send_buffer_size == 0 {
            errors.push("Send buffer size must be greater than 0".to_string());
        } else if self.send_buffer_size > 16 * 1024 * 1024 {
            errors.push(format!(
                "Send buffer size too large: {} bytes (maximum: 16 MB)",
                self.send_buffer_size
            ));
        }

        errors
    }
}

/// Receive-side limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Largest message the accumulator will buffer before reporting resource exhaustion
    pub max_pending_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_pending_bytes < 64 {
            errors.push(format!(
                "Max pending bytes too small: {} (minimum: 64)",
                self.max_pending_bytes
            ));
        } else if self.max_pending_bytes > 256 * 1024 * 1024 {
            errors.push(format!(
                "Max pending bytes too large: {} (maximum: 256 MB)",
                self.max_pending_bytes
            ));
        }
        errors
    }
}

/// Handshake policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandshakeConfig {
    /// Age after which an unfinished handshake is abandoned
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    /// Refuse sessions on channels registered without DH parameters
    pub require_encryption: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            require_encryption: false,
        }
    }
}

impl HandshakeConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }
        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("netmsg-protocol"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
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
        let millis = duration.as_millis() as u64;
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
        level.as_str().to_ascii_lowercase().serialize(serializer)
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
