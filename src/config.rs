//! # Configuration Management
//!
//! Centralized configuration for the device link server.
//!
//! This module provides structured configuration for the TCP listener, the
//! upload reassembly engine, session expiry, codec resynchronization and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`DEVICE_LINK_*`)
//!
//! ## Defaults
//! - Chunks up to 1 MiB stay in memory; larger ones spill to temp files
//! - Sessions idle for 10 minutes are swept once a minute

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Default listen port for device connections
pub const DEFAULT_PORT: u16 = 9900;

/// Chunks above this size are spilled to disk (1 MiB)
pub const DEFAULT_MEMORY_THRESHOLD: usize = 1024 * 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LinkConfig {
    /// Listener and connection settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Upload reassembly settings
    #[serde(default)]
    pub upload: UploadConfig,

    /// Session expiry settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Frame codec settings
    #[serde(default)]
    pub codec: CodecConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LinkConfig {
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

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("DEVICE_LINK_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(port) = std::env::var("DEVICE_LINK_SERVER_PORT") {
            let port = port.parse::<u16>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid DEVICE_LINK_SERVER_PORT: {e}"))
            })?;
            config.server.set_port(port);
        }

        if let Ok(root) = std::env::var("DEVICE_LINK_UPLOAD_ROOT") {
            config.upload.root = PathBuf::from(root);
        }

        if let Ok(threshold) = std::env::var("DEVICE_LINK_MEMORY_THRESHOLD") {
            if let Ok(val) = threshold.parse::<usize>() {
                config.upload.memory_threshold = val;
            }
        }

        if let Ok(timeout) = std::env::var("DEVICE_LINK_SESSION_TIMEOUT_MINUTES") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.session.timeout_minutes = val;
            }
        }

        if let Ok(interval) = std::env::var("DEVICE_LINK_SWEEP_INTERVAL_MINUTES") {
            if let Ok(val) = interval.parse::<u64>() {
                config.session.sweep_interval_minutes = val;
            }
        }

        if let Ok(enabled) = std::env::var("DEVICE_LINK_HEARTBEAT_ENABLED") {
            config.server.heartbeat_enabled = matches!(enabled.as_str(), "1" | "true" | "yes");
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

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.upload.validate());
        errors.extend(self.session.validate());
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
}

/// Listener and per-connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:9900")
    pub address: String,

    /// Depth of each connection's outbound frame queue
    pub outbound_queue: usize,

    /// Maximum number of concurrent device connections
    pub max_connections: usize,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Whether the server pushes heartbeat commands to devices
    pub heartbeat_enabled: bool,

    /// Interval between server heartbeat commands
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_PORT}"),
            outbound_queue: 64,
            max_connections: 10_000,
            shutdown_timeout: Duration::from_secs(10),
            heartbeat_enabled: false,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Replace the port of the listen address, keeping the host
    pub fn set_port(&mut self, port: u16) {
        let host = self
            .address
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        self.address = format!("{host}:{port}");
    }

    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:9900')",
                self.address
            ));
        }

        if self.outbound_queue == 0 {
            errors.push("Outbound queue must be greater than 0".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.heartbeat_enabled && self.heartbeat_interval.as_secs() < 1 {
            errors.push("Heartbeat interval too short (minimum: 1s)".to_string());
        }

        errors
    }
}

/// Content hash applied to finished upload artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
}

/// Upload reassembly configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Directory receiving finished artifacts; temp chunks live in `<root>/temp`
    pub root: PathBuf,

    /// Chunks larger than this many bytes are spilled to temp files
    pub memory_threshold: usize,

    /// Hash computed over each finished artifact
    pub hash_algorithm: HashAlgorithm,

    /// File extension of finished artifacts
    pub artifact_extension: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("uploads"),
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            hash_algorithm: HashAlgorithm::Md5,
            artifact_extension: String::from("mp4"),
        }
    }
}

impl UploadConfig {
    /// Directory holding spilled chunks
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Validate upload configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.root.as_os_str().is_empty() {
            errors.push("Upload root cannot be empty".to_string());
        }

        if self.artifact_extension.is_empty() {
            errors.push("Artifact extension cannot be empty".to_string());
        } else if self.artifact_extension.contains(&['/', '\\', '.'][..]) {
            errors.push(format!(
                "Invalid artifact extension: '{}' (no dots or path separators)",
                self.artifact_extension
            ));
        }

        errors
    }
}

/// Session expiry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minutes of inactivity after which a session expires
    pub timeout_minutes: u64,

    /// Whether the periodic sweeper runs at all
    pub sweep_enabled: bool,

    /// Minutes between sweeps
    pub sweep_interval_minutes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 10,
            sweep_enabled: true,
            sweep_interval_minutes: 1,
        }
    }
}

impl SessionConfig {
    /// Session idle timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    /// Sweep interval as a Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes * 60)
    }

    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.timeout_minutes == 0 {
            errors.push("Session timeout must be at least 1 minute".to_string());
        }

        if self.sweep_enabled && self.sweep_interval_minutes == 0 {
            errors.push("Sweep interval must be at least 1 minute".to_string());
        }

        errors
    }
}

/// What the decoder discards after a frame fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResyncPolicy {
    /// Skip the offending start marker and rescan the remaining bytes
    #[default]
    NextStartMarker,
    /// Drop everything currently buffered for the connection
    DiscardBuffer,
}

/// Frame codec configuration
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default)]
pub struct CodecConfig {
    #[serde(default)]
    pub resync: ResyncPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
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
            app_name: String::from("device-link"),
            log_level: Level::INFO,
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
