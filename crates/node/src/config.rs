//! Configuration management for ctxwire nodes.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ctxwire/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::router::RouterConfig;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("listen_addr must be a socket address like 127.0.0.1:8642, got {0}")]
    InvalidListenAddr(String),

    #[error("connect_timeout_secs must be at least 1, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("response_timeout_secs must be at least 1, got {0}")]
    InvalidResponseTimeout(u64),

    #[error("max_malformed_frames must be at least 1, got {0}")]
    InvalidMaxMalformedFrames(u32),

    #[error("outbound_queue_capacity must be at least 1, got {0}")]
    InvalidQueueCapacity(usize),

    #[error("max_concurrent_requests must be at least 1, got {0}")]
    InvalidConcurrencyLimit(usize),

    #[error("serializer must be one of: msgpack, json; got {0}")]
    UnknownSerializer(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default listen address for `ctxwire serve`.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8642";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General node configuration.
    pub node: NodeConfig,

    /// Listening and dialing.
    pub network: NetworkConfig,

    /// Protocol tunables applied to every connection.
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address `serve` binds to.
    pub listen_addr: String,

    /// Seconds to wait for a TCP connection and its handshake.
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Seconds a request waits for its reply.
    pub response_timeout_secs: u64,

    /// Consecutive malformed frames tolerated before a connection is closed.
    pub max_malformed_frames: u32,

    /// Frames buffered per connection before senders wait.
    pub outbound_queue_capacity: usize,

    /// LZ4-compress large packets.
    pub compression: bool,

    /// Let peers attach contexts to this node.
    pub accept_remote_contexts: bool,

    /// Inbound requests served at once per connection.
    pub max_concurrent_requests: usize,

    /// Payload encoding (msgpack or json); peers must agree.
    pub serializer: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: 180,
            max_malformed_frames: 3,
            outbound_queue_capacity: 1024,
            compression: true,
            accept_remote_contexts: true,
            max_concurrent_requests: 256,
            serializer: "msgpack".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ctxwire")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - CTXWIRE_LOG_LEVEL: Override log level
    /// - CTXWIRE_LISTEN_ADDR: Override listen address
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("CTXWIRE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.node.log_level = level;
            }
        }

        if let Ok(addr) = std::env::var("CTXWIRE_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.network.listen_addr = addr;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.node.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.node.log_level.clone()));
        }

        if self.network.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.network.listen_addr.clone(),
            ));
        }

        if self.network.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConnectTimeout(0));
        }

        if self.protocol.response_timeout_secs == 0 {
            return Err(ConfigError::InvalidResponseTimeout(0));
        }

        if self.protocol.max_malformed_frames == 0 {
            return Err(ConfigError::InvalidMaxMalformedFrames(0));
        }

        if self.protocol.outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity(0));
        }

        if self.protocol.max_concurrent_requests == 0 {
            return Err(ConfigError::InvalidConcurrencyLimit(0));
        }

        if protocol::serializer::by_name(&self.protocol.serializer).is_none() {
            return Err(ConfigError::UnknownSerializer(
                self.protocol.serializer.clone(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs)
    }

    /// Router settings derived from the `[protocol]` section.
    ///
    /// An unknown serializer name falls back to the router default;
    /// [`Config::validate`] rejects it first.
    pub fn router_config(&self) -> RouterConfig {
        let defaults = RouterConfig::default();
        RouterConfig {
            response_timeout: Duration::from_secs(self.protocol.response_timeout_secs),
            max_malformed_frames: self.protocol.max_malformed_frames,
            outbound_queue_capacity: self.protocol.outbound_queue_capacity,
            max_concurrent_requests: self.protocol.max_concurrent_requests,
            handshake_timeout: self.connect_timeout(),
            compression: self.protocol.compression,
            accept_remote_contexts: self.protocol.accept_remote_contexts,
            serializer: protocol::serializer::by_name(&self.protocol.serializer)
                .unwrap_or(defaults.serializer),
        }
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.node.log_level, "info");
        assert_eq!(config.network.listen_addr, "127.0.0.1:8642");
        assert_eq!(config.network.connect_timeout_secs, 10);
        assert_eq!(config.protocol.response_timeout_secs, 180);
        assert_eq!(config.protocol.max_malformed_frames, 3);
        assert_eq!(config.protocol.outbound_queue_capacity, 1024);
        assert!(config.protocol.compression);
        assert!(config.protocol.accept_remote_contexts);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[protocol]
response_timeout_secs = 30
compression = false
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.protocol.response_timeout_secs, 30);
        assert!(!config.protocol.compression);
        assert_eq!(config.protocol.max_malformed_frames, 3);
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[protocol\ncompression = true");
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[protocol]
max_malformed_frames = "three"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.node.log_level = "debug".to_string();
        config.protocol.accept_remote_contexts = false;

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/ctxwire/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("config.toml");

        let mut config = Config::default();
        config.network.listen_addr = "0.0.0.0:9000".to_string();
        config.save(&path).unwrap();

        assert!(path.exists());
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("ctxwire/config.toml"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.node.log_level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );

        let mut config = Config::default();
        config.network.listen_addr = "localhost".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr(_))
        ));

        let mut config = Config::default();
        config.protocol.response_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidResponseTimeout(0)));

        let mut config = Config::default();
        config.protocol.max_malformed_frames = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxMalformedFrames(0))
        );

        let mut config = Config::default();
        config.protocol.outbound_queue_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidQueueCapacity(0)));
    }

    #[test]
    fn test_log_level_is_case_insensitive() {
        let mut config = Config::default();
        config.node.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_router_config_projection() {
        let mut config = Config::default();
        config.protocol.response_timeout_secs = 7;
        config.protocol.compression = false;
        config.protocol.accept_remote_contexts = false;

        let router = config.router_config();
        assert_eq!(router.response_timeout, Duration::from_secs(7));
        assert_eq!(router.max_malformed_frames, 3);
        assert!(!router.compression);
        assert!(!router.accept_remote_contexts);
        assert_eq!(router.serializer.name(), "msgpack");
        assert_eq!(router.handshake_timeout, Duration::from_secs(10));
        assert_eq!(router.max_concurrent_requests, 256);
    }

    #[test]
    fn test_serializer_selected_by_name() {
        let config = Config::from_toml(
            r#"
[protocol]
serializer = "json"
max_concurrent_requests = 8
"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        let router = config.router_config();
        assert_eq!(router.serializer.name(), "json");
        assert_eq!(router.max_concurrent_requests, 8);
    }

    #[test]
    fn test_validate_rejects_unknown_serializer() {
        let mut config = Config::default();
        config.protocol.serializer = "xml".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownSerializer("xml".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_zero_concurrency_limit() {
        let mut config = Config::default();
        config.protocol.max_concurrent_requests = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidConcurrencyLimit(0))
        );
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("CTXWIRE_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.node.log_level, "trace");

        std::env::remove_var("CTXWIRE_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_listen_addr() {
        std::env::set_var("CTXWIRE_LISTEN_ADDR", "0.0.0.0:7000");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.listen_addr, "0.0.0.0:7000");

        std::env::remove_var("CTXWIRE_LISTEN_ADDR");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("CTXWIRE_LISTEN_ADDR", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.listen_addr, DEFAULT_LISTEN_ADDR);

        std::env::remove_var("CTXWIRE_LISTEN_ADDR");
    }
}
