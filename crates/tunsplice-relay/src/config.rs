//! Engine Configuration
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```toml
//! intercept_ports = [443, 8443]
//! connect_timeout_ms = 3000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest TCP payload that fits an option-less IPv4/TCP packet
const MAX_SEGMENT_LIMIT: usize = u16::MAX as usize - 40;

/// Smallest datagram every IPv4 host must accept
const MIN_READ_BUFFER: usize = 576;

/// Relay engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Destination ports whose flows are relayed
    pub intercept_ports: Vec<u16>,
    /// Bytes requested from the tunnel per read
    pub read_buffer_size: usize,
    /// Largest payload placed in one injected packet
    pub max_segment_size: usize,
    /// Window advertised in injected packets
    pub response_window: u16,
    /// Per-attempt outbound connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Outbound connect attempts before the relay gives up
    pub connect_attempts: u32,
    /// Initial delay between connect attempts (milliseconds)
    pub connect_backoff_ms: u64,
    /// Upper bound for the doubling connect delay (milliseconds)
    pub connect_backoff_max_ms: u64,
    /// How long shutdown waits for relays to release their sockets (milliseconds)
    pub shutdown_grace_ms: u64,
    /// Payloads a relay holds while its socket is dialing or backed up
    pub relay_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            intercept_ports: vec![443],
            read_buffer_size: 32767,
            max_segment_size: 1460, // 1500 MTU - 40 header bytes
            response_window: 8192,
            connect_timeout_ms: 5000,
            connect_attempts: 3,
            connect_backoff_ms: 10,
            connect_backoff_max_ms: 500,
            shutdown_grace_ms: 2000,
            relay_queue_depth: 256,
        }
    }
}

impl EngineConfig {
    /// Check if flows toward `port` are relayed
    pub fn intercepts(&self, port: u16) -> bool {
        self.intercept_ports.contains(&port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn connect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_max_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.intercept_ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        if self.intercept_ports.contains(&0) {
            return Err(ConfigError::InvalidPort);
        }
        if self.max_segment_size == 0 || self.max_segment_size > MAX_SEGMENT_LIMIT {
            return Err(ConfigError::InvalidSegmentSize(self.max_segment_size));
        }
        if self.read_buffer_size < MIN_READ_BUFFER {
            return Err(ConfigError::BufferTooSmall(self.read_buffer_size));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::InvalidConnectPolicy(
                "connect_attempts must be at least 1".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConnectPolicy(
                "connect_timeout_ms must be non-zero".into(),
            ));
        }
        if self.relay_queue_depth == 0 {
            return Err(ConfigError::InvalidQueueDepth);
        }
        Ok(())
    }

    /// Parse from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse from JSON text
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from a file, picking the format from its extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path)?;
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config = match format {
            ConfigFormat::Toml => Self::from_toml(&content)?,
            ConfigFormat::Json => Self::from_json(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// Config file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("No intercept ports configured")]
    NoPorts,

    #[error("Invalid intercept port")]
    InvalidPort,

    #[error("Invalid max segment size: {0}")]
    InvalidSegmentSize(usize),

    #[error("Read buffer too small: {0} bytes (minimum 576)")]
    BufferTooSmall(usize),

    #[error("Invalid connect policy: {0}")]
    InvalidConnectPolicy(String),

    #[error("Relay queue depth must be at least 1")]
    InvalidQueueDepth,

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,
}
