//! Configuration management for HTTP/2 connections
//!
//! Settings are plain serde structs with defaults. [`Http2Config::load`] layers
//! an optional file (toml, json or yaml) under `GH2_*` environment variables,
//! e.g. `GH2_CONNECTION__MAX_FRAME_SIZE=32768`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

/// Smallest SETTINGS_MAX_FRAME_SIZE a peer may advertise (RFC 9113 §6.5.2)
pub const MIN_FRAME_SIZE: u32 = 16_384;
/// Largest SETTINGS_MAX_FRAME_SIZE a peer may advertise
pub const MAX_FRAME_SIZE: u32 = 16_777_215;
/// Largest flow-control window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Http2Config {
    /// Connection settings advertised during the handshake
    pub connection: ConnectionConfig,
    /// PING based liveness checks
    pub keep_alive: KeepAliveConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Connection-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// SETTINGS_INITIAL_WINDOW_SIZE for every stream
    pub initial_stream_window_size: u32,
    /// Connection-level receive window
    pub initial_connection_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE
    pub max_frame_size: u32,
    /// SETTINGS_MAX_CONCURRENT_STREAMS for peer-initiated streams
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_MAX_HEADER_LIST_SIZE
    pub max_header_list_size: u32,
    /// Maximum bytes buffered per stream before the writer applies backpressure
    pub max_send_buffer_size: usize,
    /// Locally reset streams remembered to absorb late frames
    pub max_concurrent_reset_streams: usize,
    /// Handshake timeout in milliseconds
    pub handshake_timeout: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_stream_window_size: 65_535,
            initial_connection_window_size: 1024 * 1024, // 1MB
            max_frame_size: MIN_FRAME_SIZE,
            max_concurrent_streams: Some(256),
            max_header_list_size: 16 * 1024,
            max_send_buffer_size: 400 * 1024,
            max_concurrent_reset_streams: 10,
            handshake_timeout: 10_000, // 10 seconds
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout)
    }

    /// Reject settings HTTP/2 cannot express instead of coercing them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_stream_window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::Invalid(format!(
                "initial_stream_window_size {} exceeds {}",
                self.initial_stream_window_size, MAX_WINDOW_SIZE
            )));
        }

        if self.initial_connection_window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::Invalid(format!(
                "initial_connection_window_size {} exceeds {}",
                self.initial_connection_window_size, MAX_WINDOW_SIZE
            )));
        }

        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size {} outside {}..={}",
                self.max_frame_size, MIN_FRAME_SIZE, MAX_FRAME_SIZE
            )));
        }

        if self.max_send_buffer_size == 0 {
            return Err(ConfigError::Invalid("max_send_buffer_size must be greater than 0".to_string()));
        }

        if self.handshake_timeout == 0 {
            return Err(ConfigError::Invalid("handshake_timeout must be greater than 0".to_string()));
        }

        Ok(())
    }
}

/// Keep-alive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    /// PING interval in milliseconds
    pub interval: u64,
    /// Time to wait for the matching PONG in milliseconds
    pub timeout: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 10_000, // 10 seconds
            timeout: 20_000,  // 20 seconds
        }
    }
}

impl KeepAliveConfig {
    /// Enabled keep-alive with the given interval and timeout
    pub fn every(interval: Duration, timeout: Duration) -> Self {
        Self {
            enabled: true,
            interval: interval.as_millis() as u64,
            timeout: timeout.as_millis() as u64,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && (self.interval == 0 || self.timeout == 0) {
            return Err(ConfigError::Invalid(
                "keep_alive interval and timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Colorize output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Get tracing level
    pub fn tracing_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

impl Http2Config {
    /// Load configuration from an optional file, overridden by `GH2_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix("GH2")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn load_from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.keep_alive.validate()?;
        Ok(())
    }
}

/// Configuration builder for easier setup
pub struct ConfigBuilder {
    config: Http2Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Http2Config::default(),
        }
    }

    pub fn initial_stream_window_size(mut self, size: u32) -> Self {
        self.config.connection.initial_stream_window_size = size;
        self
    }

    pub fn initial_connection_window_size(mut self, size: u32) -> Self {
        self.config.connection.initial_connection_window_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.connection.max_frame_size = size;
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.connection.max_concurrent_streams = Some(max);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.handshake_timeout = timeout.as_millis() as u64;
        self
    }

    pub fn keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.keep_alive = KeepAliveConfig::every(interval, timeout);
        self
    }

    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Http2Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
