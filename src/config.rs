use crate::defs::{
    DEFAULT_BROADCAST_QUEUE_CAPACITY, DEFAULT_HOST, DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS,
    DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT, DEFAULT_REAP_INTERVAL_MS, DEFAULT_SHUTDOWN_TIMEOUT_MS,
    DEFAULT_UPDATE_INTERVAL_SEC, MAX_UPDATE_INTERVAL_SEC, MIN_UPDATE_INTERVAL_SEC,
};
use crate::errors::ConfigError;

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Server settings.
///
/// Every key is optional in the TOML file; missing keys take the defaults
/// from [`defs`](crate::defs).
///
/// ```toml
/// host = "0.0.0.0"
/// port = 9000
/// update_interval_secs = 30
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen host.
    pub host: String,
    /// Listen port; `0` picks a free port.
    pub port: u16,
    /// Weather/currency refresh interval in seconds.
    pub update_interval_secs: u64,
    /// Capacity of the chat broadcast queue.
    pub broadcast_queue_capacity: usize,
    /// Longest accepted frame in bytes.
    pub max_frame_len: usize,
    /// Consecutive malformed frames tolerated per session.
    pub max_consecutive_frame_errors: usize,
    /// Upper bound on shutdown duration, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Period of the closed-connection sweep, in milliseconds.
    pub reap_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            update_interval_secs: DEFAULT_UPDATE_INTERVAL_SEC,
            broadcast_queue_capacity: DEFAULT_BROADCAST_QUEUE_CAPACITY,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_consecutive_frame_errors: DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            reap_interval_ms: DEFAULT_REAP_INTERVAL_MS,
        }
    }
}

impl ServerConfig {
    /// Defaults with the given host and port.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Loads and validates a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        log::info!("Loading server configuration from: {:?}", path.as_ref());
        let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&raw)
    }

    /// Parses and validates TOML text.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        let interval_range = MIN_UPDATE_INTERVAL_SEC..=MAX_UPDATE_INTERVAL_SEC;
        if !interval_range.contains(&self.update_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "update_interval_secs must be between {} and {}, got {}",
                MIN_UPDATE_INTERVAL_SEC, MAX_UPDATE_INTERVAL_SEC, self.update_interval_secs
            )));
        }
        let positive = [
            ("broadcast_queue_capacity", self.broadcast_queue_capacity),
            ("max_frame_len", self.max_frame_len),
            ("max_consecutive_frame_errors", self.max_consecutive_frame_errors),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", key)));
            }
        }
        if self.reap_interval_ms == 0 {
            return Err(ConfigError::Invalid("reap_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Shutdown deadline as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reaper period as a duration.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}
