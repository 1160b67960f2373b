//! Configuration management for the Parley server.
//!
//! TOML-based configuration loading. The default configuration path is
//! `~/.config/parley/config.toml`; a missing file falls back to defaults so
//! the server runs out of the box.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be nonzero")]
    InvalidPort,

    #[error("tick_interval_ms must be greater than 0, got {0}")]
    InvalidTickInterval(u64),

    #[error("idle_evict_secs ({evict}) must exceed idle_warn_secs ({warn})")]
    InvalidIdleThresholds {
        /// Configured warn threshold.
        warn: u64,
        /// Configured evict threshold.
        evict: u64,
    },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Parley server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General server configuration.
    pub server: ServerConfig,

    /// Listener configuration.
    pub network: NetworkConfig,

    /// Credential store configuration.
    pub storage: StorageConfig,

    /// Session liveness configuration.
    pub session: SessionConfig,
}

/// General server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the session listener on.
    pub listen_addr: String,

    /// TCP port for incoming sessions.
    pub port: u16,
}

/// Credential store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the credential database.
    pub database_path: PathBuf,
}

/// Session liveness configuration.
///
/// The sweeper warns an idle session with a `ping` after `idle_warn_secs`
/// and evicts it after `idle_evict_secs` without traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Sweep cadence in milliseconds.
    pub tick_interval_ms: u64,

    /// Idle seconds before the keepalive ping is sent.
    pub idle_warn_secs: u64,

    /// Idle seconds before the session is evicted.
    pub idle_evict_secs: u64,

    /// Settling delay before the RSA key is sent to a fresh connection,
    /// giving the peer's read loop time to start.
    pub handshake_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 9853,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            idle_warn_secs: 120,
            idle_evict_secs: 135,
            handshake_delay_ms: 500,
        }
    }
}

impl SessionConfig {
    /// Sweep cadence as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Idle threshold for the keepalive warning.
    pub fn idle_warn(&self) -> Duration {
        Duration::from_secs(self.idle_warn_secs)
    }

    /// Idle threshold for eviction.
    pub fn idle_evict(&self) -> Duration {
        Duration::from_secs(self.idle_evict_secs)
    }

    /// Settling delay before the handshake key send.
    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }
}

impl Config {
    /// Load configuration from a specific path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from the default path, falling back to defaults if absent.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default configuration file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
            .join("config.toml")
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.session.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidTickInterval(
                self.session.tick_interval_ms,
            ));
        }
        if self.session.idle_evict_secs <= self.session.idle_warn_secs {
            return Err(ConfigError::InvalidIdleThresholds {
                warn: self.session.idle_warn_secs,
                evict: self.session.idle_evict_secs,
            });
        }
        if !VALID_LOG_LEVELS.contains(&self.server.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }
        Ok(())
    }
}

/// Default credential database location.
fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parley")
        .join("users.db")
}
