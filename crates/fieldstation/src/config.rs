//! Configuration management for fieldstation.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "fieldstation";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "outbox.db";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `FIELDSTATION_`)
/// 2. TOML config file at `~/.config/fieldstation/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Station identity.
    pub station: StationConfig,
    /// Outbox storage configuration.
    pub outbox: OutboxConfig,
    /// Broadcast hub configuration.
    pub broadcast: BroadcastConfig,
    /// Control channel configuration.
    pub control: ControlConfig,
    /// Uploader configuration.
    pub uploader: UploaderConfig,
    /// Decode source configuration.
    pub decode: DecodeConfig,
}

/// Station identity configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Station identifier reported to the remote collector.
    pub id: String,
}

/// Outbox storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/fieldstation/outbox.db`
    pub database_path: Option<PathBuf>,
    /// Days to keep already-uploaded records before cleanup.
    pub retention_days: u32,
    /// Hours between retention cleanup passes.
    pub cleanup_interval_hours: u32,
}

/// Broadcast hub configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Serve the subscriber stream.
    pub enabled: bool,
    /// Bind address for the subscriber stream listener.
    pub bind: String,
    /// Port for the subscriber stream listener.
    pub port: u16,
    /// Per-subscriber queued-line capacity; lines past this are dropped.
    pub queue_capacity: usize,
    /// Seconds of idle before a keepalive marker is written.
    pub keepalive_secs: u64,
}

/// Control channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Serve the control endpoints.
    pub enabled: bool,
    /// Bind address for the control listener.
    pub bind: String,
    /// Port for the control listener.
    pub port: u16,
}

/// Uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Run the periodic uploader.
    pub enabled: bool,
    /// Base URL of the remote collector.
    pub server_url: String,
    /// Bearer token for collector requests.
    pub api_key: String,
    /// Seconds between upload cycles.
    pub upload_interval_secs: u64,
    /// Maximum records per upload batch.
    pub batch_size: usize,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// URL fetched to probe connectivity before each cycle.
    pub probe_url: String,
}

/// Decode source configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// JSON-lines replay file to tail for decode events.
    pub replay_path: Option<PathBuf>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            id: "UNKNOWN".to_string(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            retention_days: 30,
            cleanup_interval_hours: 24,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 8080,
            queue_capacity: 256,
            keepalive_secs: 30,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: String::new(),
            api_key: String::new(),
            upload_interval_secs: 300,
            batch_size: 100,
            request_timeout_secs: 30,
            probe_url: "https://dns.google".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file).nested())
            .merge(Env::prefixed("FIELDSTATION_").split("_"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.uploader.upload_interval_secs == 0 {
            return Err(Error::ConfigValidation {
                message: "upload_interval_secs must be greater than 0".to_string(),
            });
        }

        if self.uploader.batch_size == 0 {
            return Err(Error::ConfigValidation {
                message: "batch_size must be greater than 0".to_string(),
            });
        }

        if self.uploader.enabled && self.uploader.server_url.is_empty() {
            return Err(Error::ConfigValidation {
                message: "uploader is enabled but server_url is not set".to_string(),
            });
        }

        if self.broadcast.queue_capacity == 0 {
            return Err(Error::ConfigValidation {
                message: "queue_capacity must be greater than 0".to_string(),
            });
        }

        if self.broadcast.keepalive_secs == 0 {
            return Err(Error::ConfigValidation {
                message: "keepalive_secs must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.outbox
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the upload interval as a Duration.
    #[must_use]
    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.uploader.upload_interval_secs)
    }

    /// Get the collector request timeout as a Duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.uploader.request_timeout_secs)
    }

    /// Get the subscriber keepalive interval as a Duration.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast.keepalive_secs)
    }

    /// Get the cleanup interval as a Duration.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.outbox.cleanup_interval_hours) * 60 * 60)
    }

    /// The broadcast listener address in `host:port` form.
    #[must_use]
    pub fn broadcast_addr(&self) -> String {
        format!("{}:{}", self.broadcast.bind, self.broadcast.port)
    }

    /// The control listener address in `host:port` form.
    #[must_use]
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.control.bind, self.control.port)
    }
}
