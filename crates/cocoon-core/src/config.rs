//! Platform configuration.
//!
//! The daemon reads one TOML file describing where its state lives and
//! how it talks to the outside world. Every field has a default so an
//! empty file is a valid configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlatformConfig {
    /// Store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Control API settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Archive settings.
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Launcher settings.
    #[serde(default)]
    pub launcher: LauncherConfig,
}

impl PlatformConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value fails
    /// validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.write_retries == 0 {
            return Err(ConfigError::Validation(
                "store.write_retries must be at least 1".to_string(),
            ));
        }
        if self.store.retry_backoff_min_ms > self.store.retry_backoff_max_ms {
            return Err(ConfigError::Validation(format!(
                "store.retry_backoff_min_ms ({}) exceeds retry_backoff_max_ms ({})",
                self.store.retry_backoff_min_ms, self.store.retry_backoff_max_ms
            )));
        }
        if self.launcher.deploy_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "launcher.deploy_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backing-store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Attempts per write before giving up on serialization conflicts.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    /// Lower bound of the retry backoff jitter, milliseconds.
    #[serde(default = "default_retry_backoff_min_ms")]
    pub retry_backoff_min_ms: u64,

    /// Upper bound of the retry backoff jitter, milliseconds.
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            write_retries: default_write_retries(),
            retry_backoff_min_ms: default_retry_backoff_min_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

/// Control API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Path of the Unix socket the control API listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

/// Release-archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Directory sealed release archives are written into.
    #[serde(default = "default_archive_dir")]
    pub dir: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: default_archive_dir(),
        }
    }
}

/// Container-launcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Launcher endpoint address. Empty disables dispatch; deployments
    /// are logged and treated as handed off.
    #[serde(default = "default_launcher_address")]
    pub address: String,

    /// Deadline for a single deployment hand-off, seconds.
    #[serde(default = "default_deploy_timeout_secs")]
    pub deploy_timeout_secs: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            address: default_launcher_address(),
            deploy_timeout_secs: default_deploy_timeout_secs(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("cocoond.db")
}

const fn default_write_retries() -> u32 {
    3
}

const fn default_retry_backoff_min_ms() -> u64 {
    50
}

const fn default_retry_backoff_max_ms() -> u64 {
    200
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/cocoond.sock")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("archives")
}

fn default_launcher_address() -> String {
    "127.0.0.1:7707".to_string()
}

const fn default_deploy_timeout_secs() -> u64 {
    30
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = PlatformConfig::from_toml("").unwrap();
        assert_eq!(config.store.write_retries, 3);
        assert_eq!(config.store.retry_backoff_min_ms, 50);
        assert_eq!(config.store.retry_backoff_max_ms, 200);
        assert_eq!(config.api.socket_path, PathBuf::from("/tmp/cocoond.sock"));
        assert_eq!(config.launcher.deploy_timeout_secs, 30);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = PlatformConfig::from_toml(
            r#"
            [store]
            db_path = "/var/lib/cocoond/store.db"

            [api]
            socket_path = "/run/cocoond.sock"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.store.db_path,
            PathBuf::from("/var/lib/cocoond/store.db")
        );
        assert_eq!(config.store.write_retries, 3);
        assert_eq!(config.api.socket_path, PathBuf::from("/run/cocoond.sock"));
    }

    #[test]
    fn zero_retries_is_rejected() {
        let err = PlatformConfig::from_toml("[store]\nwrite_retries = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let err = PlatformConfig::from_toml(
            "[store]\nretry_backoff_min_ms = 300\nretry_backoff_max_ms = 100\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = PlatformConfig::default();
        let toml = config.to_toml().unwrap();
        let back = PlatformConfig::from_toml(&toml).unwrap();
        assert_eq!(back.store.db_path, config.store.db_path);
        assert_eq!(back.launcher.address, config.launcher.address);
    }
}
