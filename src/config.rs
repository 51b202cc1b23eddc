// Configuration File Support
//
// This module provides configuration file parsing for hyperconn.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from the XDG config directory: ~/.config/hyperconn/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hypervisor::sampler::DEFAULT_SAMPLE_INTERVAL;
use crate::hypervisor::DEFAULT_URI;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Host connection and sampling configuration
    pub hypervisor: HypervisorConfig,

    /// Storage pool configuration
    pub storage: StorageConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Host connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Connection URI, e.g. `qemu+ssh://root@node1/system`
    pub uri: String,

    /// CPU sampling period in milliseconds
    pub sample_interval_ms: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL.as_millis() as u64,
        }
    }
}

impl HypervisorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Storage pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory under which new pools are created
    pub default_pool_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_pool_path: "/var/lib/hyperconn/pools".to_string(),
        }
    }
}

impl StorageConfig {
    /// Backing directory for a pool named `name`
    pub fn pool_path(&self, name: &str) -> PathBuf {
        Path::new(&self.default_pool_path).join(name.trim_start_matches('.'))
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/hyperconn/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("org", "hyperconn", "hyperconn") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            // Fallback if XDG dirs cannot be determined
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("hyperconn").join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - HYPERCONN_LOG_LEVEL
    /// - HYPERCONN_LOG_FORMAT
    /// - HYPERCONN_URI
    /// - HYPERCONN_SAMPLE_INTERVAL_MS
    /// - HYPERCONN_POOL_PATH
    pub fn apply_env_overrides<F>(mut self, var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = var("HYPERCONN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("HYPERCONN_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(uri) = var("HYPERCONN_URI") {
            self.hypervisor.uri = uri;
        }
        if let Some(interval) = var("HYPERCONN_SAMPLE_INTERVAL_MS") {
            if let Ok(interval) = interval.parse::<u64>() {
                if interval >= 100 {
                    self.hypervisor.sample_interval_ms = interval;
                }
            }
        }

        if let Some(path) = var("HYPERCONN_POOL_PATH") {
            self.storage.default_pool_path = path;
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.hypervisor.uri.trim().is_empty() {
            anyhow::bail!("Hypervisor URI must not be empty");
        }
        if self.hypervisor.sample_interval_ms < 100 {
            anyhow::bail!("CPU sample interval must be at least 100 ms");
        }

        if self.storage.default_pool_path.is_empty() {
            anyhow::bail!("Default pool path must not be empty");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
