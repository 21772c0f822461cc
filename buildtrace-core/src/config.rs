//! Configuration management.

use crate::error::{BuildError, Result};
use crate::paths;
use crate::request::BuilderVersion;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for the build pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Builder used when a request does not choose one
    pub builder: BuilderVersion,
    /// Capacity of the channel feeding the translator task
    pub event_buffer_size: usize,
    pub report_context_upload_progress: bool,
    /// Upper bound on the best-effort remote cancel request
    pub cancel_timeout_secs: u64,
    pub color_output: bool,
    /// Prometheus listener address; metrics export is off when unset
    pub metrics_listen_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            builder: BuilderVersion::Legacy,
            event_buffer_size: 64,
            report_context_upload_progress: true,
            cancel_timeout_secs: 10,
            color_output: false,
            metrics_listen_addr: None,
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::settings_path()
    }

    /// Load configuration from disk.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| BuildError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| BuildError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BuildError::Io { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| BuildError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| BuildError::Io { path: path.to_path_buf(), source: e })
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_buffer_size == 0 {
            return Err(BuildError::InvalidConfig {
                reason: "event_buffer_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }
}
