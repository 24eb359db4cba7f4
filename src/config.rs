//! Node configuration: JSON file, then environment overrides.
//!
//! File keys: `p2p_port`, `enable_upnp`, `max_connections`, `log_level`,
//! `connect_timeout_secs`. Missing keys fall back to defaults; a missing file
//! can be created with the defaults on first run.
//! Env overrides: `P2P_PORT`, `P2P_ENABLE_UPNP`, `P2P_MAX_CONNECTIONS`,
//! `P2P_LOG_LEVEL`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

use crate::network::NetworkConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub p2p_port: u16,
    pub enable_upnp: bool,
    pub max_connections: usize,
    pub log_level: String,
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            p2p_port: 9999,
            enable_upnp: true,
            max_connections: 50,
            log_level: "INFO".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Read `path` if it exists, otherwise start from defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`load`](Self::load), but writes the defaults to `path` when it
    /// does not exist yet
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    /// Write the full configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |source: std::io::Error| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(|e| write_error(e.into()))?;
        std::fs::write(path, contents).map_err(write_error)
    }

    /// Apply `P2P_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`; unparsable values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("P2P_PORT").and_then(|v| v.parse().ok()) {
            self.p2p_port = port;
        }
        if let Some(enabled) = lookup("P2P_ENABLE_UPNP").and_then(|v| parse_bool(&v)) {
            self.enable_upnp = enabled;
        }
        if let Some(max) = lookup("P2P_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.max_connections = max;
        }
        if let Some(level) = lookup("P2P_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Log level, falling back to INFO for unknown names
    pub fn log_level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig::new(self.p2p_port)
            .with_upnp(self.enable_upnp)
            .with_max_connections(self.max_connections)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
