//! Client configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TRELLIS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/trellis/config.toml
//!   3. ~/.config/trellis/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Per-listener queue bound. Overflow drops messages, observably.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default peer locator used by connect() when none is given.
    pub host: String,

    /// Default reply deadline in seconds.
    pub timeout_secs: u64,

    /// Open the default realm at startup.
    pub do_connect: bool,

    /// Keep transport headers on returned messages.
    pub debug: bool,

    /// Per-listener reply queue capacity.
    pub queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "trellis://0:0".to_string(),
            timeout_secs: 3,
            do_connect: true,
            debug: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Default reply deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ClientConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TRELLIS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply TRELLIS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRELLIS_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("TRELLIS_TIMEOUT_SECS") {
            if let Ok(t) = v.parse() {
                self.timeout_secs = t;
            }
        }
        if let Ok(v) = std::env::var("TRELLIS_DO_CONNECT") {
            self.do_connect = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TRELLIS_DEBUG") {
            self.debug = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TRELLIS_QUEUE_CAPACITY") {
            if let Ok(c) = v.parse() {
                self.queue_capacity = c;
            }
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("trellis")
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}
