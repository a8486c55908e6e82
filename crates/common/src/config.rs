//! Dispatcher configuration
//!
//! Loaded from a TOML file; every field has a default so a missing file or
//! a partial file is usable. CLI flags may override individual values after
//! loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_server() -> String {
    "localhost:5222".to_string()
}

fn default_database() -> PathBuf {
    PathBuf::from("pushd.db")
}

fn default_poll_interval() -> u64 {
    10
}

fn default_ping_timeout() -> i64 {
    20
}

fn default_reconnect_backoff() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Messaging server address (host:port).
    #[serde(default = "default_server")]
    pub server: String,

    /// Path to the client/action store.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Baseline poll interval in seconds between notification passes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Cap on concurrently busy servers before new notifications are
    /// throttled. Absent means unlimited.
    #[serde(default)]
    pub notify_threshold: Option<u32>,

    /// Seconds a pinged client has to answer before it is reaped.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: i64,

    /// Seconds to sleep before reconnecting after a transport failure.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            database: default_database(),
            poll_interval: default_poll_interval(),
            notify_threshold: None,
            ping_timeout: default_ping_timeout(),
            reconnect_backoff: default_reconnect_backoff(),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from `path`, or return defaults when no path is
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()))?;
        Ok(config)
    }
}
