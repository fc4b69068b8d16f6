//! Persistence configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Storage backend for sessions and retained messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Fjall (local LSM-tree storage)
    #[default]
    Fjall,
    /// Process memory; state is lost on exit
    Memory,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,

    pub backend: BackendType,

    /// Data directory path (for fjall)
    pub path: PathBuf,

    /// Flush interval (e.g., "100ms", "1s")
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Queued writes that force a flush before the interval elapses
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendType::Fjall,
            path: PathBuf::from("./data"),
            flush_interval: Duration::from_millis(100),
            max_batch_size: 100,
        }
    }
}
