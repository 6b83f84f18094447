//! Configuration management.
//!
//! Values come from an optional file and from environment variables prefixed
//! with `WMSNOTES`, nested with `__` (e.g. `WMSNOTES_SYNC__INTERVAL=10s`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{NotesError, Result};
use crate::sync::{ConflictPolicy, TailPolicy};
use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Local replica storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Command processing
    #[serde(default)]
    pub commands: CommandsConfig,

    /// Synchronization with a remote replica
    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Where events are stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    Memory,
    #[default]
    File,
}

/// Where aggregate snapshots are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotBackend {
    None,
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root directory of the replica
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub log: LogBackend,

    #[serde(default)]
    pub snapshots: SnapshotBackend,

    /// Write a snapshot after replaying this many events (0 disables)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log: LogBackend::default(),
            snapshots: SnapshotBackend::default(),
            snapshot_interval: default_snapshot_interval(),
        }
    }
}

impl StorageConfig {
    /// Storage for a file-backed replica rooted at `data_dir`, other settings unchanged.
    pub fn at(&self, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            log: LogBackend::File,
            ..self.clone()
        }
    }

    pub fn events_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandsConfig {
    /// Number of per-aggregate lock stripes
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,

    /// Queue size of the command bus
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// How long `execute_and_wait` waits for a result
    #[serde(default = "default_result_timeout", with = "humantime_serde")]
    pub result_timeout: Duration,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            lock_stripes: default_lock_stripes(),
            bus_capacity: default_bus_capacity(),
            result_timeout: default_result_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Root directory of the remote replica; synchronization is off without one
    #[serde(default)]
    pub remote_dir: Option<PathBuf>,

    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default)]
    pub tail_policy: TailPolicy,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Appended to the title of a note kept under the `keep_both` conflict policy
    #[serde(default = "default_conflict_title_suffix")]
    pub conflict_title_suffix: String,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Synchronizer bookkeeping; defaults to `<data_dir>/sync-state.json`
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_dir: None,
            interval: default_sync_interval(),
            tail_policy: TailPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
            conflict_title_suffix: default_conflict_title_suffix(),
            max_concurrency: default_max_concurrency(),
            state_file: None,
        }
    }
}

impl SyncConfig {
    pub fn state_file_in(&self, data_dir: &std::path::Path) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| data_dir.join("sync-state.json"))
    }
}

// Default value functions
fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_snapshot_interval() -> u64 { crate::repository::DEFAULT_SNAPSHOT_INTERVAL }
fn default_lock_stripes() -> usize { crate::command::processor::DEFAULT_LOCK_STRIPES }
fn default_bus_capacity() -> usize { crate::command::bus::DEFAULT_BUS_CAPACITY }
fn default_result_timeout() -> Duration { crate::command::bus::DEFAULT_RESULT_TIMEOUT }
fn default_sync_interval() -> Duration { crate::sync::DEFAULT_SYNC_INTERVAL }
fn default_max_concurrency() -> usize { crate::sync::DEFAULT_MAX_CONCURRENCY }
fn default_conflict_title_suffix() -> String { crate::sync::DEFAULT_CONFLICT_TITLE_SUFFIX.to_string() }

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("WMSNOTES").separator("__"))
            .build()?;

        Self::validated(config.try_deserialize()?)
    }

    /// Load from a specific file path, overridden by the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("WMSNOTES").separator("__"))
            .build()?;

        Self::validated(config.try_deserialize()?)
    }

    fn validated(config: Self) -> Result<Self> {
        if config.commands.lock_stripes == 0 {
            return Err(NotesError::configuration("commands.lock_stripes must be at least 1"));
        }
        if config.commands.bus_capacity == 0 {
            return Err(NotesError::configuration("commands.bus_capacity must be at least 1"));
        }
        if config.sync.max_concurrency == 0 {
            return Err(NotesError::configuration("sync.max_concurrency must be at least 1"));
        }
        if config.sync.remote_dir.as_deref() == Some(config.storage.data_dir.as_path()) {
            return Err(NotesError::configuration(
                "sync.remote_dir must differ from storage.data_dir",
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.log, LogBackend::File);
        assert_eq!(config.storage.snapshot_interval, 20);
        assert_eq!(config.sync.interval, Duration::from_secs(5));
        assert_eq!(config.sync.tail_policy, TailPolicy::Keep);
        assert!(config.sync.remote_dir.is_none());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[storage]
data_dir = "/tmp/notes"
snapshots = "memory"

[sync]
remote_dir = "/tmp/remote"
interval = "1m"
tail_policy = "rewrite"
conflict_policy = "keep_both"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.storage.snapshots, SnapshotBackend::Memory);
        assert_eq!(config.sync.interval, Duration::from_secs(60));
        assert_eq!(config.sync.tail_policy, TailPolicy::Rewrite);
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::KeepBoth);
        assert_eq!(config.sync.conflict_title_suffix, " (conflict)");
        assert_eq!(config.commands.lock_stripes, 64);
        assert_eq!(
            config.sync.state_file_in(&config.storage.data_dir),
            PathBuf::from("/tmp/notes/sync-state.json")
        );
    }

    #[test]
    fn test_remote_must_differ_from_local() {
        let mut config = Config::default();
        config.sync.remote_dir = Some(config.storage.data_dir.clone());
        assert!(Config::validated(config).is_err());
    }
}
