//! Worker configuration (YAML schema v1)
//!
//! ```yaml
//! version: 1
//! paths:
//!   queue_db: /var/lib/codeintel/queue.db
//!   bulk_db: /var/lib/codeintel/bulk.db
//!   metadata_db: /var/lib/codeintel/metadata.db
//!   blob_dir: /var/lib/codeintel/uploads
//!   repos_dir: /var/lib/codeintel/repos
//! worker:
//!   concurrency: 4
//!   replay_policy: verify_digest
//! queues:
//!   - name: uploads
//!     table: lsif_uploads
//!     max_resets: 3
//! repositories:
//!   - id: 50
//!     name: github.com/sourcegraph/sample
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::writer::ReplayPolicy;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unsupported configuration version {found}. Supported versions: {}", SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32 },

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Schema version (always 1 for v1)
    pub version: u32,

    pub paths: PathsConfig,

    #[serde(default)]
    pub worker: WorkerSettings,

    /// One resetter per entry
    #[serde(default)]
    pub queues: Vec<QueueConfig>,

    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub queue_db: PathBuf,
    pub bulk_db: PathBuf,
    pub metadata_db: PathBuf,
    /// Directory holding `upload-<id>.lsif.zst` artifacts
    pub blob_dir: PathBuf,
    /// Directory holding one git repository per configured repository name
    pub repos_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerSettings {
    /// Table of the queue the workers consume
    pub queue: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub requeue_delay_secs: u64,
    pub replay_policy: ReplayPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue: "lsif_uploads".to_string(),
            concurrency: 4,
            poll_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            requeue_delay_secs: 60,
            replay_policy: ReplayPolicy::default(),
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn requeue_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.requeue_delay_secs as i64)
    }
}

/// Stall recovery for one queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    pub name: String,
    pub table: String,
    #[serde(default = "default_reset_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_stalled_after_secs")]
    pub stalled_after_secs: u64,
    #[serde(default = "default_max_resets")]
    pub max_resets: u32,
    /// Export prometheus counters for this queue
    #[serde(default = "default_true")]
    pub metrics: bool,
}

fn default_reset_interval_secs() -> u64 {
    60
}

fn default_stalled_after_secs() -> u64 {
    30
}

fn default_max_resets() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    pub id: i64,
    pub name: String,
}

impl Config {
    /// Load and validate a YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
            });
        }

        let w = &self.worker;
        if w.concurrency == 0 {
            return Err(ConfigError::invalid("worker.concurrency", "must be at least 1"));
        }
        if w.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("worker.poll_interval_ms", "must be positive"));
        }
        if w.heartbeat_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "worker.heartbeat_interval_ms",
                "must be positive",
            ));
        }
        if !is_identifier(&w.queue) {
            return Err(ConfigError::invalid("worker.queue", "not a valid table name"));
        }

        let mut names = HashSet::new();
        for (i, queue) in self.queues.iter().enumerate() {
            if !names.insert(queue.name.as_str()) {
                return Err(ConfigError::invalid(
                    format!("queues[{}].name", i),
                    format!("duplicate queue name '{}'", queue.name),
                ));
            }
            if !is_identifier(&queue.table) {
                return Err(ConfigError::invalid(
                    format!("queues[{}].table", i),
                    "not a valid table name",
                ));
            }
            if queue.interval_secs == 0 || queue.stalled_after_secs == 0 {
                return Err(ConfigError::invalid(
                    format!("queues[{}]", i),
                    "interval_secs and stalled_after_secs must be positive",
                ));
            }
            // A live worker must heartbeat at least once per stall window
            if queue.stalled_after_secs * 1_000 <= w.heartbeat_interval_ms
                && queue.table == w.queue
            {
                return Err(ConfigError::invalid(
                    format!("queues[{}].stalled_after_secs", i),
                    "must exceed worker.heartbeat_interval_ms",
                ));
            }
        }

        let mut ids = HashSet::new();
        for repo in &self.repositories {
            if !ids.insert(repo.id) {
                return Err(ConfigError::invalid(
                    "repositories",
                    format!("duplicate repository id {}", repo.id),
                ));
            }
        }

        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
