use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level repository configuration, usually read from `arbor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArborConfig {
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub timestamp: TimestampConfig,
    #[serde(default)]
    pub locking: LockingConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Who mints persistent ids for new objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdGenerationPolicy {
    /// A repository-wide counter seeded from the store's highest id.
    #[default]
    Repository,
    /// The store hands out ids.
    Store,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub name: String,
    /// Lock keys are qualified by branch when true.
    pub branching: bool,
    /// Refuse detaches that would leave a dangling reference.
    pub ensure_referential_integrity: bool,
    pub id_generation: IdGenerationPolicy,
    /// Accept dirty objects whose base revision is no longer the head.
    /// Only meant for repair tooling.
    pub allow_commit_with_stale_revisions: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: "repo1".into(),
            branching: true,
            ensure_referential_integrity: true,
            id_generation: IdGenerationPolicy::Repository,
            allow_commit_with_stale_revisions: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    /// Serialize commits end-to-end from timestamp issue to finish.
    pub strict_ordering: bool,
    /// Upper bound for the clock spin in `start_commit` (milliseconds).
    pub max_spin_ms: u64,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            strict_ordering: false,
            max_spin_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Timeout for the write locks taken by a commit (milliseconds).
    pub commit_lock_timeout_ms: u64,
    /// Directory for file-backed durable lock areas; in-memory when unset.
    pub lock_area_dir: Option<PathBuf>,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            commit_lock_timeout_ms: 1000,
            lock_area_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Worker threads executing queries.
    pub workers: usize,
    /// Submitted queries waiting for a worker.
    pub queue_capacity: usize,
    /// Buffered result items per query before the producer blocks.
    pub result_capacity: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            result_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Buffered events per listener; overflowing events are dropped for that listener.
    pub channel_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Serve Prometheus metrics on this address. Off when unset.
    pub metrics_listen_addr: Option<String>,
}

impl ArborConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from `path`, falling back to defaults when the file is missing or malformed.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse config {}: {}, using defaults",
                        path.display(),
                        e
                    );
                    ArborConfig::default()
                }
            },
            Err(_) => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                ArborConfig::default()
            }
        }
    }
}
