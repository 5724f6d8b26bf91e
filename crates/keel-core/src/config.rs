//! keel.toml configuration parser.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::AppKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    /// Parent kinds to run a controller for.
    pub kinds: Vec<AppKind>,
    pub store: StoreConfig,
    pub controller: ControllerConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the keyspace and checkpoint databases.
    pub data_dir: PathBuf,
    /// Revisions of history kept by periodic compaction.
    pub retain_revisions: u64,
    /// Seconds between compaction runs. Zero disables compaction.
    pub compact_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Concurrent reconcile passes per kind.
    pub workers: usize,
    /// Compare-and-swap attempts before giving up on a child write.
    pub max_conflict_attempts: u32,
    /// Seconds the garbage collector waits for cascading deletes.
    pub gc_grace_secs: u64,
    /// Initial delay before restarting a failed watch or pass.
    pub restart_backoff_ms: u64,
    /// Upper bound for the restart delay.
    pub max_restart_backoff_ms: u64,
    /// Maximum events drained into one reconcile batch.
    pub batch_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            kinds: AppKind::ALL.to_vec(),
            store: StoreConfig::default(),
            controller: ControllerConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/keel"),
            retain_revisions: 10_000,
            compact_interval_secs: 300,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_conflict_attempts: 3,
            gc_grace_secs: 30,
            restart_backoff_ms: 500,
            max_restart_backoff_ms: 30_000,
            batch_limit: 256,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8480 }
    }
}

impl ControllerConfig {
    pub fn gc_grace(&self) -> Duration {
        Duration::from_secs(self.gc_grace_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn max_restart_backoff(&self) -> Duration {
        Duration::from_millis(self.max_restart_backoff_ms)
    }
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: KeelConfig = toml::from_str(content)?;
        if config.controller.workers == 0 {
            anyhow::bail!("controller.workers must be at least 1");
        }
        if config.controller.max_conflict_attempts == 0 {
            anyhow::bail!("controller.max_conflict_attempts must be at least 1");
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
