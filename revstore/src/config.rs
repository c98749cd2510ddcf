//! Configuration for a [`Datastore`](crate::Datastore)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default capacity of the execution queue's channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of possible ancestors reported per document by revs-diff.
pub const DEFAULT_MAX_POSSIBLE_ANCESTORS: usize = 10;

/// Store configuration
///
/// The config is usually loaded from a TOML file with [`Self::load`]. Missing fields take their
/// default values, which describe an in-memory store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the database file.
    ///
    /// If set to `None` the store is kept in memory.
    pub path: Option<PathBuf>,
    /// How many units of work may wait in the execution queue before submitters have to wait.
    pub queue_capacity: usize,
    /// Upper bound of possible ancestors reported per document by revs-diff.
    pub max_possible_ancestors: usize,
    /// Name of the worker thread that owns the database.
    pub thread_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_possible_ancestors: DEFAULT_MAX_POSSIBLE_ANCESTORS,
            thread_name: "revstore-queue".to_string(),
        }
    }
}

impl StoreConfig {
    /// Config for an in-memory store.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Config for a store persisted at `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<StoreConfig> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: StoreConfig = toml::from_str(&s)
            .with_context(|| format!("failed to parse {}", path.as_ref().to_string_lossy()))?;
        Ok(config)
    }
}
