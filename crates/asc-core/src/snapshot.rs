//! Immutable configuration snapshots.

use crate::{ConfigError, WorkerName, WorkerSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default relay URL when none is configured.
pub const DEFAULT_RELAY_URL: &str = "http://localhost:8765";

/// Default location of the beads task database.
pub const DEFAULT_BEADS_DB_PATH: &str = "./project-repo";

/// Stack-wide settings carried alongside the worker set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreSettings {
    /// Working directory for the task tracker.
    pub beads_db_path: PathBuf,

    /// Whether the health monitor may restart workers on its own.
    pub auto_recovery: bool,

    /// Base URL of the message relay.
    pub relay_url: String,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            beads_db_path: PathBuf::from(DEFAULT_BEADS_DB_PATH),
            auto_recovery: true,
            relay_url: DEFAULT_RELAY_URL.to_string(),
        }
    }
}

/// A validated, keyed set of worker specs plus the resolved secret environment.
///
/// A new snapshot is produced per reload. Snapshots are never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    workers: BTreeMap<WorkerName, WorkerSpec>,

    /// Resolved secrets (already merged into each worker's launch env).
    env: BTreeMap<String, String>,

    settings: CoreSettings,
}

impl ConfigSnapshot {
    /// Build a snapshot, rejecting duplicate worker names.
    pub fn new(
        workers: impl IntoIterator<Item = WorkerSpec>,
        env: BTreeMap<String, String>,
        settings: CoreSettings,
    ) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for spec in workers {
            let name = spec.name.clone();
            if map.insert(name.clone(), spec).is_some() {
                return Err(ConfigError::DuplicateWorker(name.into_inner()));
            }
        }
        Ok(Self {
            workers: map,
            env,
            settings,
        })
    }

    /// The snapshot in effect before anything has been applied.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&WorkerSpec> {
        self.workers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// Workers in name order.
    pub fn workers(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.workers.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &WorkerName> {
        self.workers.keys()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }
}
