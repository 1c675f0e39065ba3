//! Runtime records of supervised processes.

use crate::{LaunchSpec, WorkerName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A running worker as tracked by the supervisor.
///
/// At most one record exists per worker name at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub name: WorkerName,

    /// OS process id. Also the process group id.
    pub pid: u32,

    /// The invocation actually used.
    pub launch: LaunchSpec,

    /// Where stdout and stderr are written.
    pub log_path: PathBuf,

    pub started_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// Time since the process was started.
    pub fn uptime(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }
}
