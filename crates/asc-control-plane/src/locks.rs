//! Per-worker mutual exclusion between reconciliation and recovery.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use asc_core::WorkerName;

/// One async lock per worker name, created on first use.
///
/// Any start/stop/restart of a worker must hold its guard.
#[derive(Clone, Default)]
pub struct WorkerLocks {
    locks: Arc<Mutex<HashMap<WorkerName, Arc<Mutex<()>>>>>,
}

impl WorkerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `name`.
    pub async fn lock(&self, name: &WorkerName) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(name.clone()).or_default())
        };
        lock.lock_owned().await
    }
}
