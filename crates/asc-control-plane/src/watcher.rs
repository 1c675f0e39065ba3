//! Config file watcher.
//!
//! Polls a content hash of the watched files, waits for the contents to
//! settle, then reloads. A snapshot that fails to load is reported and
//! dropped; the last-known-good snapshot stays published.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use asc_core::{ConfigError, ConfigSnapshot};

/// Produces a validated snapshot from the current files.
pub type SnapshotLoader = Arc<dyn Fn() -> Result<ConfigSnapshot, ConfigError> + Send + Sync>;

/// Result of a reload attempt.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A new valid snapshot.
    Reloaded(Arc<ConfigSnapshot>),
    /// The files changed but could not be loaded.
    Rejected(ConfigError),
}

pub struct ConfigWatcher {
    paths: Vec<PathBuf>,
    loader: SnapshotLoader,
    poll: Duration,
    debounce: Duration,
    fingerprint: String,
    current: watch::Sender<Arc<ConfigSnapshot>>,
}

impl ConfigWatcher {
    /// Watch `paths`, treating their present contents as already loaded into `initial`.
    pub fn new(
        paths: Vec<PathBuf>,
        loader: SnapshotLoader,
        initial: Arc<ConfigSnapshot>,
        poll: Duration,
        debounce: Duration,
    ) -> Self {
        let (current, _) = watch::channel(initial);
        let mut watcher = Self {
            paths,
            loader,
            poll: poll.max(Duration::from_millis(10)),
            debounce,
            fingerprint: String::new(),
            current,
        };
        watcher.fingerprint = watcher.compute_fingerprint();
        watcher
    }

    /// Last-known-good snapshot.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.current.subscribe()
    }

    /// SHA-256 over the contents of every watched file. Missing files hash as empty.
    fn compute_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for path in &self.paths {
            hasher.update(path.as_os_str().as_encoded_bytes());
            match std::fs::read(path) {
                Ok(contents) => {
                    hasher.update([1u8]);
                    hasher.update(&contents);
                }
                Err(_) => hasher.update([0u8]),
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Load the files now, whether or not they changed.
    pub fn reload(&mut self) -> WatchEvent {
        self.fingerprint = self.compute_fingerprint();
        match (self.loader)() {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                info!(workers = snapshot.len(), "Configuration reloaded");
                self.current.send_replace(Arc::clone(&snapshot));
                WatchEvent::Reloaded(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "Configuration rejected, keeping previous snapshot");
                WatchEvent::Rejected(e)
            }
        }
    }

    /// Reload if the files differ from the last load. No debouncing.
    pub fn check_once(&mut self) -> Option<WatchEvent> {
        if self.compute_fingerprint() == self.fingerprint {
            return None;
        }
        Some(self.reload())
    }

    /// Poll until cancelled, sending one event per settled change.
    pub async fn run(mut self, tx: mpsc::Sender<WatchEvent>, cancel: CancellationToken) {
        debug!(paths = ?self.paths, "Config watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll) => {}
            }

            let mut pending = self.compute_fingerprint();
            if pending == self.fingerprint {
                continue;
            }
            debug!("Config change detected, waiting for it to settle");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.debounce) => {}
                }
                let again = self.compute_fingerprint();
                if again == pending {
                    break;
                }
                pending = again;
            }

            let event = self.reload();
            if tx.send(event).await.is_err() {
                break;
            }
        }
        debug!("Config watcher stopped");
    }
}
