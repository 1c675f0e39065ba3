//! Pull-mode polling.
//!
//! Statuses and messages are pulled only while the status source has no live
//! push connection. Tasks cannot be pushed, so they are pulled on every tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use asc_core::{AgentStatus, Message, Task};
use asc_status_client::{StatusSource, TaskSource};

/// Data pulled by the poller, for the coordinator.
#[derive(Debug, Clone)]
pub enum PollUpdate {
    Statuses(Vec<AgentStatus>),
    Messages(Vec<Message>),
    Tasks(Vec<Task>),
    PullFailed { what: &'static str, error: String },
}

pub struct Poller {
    source: Arc<dyn StatusSource>,
    tasks: Option<Arc<dyn TaskSource>>,
    interval: Duration,
    offline_threshold: Duration,
    resync: Arc<Notify>,
    messages_since: DateTime<Utc>,
}

impl Poller {
    pub fn new(
        source: Arc<dyn StatusSource>,
        tasks: Option<Arc<dyn TaskSource>>,
        interval: Duration,
        offline_threshold: Duration,
    ) -> Self {
        Self {
            source,
            tasks,
            interval,
            offline_threshold,
            resync: Arc::new(Notify::new()),
            messages_since: Utc::now(),
        }
    }

    /// Notify this to request one immediate status pull, regardless of push state.
    pub fn resync_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.resync)
    }

    /// One regular tick. Returns false once the coordinator is gone.
    pub async fn poll_once(&mut self, out: &mpsc::Sender<PollUpdate>) -> bool {
        if !self.source.is_connected() && !self.pull_status(out).await {
            return false;
        }
        self.pull_tasks(out).await
    }

    /// Pull statuses and any messages since the last successful pull.
    pub async fn pull_status(&mut self, out: &mpsc::Sender<PollUpdate>) -> bool {
        let update = match self.source.get_all_agent_statuses(self.offline_threshold).await {
            Ok(statuses) => PollUpdate::Statuses(statuses),
            Err(e) => {
                warn!(error = %e, "Failed to pull agent statuses");
                PollUpdate::PullFailed {
                    what: "statuses",
                    error: e.to_string(),
                }
            }
        };
        if out.send(update).await.is_err() {
            return false;
        }

        let started = Utc::now();
        let update = match self.source.get_messages(self.messages_since).await {
            Ok(messages) => {
                self.messages_since = started;
                if messages.is_empty() {
                    return true;
                }
                PollUpdate::Messages(messages)
            }
            Err(e) => {
                warn!(error = %e, "Failed to pull messages");
                PollUpdate::PullFailed {
                    what: "messages",
                    error: e.to_string(),
                }
            }
        };
        out.send(update).await.is_ok()
    }

    async fn pull_tasks(&self, out: &mpsc::Sender<PollUpdate>) -> bool {
        let Some(tasks) = &self.tasks else {
            return true;
        };
        let update = match tasks.list_tasks().await {
            Ok(tasks) => PollUpdate::Tasks(tasks),
            Err(e) => {
                warn!(error = %e, "Failed to list tasks");
                PollUpdate::PullFailed {
                    what: "tasks",
                    error: e.to_string(),
                }
            }
        };
        out.send(update).await.is_ok()
    }

    /// Poll on the interval, first tick immediately, until cancelled.
    pub async fn run(mut self, out: mpsc::Sender<PollUpdate>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let resync = Arc::clone(&self.resync);

        loop {
            let alive = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.poll_once(&out).await,
                _ = resync.notified() => {
                    debug!("Resynchronising statuses");
                    self.pull_status(&out).await
                }
            };
            if !alive {
                break;
            }
        }
        debug!("Poller stopped");
    }
}
