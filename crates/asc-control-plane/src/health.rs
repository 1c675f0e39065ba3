//! Health monitor.
//!
//! Every tick classifies each declared worker as healthy or as having one
//! [`HealthIssue`]. With auto-recovery on, crashed or unresponsive workers are
//! restarted and stuck workers have their leases released. Findings go to the
//! coordinator as a [`HealthReport`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use asc_core::agent::exceeds;
use asc_core::{
    AgentState, ConfigSnapshot, HealthIssue, HealthIssueKind, RecoveryAction, RecoveryKind,
    WorkerName, WorkerSpec,
};
use asc_status_client::StatusSource;

use crate::config::Config;
use crate::locks::WorkerLocks;
use crate::state::AgentStateModel;
use crate::supervisor::{Supervisor, SupervisorError};

/// Thresholds and timing for the monitor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub offline_threshold: Duration,
    pub stuck_threshold: Duration,
    pub recovery_cooldown: Duration,
    pub max_recovery_backoff: Duration,
    /// Bound on one lease release call to the relay.
    pub lease_release_timeout: Duration,
}

const LEASE_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

impl From<&Config> for HealthConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.health_check_interval(),
            offline_threshold: config.offline_threshold(),
            stuck_threshold: config.stuck_threshold(),
            recovery_cooldown: config.recovery_cooldown(),
            max_recovery_backoff: config.max_recovery_backoff(),
            lease_release_timeout: LEASE_RELEASE_TIMEOUT,
        }
    }
}

/// One tick's findings.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub checked_at: Option<DateTime<Utc>>,
    /// Every open issue, replacing the previous report's.
    pub issues: Vec<HealthIssue>,
    /// States to impose on the model until a newer status arrives.
    pub forced: Vec<(WorkerName, AgentState)>,
    /// Recoveries attempted this tick.
    pub recoveries: Vec<RecoveryAction>,
}

/// A restart that has not yet been confirmed by the worker.
#[derive(Debug, Clone, Copy)]
struct PendingRecovery {
    kind: HealthIssueKind,
    detected_at: DateTime<Utc>,
    restarted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct WorkerHealth {
    /// Task the worker has been working on, and since when.
    task_since: Option<(String, DateTime<Utc>)>,
    last_recovery: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    pending: Option<PendingRecovery>,
}

struct Finding {
    kind: HealthIssueKind,
    pid: Option<u32>,
    description: String,
}

pub struct HealthMonitor {
    config: HealthConfig,
    supervisor: Arc<dyn Supervisor>,
    source: Arc<dyn StatusSource>,
    locks: WorkerLocks,
    desired: watch::Receiver<Arc<ConfigSnapshot>>,
    model: watch::Receiver<Arc<AgentStateModel>>,
    auto_recovery: Arc<AtomicBool>,
    workers: HashMap<WorkerName, WorkerHealth>,
    /// Set by [`HealthMonitor::run`]. Checked between workers and while
    /// waiting on the relay.
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        supervisor: Arc<dyn Supervisor>,
        source: Arc<dyn StatusSource>,
        locks: WorkerLocks,
        desired: watch::Receiver<Arc<ConfigSnapshot>>,
        model: watch::Receiver<Arc<AgentStateModel>>,
        auto_recovery: bool,
    ) -> Self {
        Self {
            config,
            supervisor,
            source,
            locks,
            desired,
            model,
            auto_recovery: Arc::new(AtomicBool::new(auto_recovery)),
            workers: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Shared switch for auto-recovery, readable and writable at runtime.
    pub fn auto_recovery(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.auto_recovery)
    }

    /// Run one check as of `now`.
    pub async fn check(&mut self, now: DateTime<Utc>) -> HealthReport {
        let snapshot = self.desired.borrow().clone();
        let model = self.model.borrow().clone();
        self.workers.retain(|name, _| snapshot.contains(name.as_str()));

        let mut report = HealthReport {
            checked_at: Some(now),
            ..Default::default()
        };
        for spec in snapshot.workers() {
            if self.cancel.is_cancelled() {
                debug!("Health check interrupted by shutdown");
                break;
            }
            let mut tracking = self.workers.remove(&spec.name).unwrap_or_default();
            self.check_worker(spec, &model, &mut tracking, now, &mut report)
                .await;
            self.workers.insert(spec.name.clone(), tracking);
        }

        if report.issues.is_empty() {
            debug!(workers = snapshot.len(), "Health check passed");
        }
        report
    }

    async fn check_worker(
        &self,
        spec: &WorkerSpec,
        model: &AgentStateModel,
        tracking: &mut WorkerHealth,
        now: DateTime<Utc>,
        report: &mut HealthReport,
    ) {
        let name = &spec.name;
        let finding = self.classify(spec, model, tracking, now).await;

        if let Some(pending) = tracking.pending {
            let confirmed = if spec.reports_status() {
                model
                    .reported(name.as_str())
                    .and_then(|s| s.last_seen)
                    .is_some_and(|seen| seen > pending.restarted_at)
            } else {
                finding.is_none()
            };
            let expired = exceeds(now, pending.restarted_at, self.config.offline_threshold);

            if confirmed {
                info!(worker = %name, issue = %pending.kind, "Worker recovered");
                tracking.pending = None;
            } else if finding.is_none() && !expired {
                let mut issue = HealthIssue::new(
                    name.clone(),
                    pending.kind,
                    pending.detected_at,
                    "Restarted, waiting for a fresh status",
                );
                issue.recovery_attempted = true;
                report.issues.push(issue);
                return;
            } else {
                tracking.pending = None;
            }
        }

        let Some(finding) = finding else {
            return;
        };
        let mut issue = HealthIssue::new(name.clone(), finding.kind, now, finding.description);
        warn!(
            worker = %name,
            issue = %issue.kind,
            severity = ?issue.severity,
            description = %issue.description,
            "Health issue detected"
        );

        if let Some(recovery) = finding.kind.recovery() {
            if recovery == RecoveryKind::Restart && spec.reports_status() {
                report.forced.push((name.clone(), AgentState::Offline));
            }
            if !self.auto_recovery.load(Ordering::Relaxed) {
                debug!(worker = %name, "Auto-recovery disabled, reporting only");
            } else if let Some(wait) = self.rate_limited(tracking, now) {
                debug!(
                    worker = %name,
                    retry_in_secs = wait.num_seconds(),
                    "Recovery rate limited"
                );
            } else {
                issue.recovery_attempted = match recovery {
                    RecoveryKind::Restart => {
                        self.recover(name, finding.kind, finding.pid, now, tracking, report)
                            .await
                    }
                    RecoveryKind::ReleaseLeases => {
                        self.release_stuck(name, now, tracking, report).await;
                        true
                    }
                };
            }
        }
        report.issues.push(issue);
    }

    async fn classify(
        &self,
        spec: &WorkerSpec,
        model: &AgentStateModel,
        tracking: &mut WorkerHealth,
        now: DateTime<Utc>,
    ) -> Option<Finding> {
        let record = match self.supervisor.get_process_info(&spec.name).await {
            Ok(record) => record,
            Err(_) => {
                tracking.task_since = None;
                return Some(Finding {
                    kind: HealthIssueKind::Crashed,
                    pid: None,
                    description: "No process running".to_string(),
                });
            }
        };
        if !self.supervisor.is_running(record.pid).await {
            tracking.task_since = None;
            return Some(Finding {
                kind: HealthIssueKind::Crashed,
                pid: Some(record.pid),
                description: format!("Process {} exited", record.pid),
            });
        }

        if !spec.reports_status() {
            return None;
        }
        let status = model.reported(spec.name.as_str())?;

        if let Some(seen) = status.last_seen {
            let threshold = self.config.offline_threshold;
            if exceeds(now, seen, threshold) && exceeds(now, record.started_at, threshold) {
                tracking.task_since = None;
                return Some(Finding {
                    kind: HealthIssueKind::Unresponsive,
                    pid: Some(record.pid),
                    description: format!(
                        "No heartbeat for {}s",
                        (now - seen).num_seconds()
                    ),
                });
            }
        }

        if status.state == AgentState::Error {
            tracking.task_since = None;
            return Some(Finding {
                kind: HealthIssueKind::ExplicitError,
                pid: Some(record.pid),
                description: "Agent reported an error state".to_string(),
            });
        }

        match (status.state, &status.current_task) {
            (AgentState::Working, Some(task)) => {
                let since = match &tracking.task_since {
                    Some((current, since)) if current == task => *since,
                    _ => {
                        tracking.task_since = Some((task.clone(), now));
                        now
                    }
                };
                if exceeds(now, since, self.config.stuck_threshold) {
                    return Some(Finding {
                        kind: HealthIssueKind::Stuck,
                        pid: Some(record.pid),
                        description: format!(
                            "Working on {} for {}m",
                            task,
                            (now - since).num_minutes()
                        ),
                    });
                }
            }
            _ => tracking.task_since = None,
        }
        None
    }

    /// Time left before another recovery is allowed, if any.
    fn rate_limited(&self, tracking: &WorkerHealth, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let last = tracking.last_recovery?;
        let backoff = match tracking.consecutive_failures {
            0 => Duration::ZERO,
            n => Duration::from_secs(1u64 << (n - 1).min(20)).min(self.config.max_recovery_backoff),
        };
        let window = chrono::Duration::from_std(self.config.recovery_cooldown + backoff).ok()?;
        let ready_at = last + window;
        (now < ready_at).then(|| ready_at - now)
    }

    /// Restart a worker under its lock. Returns whether an attempt was made.
    async fn recover(
        &self,
        name: &WorkerName,
        kind: HealthIssueKind,
        classified_pid: Option<u32>,
        now: DateTime<Utc>,
        tracking: &mut WorkerHealth,
        report: &mut HealthReport,
    ) -> bool {
        let _guard = self.locks.lock(name).await;

        // The reconciler may have acted while we waited for the lock.
        let spec = self.desired.borrow().get(name.as_str()).cloned();
        let Some(spec) = spec else {
            debug!(worker = %name, "Worker no longer declared, skipping recovery");
            return false;
        };
        let current = self.supervisor.get_process_info(name).await.ok();
        let current_pid = current.as_ref().map(|r| r.pid);
        if current_pid != classified_pid {
            debug!(worker = %name, "Process changed since the check, skipping recovery");
            return false;
        }

        info!(worker = %name, issue = %kind, "Attempting recovery");

        if spec.reports_status() {
            if let Err(e) = self.release_leases(name).await {
                warn!(worker = %name, error = %e, "Failed to release leases");
            }
        }
        if self.cancel.is_cancelled() {
            debug!(worker = %name, "Shutting down, skipping restart");
            return false;
        }
        if let Some(pid) = current_pid {
            if let Err(e) = self.supervisor.stop(pid).await {
                warn!(worker = %name, pid, error = %e, "Failed to stop worker before restart");
            }
        }

        let result = match self.supervisor.start(name, &spec.launch).await {
            Ok(pid) => {
                info!(worker = %name, pid, "Worker restarted");
                Ok(())
            }
            Err(SupervisorError::AlreadyRunning { pid, .. }) => {
                info!(worker = %name, pid, "Worker already running");
                Ok(())
            }
            Err(e) => {
                error!(worker = %name, error = %e, "Recovery failed");
                Err(e.to_string())
            }
        };

        tracking.last_recovery = Some(now);
        match &result {
            Ok(()) => {
                tracking.consecutive_failures = 0;
                tracking.pending = Some(PendingRecovery {
                    kind,
                    detected_at: now,
                    restarted_at: now,
                });
            }
            Err(_) => {
                tracking.consecutive_failures += 1;
                if spec.reports_status() {
                    report.forced.push((name.clone(), AgentState::Error));
                }
            }
        }

        report.recoveries.push(RecoveryAction {
            worker: name.clone(),
            issue: kind,
            kind: RecoveryKind::Restart,
            timestamp: now,
            success: result.is_ok(),
            error: result.err(),
        });
        true
    }

    /// Free a stuck worker's leases. The process keeps running.
    async fn release_stuck(
        &self,
        name: &WorkerName,
        now: DateTime<Utc>,
        tracking: &mut WorkerHealth,
        report: &mut HealthReport,
    ) {
        info!(worker = %name, "Releasing leases of stuck worker");
        let result = self.release_leases(name).await;
        match &result {
            Ok(()) => info!(worker = %name, "Leases released"),
            Err(e) => warn!(worker = %name, error = %e, "Failed to release leases"),
        }

        tracking.last_recovery = Some(now);
        if result.is_ok() {
            tracking.consecutive_failures = 0;
        } else {
            tracking.consecutive_failures += 1;
        }
        report.recoveries.push(RecoveryAction {
            worker: name.clone(),
            issue: HealthIssueKind::Stuck,
            kind: RecoveryKind::ReleaseLeases,
            timestamp: now,
            success: result.is_ok(),
            error: result.err(),
        });
    }

    /// One lease release, bounded by the configured timeout and by shutdown.
    async fn release_leases(&self, name: &WorkerName) -> Result<(), String> {
        let limit = self.config.lease_release_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err("shutting down".to_string()),
            released = tokio::time::timeout(limit, self.source.release_agent_leases(name)) => {
                match released {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("relay did not answer within {limit:?}")),
                }
            }
        }
    }

    /// Check immediately, then on every interval, until cancelled.
    pub async fn run(mut self, reports: mpsc::Sender<HealthReport>, cancel: CancellationToken) {
        self.cancel = cancel.clone();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.interval.as_secs(),
            auto_recovery = self.auto_recovery.load(Ordering::Relaxed),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.check(Utc::now()).await;
            if cancel.is_cancelled() {
                break;
            }
            if reports.send(report).await.is_err() {
                break;
            }
        }
        debug!("Health monitor stopped");
    }
}
