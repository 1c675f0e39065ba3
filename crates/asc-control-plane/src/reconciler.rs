//! Applies configuration snapshots to the running process set.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use asc_core::{ConfigError, ConfigSnapshot, ReconciliationPlan, WorkerName, WorkerSpec};

use crate::locks::WorkerLocks;
use crate::supervisor::{Supervisor, SupervisorError};
use crate::watcher::WatchEvent;

/// Kind of process action taken for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        };
        f.write_str(s)
    }
}

/// One action that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileFailure {
    pub worker: WorkerName,
    pub action: ReconcileAction,
    pub error: String,
}

/// What applying a snapshot actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub plan: ReconciliationPlan,
    pub started: Vec<WorkerName>,
    pub stopped: Vec<WorkerName>,
    pub restarted: Vec<WorkerName>,
    /// Workers a start found already running. Treated as success.
    pub already_running: Vec<WorkerName>,
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Sent to the coordinator after each reload.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    Applied {
        snapshot: Arc<ConfigSnapshot>,
        report: ReconcileReport,
    },
    Rejected(ConfigError),
}

pub struct Reconciler {
    supervisor: Arc<dyn Supervisor>,
    locks: WorkerLocks,
    applied: Arc<ConfigSnapshot>,
    desired: watch::Sender<Arc<ConfigSnapshot>>,
}

impl Reconciler {
    /// A reconciler that considers nothing applied yet.
    pub fn new(supervisor: Arc<dyn Supervisor>, locks: WorkerLocks) -> Self {
        let (desired, _) = watch::channel(Arc::new(ConfigSnapshot::empty()));
        Self {
            supervisor,
            locks,
            applied: Arc::new(ConfigSnapshot::empty()),
            desired,
        }
    }

    /// The snapshot the last `apply` diffed against.
    pub fn applied(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.applied)
    }

    /// The snapshot being applied or last applied. Updated before any process action.
    pub fn desired(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.desired.subscribe()
    }

    /// Diff `new` against the applied snapshot and carry out the plan.
    ///
    /// Every action is attempted; failures are collected in the report.
    pub async fn apply(&mut self, new: Arc<ConfigSnapshot>) -> ReconcileReport {
        let plan = ReconciliationPlan::diff(&self.applied, &new);
        let mut report = ReconcileReport {
            plan: plan.clone(),
            ..Default::default()
        };

        self.desired.send_replace(Arc::clone(&new));
        let old = std::mem::replace(&mut self.applied, Arc::clone(&new));

        if plan.is_noop() {
            debug!(unchanged = plan.unchanged.len(), "Configuration unchanged, nothing to do");
            return report;
        }
        info!(
            start = plan.to_start.len(),
            stop = plan.to_stop.len(),
            restart = plan.to_restart.len(),
            unchanged = plan.unchanged.len(),
            "Applying configuration"
        );

        // Agents go down before the services they depend on.
        for spec in services_last(&plan.to_stop, &old) {
            let _guard = self.locks.lock(&spec.name).await;
            match self.supervisor.stop_worker(&spec.name).await {
                Ok(()) => report.stopped.push(spec.name.clone()),
                Err(e) => report.fail(&spec.name, ReconcileAction::Stop, e),
            }
        }

        for spec in services_first(&plan.to_restart, &new) {
            let _guard = self.locks.lock(&spec.name).await;
            if let Err(e) = self.supervisor.stop_worker(&spec.name).await {
                report.fail(&spec.name, ReconcileAction::Restart, e);
                continue;
            }
            match self.supervisor.start(&spec.name, &spec.launch).await {
                Ok(_) => report.restarted.push(spec.name.clone()),
                Err(e) => report.fail(&spec.name, ReconcileAction::Restart, e),
            }
        }

        for spec in services_first(&plan.to_start, &new) {
            let _guard = self.locks.lock(&spec.name).await;
            match self.supervisor.start(&spec.name, &spec.launch).await {
                Ok(_) => report.started.push(spec.name.clone()),
                Err(SupervisorError::AlreadyRunning { .. }) => {
                    report.already_running.push(spec.name.clone())
                }
                Err(e) => report.fail(&spec.name, ReconcileAction::Start, e),
            }
        }

        if report.is_success() {
            info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                restarted = report.restarted.len(),
                "Configuration applied"
            );
        } else {
            warn!(
                failures = report.failures.len(),
                "Configuration applied with failures"
            );
        }
        report
    }

    /// Apply reloads one at a time until cancelled or the watcher goes away.
    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<WatchEvent>,
        outcomes: mpsc::Sender<ReconcileOutcome>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = updates.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let outcome = match event {
                WatchEvent::Reloaded(snapshot) => {
                    let report = self.apply(Arc::clone(&snapshot)).await;
                    ReconcileOutcome::Applied { snapshot, report }
                }
                WatchEvent::Rejected(e) => ReconcileOutcome::Rejected(e),
            };
            if outcomes.send(outcome).await.is_err() {
                break;
            }
        }
        debug!("Reconciler stopped");
    }
}

impl ReconcileReport {
    fn fail(&mut self, worker: &WorkerName, action: ReconcileAction, e: SupervisorError) {
        error!(worker = %worker, action = %action, error = %e, "Reconcile action failed");
        self.failures.push(ReconcileFailure {
            worker: worker.clone(),
            action,
            error: e.to_string(),
        });
    }
}

fn services_first<'a>(names: &[WorkerName], snapshot: &'a ConfigSnapshot) -> Vec<&'a WorkerSpec> {
    let mut specs: Vec<&WorkerSpec> = names.iter().filter_map(|n| snapshot.get(n.as_str())).collect();
    specs.sort_by_key(|s| s.reports_status());
    specs
}

fn services_last<'a>(names: &[WorkerName], snapshot: &'a ConfigSnapshot) -> Vec<&'a WorkerSpec> {
    let mut specs = services_first(names, snapshot);
    specs.reverse();
    specs
}
