//! The coordinator.
//!
//! [`ControlPlane::start`] applies the initial snapshot, then spawns one task
//! per loop: config watcher, reconciler, health monitor, poller, and the
//! coordinator itself. The coordinator is the only writer of the
//! [`AgentStateModel`]; it drains the push event stream and the mailboxes of
//! the other loops one message at a time and publishes a fresh snapshot after
//! each. [`ControlPlaneHandle`] is the read side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use asc_core::health::summarize;
use asc_core::{
    AgentState, AgentStatus, ConfigError, ConfigSnapshot, HealthIssue, Message, ProcessRecord,
    RecoveryAction, RecoveryStats, StatusEvent, Task, WorkerName,
};
use asc_status_client::{ClientError, StatusSource, TaskSource};

use crate::config::Config;
use crate::error::ControlPlaneError;
use crate::health::{HealthConfig, HealthMonitor, HealthReport};
use crate::locks::WorkerLocks;
use crate::poller::{PollUpdate, Poller};
use crate::reconciler::{ReconcileAction, ReconcileOutcome, ReconcileReport, Reconciler};
use crate::state::{AgentStateModel, Connectivity};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::watcher::{ConfigWatcher, SnapshotLoader, WatchEvent};

/// Everything needed to bring the control plane up.
pub struct ControlPlane {
    config: Config,
    supervisor: Arc<dyn Supervisor>,
    source: Arc<dyn StatusSource>,
    tasks: Option<Arc<dyn TaskSource>>,
}

impl ControlPlane {
    pub fn new(
        config: Config,
        supervisor: Arc<dyn Supervisor>,
        source: Arc<dyn StatusSource>,
        tasks: Option<Arc<dyn TaskSource>>,
    ) -> Self {
        Self {
            config,
            supervisor,
            source,
            tasks,
        }
    }

    /// Start every declared worker and the background loops.
    ///
    /// `loader` re-reads the config files on change; without it (or with
    /// `watch_config` off) the snapshot only changes through
    /// [`ControlPlaneHandle::apply_snapshot`]. Only logs directory creation
    /// can fail here.
    pub async fn start(
        self,
        initial: ConfigSnapshot,
        loader: Option<SnapshotLoader>,
    ) -> Result<ControlPlaneHandle, ControlPlaneError> {
        let config = self.config;
        std::fs::create_dir_all(&config.logs_dir).map_err(|e| {
            ControlPlaneError::Startup(format!(
                "cannot create logs directory {}: {}",
                config.logs_dir.display(),
                e
            ))
        })?;

        let initial = Arc::new(initial);
        let locks = WorkerLocks::new();
        let mut reconciler = Reconciler::new(Arc::clone(&self.supervisor), locks.clone());
        let report = reconciler.apply(Arc::clone(&initial)).await;

        let mut model = AgentStateModel::new(
            config.offline_threshold(),
            config.message_history,
            config.recovery_history,
        );
        let auto_recovery = initial.settings().auto_recovery;
        let (model_tx, model_rx) = watch::channel(Arc::new(model.clone()));

        let health = HealthMonitor::new(
            HealthConfig::from(&config),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.source),
            locks,
            reconciler.desired(),
            model_rx.clone(),
            auto_recovery,
        );
        let auto_recovery_flag = health.auto_recovery();

        let poller = Poller::new(
            Arc::clone(&self.source),
            self.tasks.clone(),
            config.poll_interval(),
            config.offline_threshold(),
        );

        let capacity = config.mailbox_capacity.max(1);
        let (reload_tx, reload_rx) = mpsc::channel(capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel(capacity);
        let (health_tx, health_rx) = mpsc::channel(capacity);
        let (poll_tx, poll_rx) = mpsc::channel(capacity);

        apply_outcome(
            &mut model,
            ReconcileOutcome::Applied {
                snapshot: Arc::clone(&initial),
                report: report.clone(),
            },
        );
        model_tx.send_replace(Arc::new(model.clone()));

        let coordinator = Coordinator {
            model,
            model_tx,
            resync: poller.resync_handle(),
            auto_recovery: Arc::clone(&auto_recovery_flag),
            applied_auto_recovery: auto_recovery,
        };
        let mailboxes = Mailboxes {
            events: self.source.take_events(),
            outcomes: outcome_rx,
            health: health_rx,
            polls: poll_rx,
        };

        let cancel = CancellationToken::new();
        let mut handles = vec![
            tokio::spawn(coordinator.run(mailboxes, cancel.clone())),
            tokio::spawn(reconciler.run(reload_rx, outcome_tx, cancel.clone())),
            tokio::spawn(health.run(health_tx, cancel.clone())),
            tokio::spawn(poller.run(poll_tx, cancel.clone())),
        ];

        match loader {
            Some(loader) if config.watch_config => {
                let watcher = ConfigWatcher::new(
                    vec![config.config_path.clone(), config.env_path.clone()],
                    loader,
                    Arc::clone(&initial),
                    config.watch_poll(),
                    config.debounce(),
                );
                handles.push(tokio::spawn(watcher.run(reload_tx.clone(), cancel.clone())));
                info!(path = %config.config_path.display(), "Watching configuration");
            }
            _ => debug!("Configuration watching disabled"),
        }

        if self.source.supports_push() {
            if let Err(e) = self.source.connect().await {
                warn!(error = %e, "Status stream unavailable, polling until it connects");
            }
        }

        info!(
            workers = initial.len(),
            started = report.started.len(),
            failed = report.failures.len(),
            logs = %config.logs_dir.display(),
            "Control plane started"
        );

        Ok(ControlPlaneHandle {
            model: model_rx,
            supervisor: self.supervisor,
            source: self.source,
            auto_recovery: auto_recovery_flag,
            reloads: reload_tx,
            cancel,
            tasks: Mutex::new(handles),
            shut_down: AtomicBool::new(false),
        })
    }
}

struct Mailboxes {
    events: Option<mpsc::Receiver<StatusEvent>>,
    outcomes: mpsc::Receiver<ReconcileOutcome>,
    health: mpsc::Receiver<HealthReport>,
    polls: mpsc::Receiver<PollUpdate>,
}

/// Single writer of the state model.
struct Coordinator {
    model: AgentStateModel,
    model_tx: watch::Sender<Arc<AgentStateModel>>,
    resync: Arc<Notify>,
    auto_recovery: Arc<AtomicBool>,
    applied_auto_recovery: bool,
}

impl Coordinator {
    async fn run(mut self, mut mailboxes: Mailboxes, cancel: CancellationToken) {
        while self.step(&mut mailboxes, &cancel).await {
            self.model_tx.send_replace(Arc::new(self.model.clone()));
        }
        debug!("Coordinator stopped");
    }

    /// Handle one message. False once cancelled or every mailbox is closed.
    ///
    /// The loops' mailboxes are served before the push stream.
    async fn step(&mut self, mailboxes: &mut Mailboxes, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            Some(outcome) = mailboxes.outcomes.recv() => {
                self.on_outcome(outcome);
                true
            }
            Some(report) = mailboxes.health.recv() => {
                self.on_health(report);
                true
            }
            Some(update) = mailboxes.polls.recv() => {
                self.on_poll(update);
                true
            }
            event = next_event(&mut mailboxes.events) => {
                match event {
                    Some(event) => self.on_event(event),
                    None => {
                        debug!("Status event stream closed");
                        mailboxes.events = None;
                    }
                }
                true
            }
            else => false,
        }
    }

    fn on_event(&mut self, event: StatusEvent) {
        match &event {
            StatusEvent::Connected => {
                info!("Status stream connected");
                self.resync.notify_one();
            }
            StatusEvent::Disconnected => warn!("Status stream lost, polling until it reconnects"),
            StatusEvent::Error(reason) => debug!(error = %reason, "Status stream error"),
            StatusEvent::AgentStatusChanged(status) => {
                debug!(agent = %status.name, state = %status.state, "Agent status changed")
            }
            StatusEvent::NewMessage(_) => {}
        }
        self.model.apply_event(event, Utc::now());
    }

    fn on_outcome(&mut self, outcome: ReconcileOutcome) {
        if let ReconcileOutcome::Applied { snapshot, .. } = &outcome {
            let auto_recovery = snapshot.settings().auto_recovery;
            if auto_recovery != self.applied_auto_recovery {
                info!(auto_recovery, "Auto-recovery setting changed");
                self.auto_recovery.store(auto_recovery, Ordering::Relaxed);
                self.applied_auto_recovery = auto_recovery;
            }
        }
        apply_outcome(&mut self.model, outcome);
    }

    fn on_health(&mut self, report: HealthReport) {
        let at = report.checked_at.unwrap_or_else(Utc::now);
        for (name, state) in &report.forced {
            self.model.force_state(name, *state, at);
        }
        for action in report.recoveries {
            self.model.record_recovery(action);
        }
        self.model.set_issues(report.issues);
    }

    fn on_poll(&mut self, update: PollUpdate) {
        match update {
            PollUpdate::Statuses(statuses) => self.model.apply_pulled_statuses(statuses, Utc::now()),
            PollUpdate::Messages(messages) => {
                for message in messages {
                    self.model.push_message(message);
                }
            }
            PollUpdate::Tasks(tasks) => self.model.set_tasks(tasks),
            PollUpdate::PullFailed { what: "tasks", .. } => {}
            PollUpdate::PullFailed { what, error } => {
                self.model.record_pull_error(format!("{what}: {error}"))
            }
        }
    }
}

fn apply_outcome(model: &mut AgentStateModel, outcome: ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Applied { snapshot, report } => {
            model.set_declared(
                snapshot
                    .workers()
                    .filter(|spec| spec.reports_status())
                    .map(|spec| spec.name.clone()),
            );
            model.set_config_error(None);

            let now = Utc::now();
            for failure in &report.failures {
                let is_agent = snapshot
                    .get(failure.worker.as_str())
                    .is_some_and(|spec| spec.reports_status());
                if is_agent && failure.action != ReconcileAction::Stop {
                    model.force_state(&failure.worker, AgentState::Error, now);
                }
            }
            model.set_last_reconcile(report);
        }
        ReconcileOutcome::Rejected(e) => {
            error!(error = %e, "Configuration reload rejected");
            model.set_config_error(Some(e));
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<StatusEvent>>) -> Option<StatusEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Read API and lifecycle control for a running control plane.
pub struct ControlPlaneHandle {
    model: watch::Receiver<Arc<AgentStateModel>>,
    supervisor: Arc<dyn Supervisor>,
    source: Arc<dyn StatusSource>,
    auto_recovery: Arc<AtomicBool>,
    reloads: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ControlPlaneHandle {
    /// Current consistent view of the model.
    pub fn snapshot(&self) -> Arc<AgentStateModel> {
        self.model.borrow().clone()
    }

    /// Receiver notified after every model change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AgentStateModel>> {
        self.model.clone()
    }

    pub fn get_all_agent_statuses(&self) -> Vec<AgentStatus> {
        self.snapshot().statuses(Utc::now())
    }

    pub fn get_agent_status(&self, name: &str) -> Option<AgentStatus> {
        self.snapshot().status(name, Utc::now())
    }

    pub async fn get_process_info(&self, name: &WorkerName) -> Result<ProcessRecord, SupervisorError> {
        self.supervisor.get_process_info(name).await
    }

    pub async fn list_processes(&self) -> Vec<ProcessRecord> {
        self.supervisor.list_processes().await
    }

    /// Issues found by the most recent health check.
    pub fn diagnose(&self) -> Vec<HealthIssue> {
        self.snapshot().issues().to_vec()
    }

    pub fn is_healthy(&self) -> bool {
        self.snapshot().issues().is_empty()
    }

    /// `"All agents healthy"` or a count of issues by severity.
    pub fn health_summary(&self) -> String {
        summarize(self.snapshot().issues())
    }

    pub fn recovery_history(&self) -> Vec<RecoveryAction> {
        self.snapshot().recovery_history().cloned().collect()
    }

    pub fn recovery_stats(&self, name: &str) -> Option<RecoveryStats> {
        self.snapshot().recovery_stats(name).cloned()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.snapshot().messages().cloned().collect()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.snapshot().tasks().to_vec()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.snapshot().connectivity().clone()
    }

    /// The last rejected reload, if the newest config has not loaded.
    pub fn config_error(&self) -> Option<ConfigError> {
        self.snapshot().config_error().cloned()
    }

    pub fn last_reconcile(&self) -> Option<ReconcileReport> {
        self.snapshot().last_reconcile().cloned()
    }

    pub fn auto_recovery(&self) -> bool {
        self.auto_recovery.load(Ordering::Relaxed)
    }

    pub fn set_auto_recovery(&self, enabled: bool) {
        info!(enabled, "Auto-recovery toggled");
        self.auto_recovery.store(enabled, Ordering::Relaxed);
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), ClientError> {
        self.source.send_message(message).await
    }

    /// Queue a snapshot for reconciliation, as if the config file had changed.
    pub async fn apply_snapshot(&self, snapshot: ConfigSnapshot) -> Result<(), ControlPlaneError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::ShutDown);
        }
        self.reloads
            .send(WatchEvent::Reloaded(Arc::new(snapshot)))
            .await
            .map_err(|_| ControlPlaneError::ShutDown)
    }

    /// Stop every loop, then every worker. Later calls return immediately.
    pub async fn shutdown(&self) -> Result<(), ControlPlaneError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down control plane");

        self.cancel.cancel();
        self.source.close().await;

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.supervisor.stop_all().await?;
        info!("Control plane stopped");
        Ok(())
    }
}

impl Drop for ControlPlaneHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
