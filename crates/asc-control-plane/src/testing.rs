//! Test doubles for the supervisor, status source and task source.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use asc_core::{
    AgentStatus, LaunchSpec, Message, ProcessRecord, ProcessStatus, StatusEvent, Task, WorkerName,
};
use asc_status_client::{ClientError, StatusSource, TaskSource};

use crate::supervisor::{Supervisor, SupervisorError};

/// A supervisor call, as seen by [`RecordingSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Start(WorkerName),
    Stop(WorkerName),
    StopAll,
}

struct FakeProcess {
    record: ProcessRecord,
    running: bool,
}

#[derive(Default)]
struct Inner {
    next_pid: u32,
    processes: BTreeMap<WorkerName, FakeProcess>,
    calls: Vec<Call>,
    failing: HashSet<WorkerName>,
}

/// In-memory supervisor that records every mutating call.
pub(crate) struct RecordingSupervisor {
    inner: Mutex<Inner>,
}

impl RecordingSupervisor {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_pid: 1000,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub(crate) fn starts(&self) -> Vec<WorkerName> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Start(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn stops(&self) -> Vec<WorkerName> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Stop(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Make every following start of `name` fail to spawn.
    pub(crate) fn fail_spawn(&self, name: &str) {
        self.inner.lock().unwrap().failing.insert(WorkerName::new(name));
    }

    pub(crate) fn allow_spawn(&self, name: &str) {
        self.inner.lock().unwrap().failing.remove(name);
    }

    /// Simulate the process exiting on its own. The record stays.
    pub(crate) fn crash(&self, name: &str) {
        if let Some(p) = self.inner.lock().unwrap().processes.get_mut(name) {
            p.running = false;
        }
    }

    pub(crate) fn pid_of(&self, name: &str) -> Option<u32> {
        self.inner
            .lock()
            .unwrap()
            .processes
            .get(name)
            .map(|p| p.record.pid)
    }

    pub(crate) fn running_names(&self) -> Vec<WorkerName> {
        self.inner
            .lock()
            .unwrap()
            .processes
            .values()
            .filter(|p| p.running)
            .map(|p| p.record.name.clone())
            .collect()
    }
}

#[async_trait]
impl Supervisor for RecordingSupervisor {
    async fn start(&self, name: &WorkerName, launch: &LaunchSpec) -> Result<u32, SupervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Start(name.clone()));
        if let Some(existing) = inner.processes.get(name) {
            return Err(SupervisorError::AlreadyRunning {
                name: name.clone(),
                pid: existing.record.pid,
            });
        }
        if inner.failing.contains(name) {
            return Err(SupervisorError::Spawn {
                name: name.clone(),
                program: launch.program.clone(),
                message: "No such file or directory".into(),
            });
        }
        inner.next_pid += 1;
        let pid = inner.next_pid;
        let record = ProcessRecord {
            name: name.clone(),
            pid,
            launch: launch.clone(),
            log_path: format!("/tmp/{name}.log").into(),
            started_at: Utc::now(),
        };
        inner
            .processes
            .insert(name.clone(), FakeProcess { record, running: true });
        Ok(pid)
    }

    async fn stop(&self, pid: u32) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().unwrap();
        let name = inner
            .processes
            .values()
            .find(|p| p.record.pid == pid)
            .map(|p| p.record.name.clone());
        if let Some(name) = name {
            inner.processes.remove(&name);
            inner.calls.push(Call::Stop(name));
        }
        Ok(())
    }

    async fn stop_all(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::StopAll);
        inner.processes.clear();
        Ok(())
    }

    async fn is_running(&self, pid: u32) -> bool {
        self.get_status(pid).await == ProcessStatus::Running
    }

    async fn get_status(&self, pid: u32) -> ProcessStatus {
        let inner = self.inner.lock().unwrap();
        match inner.processes.values().find(|p| p.record.pid == pid) {
            Some(p) if p.running => ProcessStatus::Running,
            Some(_) => ProcessStatus::Stopped,
            None => ProcessStatus::Unknown,
        }
    }

    async fn get_process_info(&self, name: &WorkerName) -> Result<ProcessRecord, SupervisorError> {
        self.inner
            .lock()
            .unwrap()
            .processes
            .get(name)
            .map(|p| p.record.clone())
            .ok_or_else(|| SupervisorError::NotFound(name.clone()))
    }

    async fn list_processes(&self) -> Vec<ProcessRecord> {
        self.inner
            .lock()
            .unwrap()
            .processes
            .values()
            .map(|p| p.record.clone())
            .collect()
    }
}

/// Scriptable status source with call counters.
pub(crate) struct FakeStatusSource {
    push: bool,
    connected: AtomicBool,
    fail_pulls: AtomicBool,
    hang_releases: AtomicBool,
    events_tx: mpsc::Sender<StatusEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<StatusEvent>>>,
    statuses: Mutex<Vec<AgentStatus>>,
    messages: Mutex<Vec<Message>>,
    sent: Mutex<Vec<Message>>,
    released: Mutex<Vec<WorkerName>>,
    status_pulls: AtomicUsize,
    message_pulls: AtomicUsize,
}

impl FakeStatusSource {
    pub(crate) fn push() -> Self {
        Self::new(true)
    }

    pub(crate) fn pull_only() -> Self {
        Self::new(false)
    }

    fn new(push: bool) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            push,
            connected: AtomicBool::new(false),
            fail_pulls: AtomicBool::new(false),
            hang_releases: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            statuses: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            status_pulls: AtomicUsize::new(0),
            message_pulls: AtomicUsize::new(0),
        }
    }

    /// Push an event as the stream would.
    pub(crate) async fn emit(&self, event: StatusEvent) {
        match event {
            StatusEvent::Connected => self.connected.store(true, Ordering::SeqCst),
            StatusEvent::Disconnected => self.connected.store(false, Ordering::SeqCst),
            _ => {}
        }
        let _ = self.events_tx.send(event).await;
    }

    pub(crate) fn set_statuses(&self, statuses: Vec<AgentStatus>) {
        *self.statuses.lock().unwrap() = statuses;
    }

    pub(crate) fn add_message(&self, message: Message) {
        self.messages.lock().unwrap().push(message);
    }

    pub(crate) fn fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn status_pulls(&self) -> usize {
        self.status_pulls.load(Ordering::SeqCst)
    }

    pub(crate) fn message_pulls(&self) -> usize {
        self.message_pulls.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> Vec<WorkerName> {
        self.released.lock().unwrap().clone()
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// Make lease releases record the call and then never answer.
    pub(crate) fn hang_releases(&self) {
        self.hang_releases.store(true, Ordering::SeqCst);
    }

    fn check_pull(&self) -> Result<(), ClientError> {
        if self.fail_pulls.load(Ordering::SeqCst) {
            Err(ClientError::Connection("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StatusSource for FakeStatusSource {
    async fn get_agent_status(&self, name: &WorkerName) -> Result<AgentStatus, ClientError> {
        self.check_pull()?;
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .find(|s| &s.name == name)
            .cloned()
            .unwrap_or_else(|| AgentStatus::offline(name.clone())))
    }

    async fn get_all_agent_statuses(
        &self,
        offline_threshold: Duration,
    ) -> Result<Vec<AgentStatus>, ClientError> {
        self.status_pulls.fetch_add(1, Ordering::SeqCst);
        self.check_pull()?;
        let now = Utc::now();
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(|mut s| {
                if s.is_stale(now, offline_threshold) {
                    s.state = asc_core::AgentState::Offline;
                }
                s
            })
            .collect())
    }

    async fn get_messages(&self, since: DateTime<Utc>) -> Result<Vec<Message>, ClientError> {
        self.message_pulls.fetch_add(1, Ordering::SeqCst);
        self.check_pull()?;
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn send_message(&self, message: &Message) -> Result<(), ClientError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn release_agent_leases(&self, name: &WorkerName) -> Result<(), ClientError> {
        self.released.lock().unwrap().push(name.clone());
        if self.hang_releases.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn supports_push(&self) -> bool {
        self.push
    }

    fn take_events(&self) -> Option<mpsc::Receiver<StatusEvent>> {
        if !self.push {
            return None;
        }
        self.events_rx.lock().unwrap().take()
    }

    async fn connect(&self) -> Result<(), ClientError> {
        if self.push {
            self.emit(StatusEvent::Connected).await;
        }
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Task source returning a fixed list.
#[derive(Default)]
pub(crate) struct FakeTaskSource {
    tasks: Mutex<Vec<Task>>,
    calls: AtomicUsize,
}

impl FakeTaskSource {
    pub(crate) fn set_tasks(&self, tasks: Vec<Task>) {
        *self.tasks.lock().unwrap() = tasks;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskSource for FakeTaskSource {
    async fn list_tasks(&self) -> Result<Vec<Task>, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tasks.lock().unwrap().clone())
    }
}
