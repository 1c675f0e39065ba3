//! Process supervisor - owns the lifecycle of worker processes.
//!
//! Every child runs in its own process group with stdout and stderr appended
//! to `<logs_dir>/<name>.log`. Stopping signals the whole group: SIGTERM,
//! then SIGKILL if the process is still alive after the grace period.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use asc_core::{LaunchSpec, ProcessRecord, ProcessStatus, WorkerName};

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Worker already running: {name} (pid {pid})")]
    AlreadyRunning { name: WorkerName, pid: u32 },

    /// The OS could not create the process. No record is left behind.
    #[error("Failed to spawn {name} ({program}): {message}")]
    Spawn {
        name: WorkerName,
        program: String,
        message: String,
    },

    #[error("Failed to open log file {path}: {message}")]
    LogFile { path: PathBuf, message: String },

    #[error("No process for worker: {0}")]
    NotFound(WorkerName),

    #[error("Failed to signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },

    /// Some processes could not be stopped. The table is cleared regardless.
    #[error("Failed to stop {} process(es): {}", .failures.len(), .failures.join("; "))]
    StopAll { failures: Vec<String> },
}

/// Process lifecycle operations. The only way process records are created or removed.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Launch a worker and return its pid.
    async fn start(&self, name: &WorkerName, launch: &LaunchSpec) -> Result<u32, SupervisorError>;

    /// Stop a process. Stopping an unknown or already-stopped pid succeeds.
    async fn stop(&self, pid: u32) -> Result<(), SupervisorError>;

    /// Stop every tracked process. Attempts all of them before reporting failures.
    async fn stop_all(&self) -> Result<(), SupervisorError>;

    async fn is_running(&self, pid: u32) -> bool;

    async fn get_status(&self, pid: u32) -> ProcessStatus;

    async fn get_process_info(&self, name: &WorkerName) -> Result<ProcessRecord, SupervisorError>;

    async fn list_processes(&self) -> Vec<ProcessRecord>;

    /// Stop a worker by name. A worker with no record is already stopped.
    async fn stop_worker(&self, name: &WorkerName) -> Result<(), SupervisorError> {
        match self.get_process_info(name).await {
            Ok(record) => self.stop(record.pid).await,
            Err(SupervisorError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct Tracked {
    record: ProcessRecord,
    child: Child,
}

/// [`Supervisor`] backed by real OS processes.
pub struct ProcessSupervisor {
    logs_dir: PathBuf,
    stop_grace: Duration,
    processes: Mutex<HashMap<WorkerName, Tracked>>,
}

impl ProcessSupervisor {
    /// Create a supervisor, creating the logs directory if needed.
    pub fn new(logs_dir: impl Into<PathBuf>, stop_grace: Duration) -> std::io::Result<Self> {
        let logs_dir = logs_dir.into();
        std::fs::create_dir_all(&logs_dir)?;
        Ok(Self {
            logs_dir,
            stop_grace,
            processes: Mutex::new(HashMap::new()),
        })
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Log file path for a worker.
    pub fn log_path(&self, name: &WorkerName) -> PathBuf {
        self.logs_dir.join(format!("{}.log", name))
    }

    fn open_log(&self, path: &Path) -> Result<(Stdio, Stdio), SupervisorError> {
        let log_err = |e: std::io::Error| SupervisorError::LogFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(log_err)?;
        let stderr = file.try_clone().map_err(log_err)?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start(&self, name: &WorkerName, launch: &LaunchSpec) -> Result<u32, SupervisorError> {
        let mut processes = self.processes.lock().await;
        if let Some(existing) = processes.get(name) {
            return Err(SupervisorError::AlreadyRunning {
                name: name.clone(),
                pid: existing.record.pid,
            });
        }

        let log_path = self.log_path(name);
        let (stdout, stderr) = self.open_log(&log_path)?;

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let spawn_err = |message: String| SupervisorError::Spawn {
            name: name.clone(),
            program: launch.program.clone(),
            message,
        };
        let child = cmd.spawn().map_err(|e| spawn_err(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err("process exited before its pid was read".to_string()))?;

        let record = ProcessRecord {
            name: name.clone(),
            pid,
            launch: launch.clone(),
            log_path: log_path.clone(),
            started_at: Utc::now(),
        };
        processes.insert(name.clone(), Tracked { record, child });

        info!(
            worker = %name,
            pid,
            command = %launch.display_command(),
            log = %log_path.display(),
            "Started worker"
        );
        Ok(pid)
    }

    async fn stop(&self, pid: u32) -> Result<(), SupervisorError> {
        let tracked = {
            let mut processes = self.processes.lock().await;
            let name = processes
                .iter()
                .find(|(_, t)| t.record.pid == pid)
                .map(|(name, _)| name.clone());
            name.and_then(|name| processes.remove(&name))
        };

        match tracked {
            Some(tracked) => terminate(tracked, self.stop_grace).await,
            None => {
                debug!(pid, "Stop requested for untracked pid, nothing to do");
                Ok(())
            }
        }
    }

    async fn stop_all(&self) -> Result<(), SupervisorError> {
        let drained: Vec<Tracked> = {
            let mut processes = self.processes.lock().await;
            processes.drain().map(|(_, t)| t).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }
        info!(count = drained.len(), "Stopping all workers");

        let grace = self.stop_grace;
        let results = join_all(drained.into_iter().map(|t| async move {
            let name = t.record.name.clone();
            terminate(t, grace).await.map_err(|e| format!("{name}: {e}"))
        }))
        .await;

        let failures: Vec<String> = results.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::StopAll { failures })
        }
    }

    async fn is_running(&self, pid: u32) -> bool {
        self.get_status(pid).await == ProcessStatus::Running
    }

    async fn get_status(&self, pid: u32) -> ProcessStatus {
        let mut processes = self.processes.lock().await;
        if let Some(tracked) = processes.values_mut().find(|t| t.record.pid == pid) {
            return match tracked.child.try_wait() {
                Ok(None) => ProcessStatus::Running,
                Ok(Some(_)) => ProcessStatus::Stopped,
                Err(_) => ProcessStatus::Unknown,
            };
        }
        drop(processes);
        probe_untracked(pid)
    }

    async fn get_process_info(&self, name: &WorkerName) -> Result<ProcessRecord, SupervisorError> {
        self.processes
            .lock()
            .await
            .get(name)
            .map(|t| t.record.clone())
            .ok_or_else(|| SupervisorError::NotFound(name.clone()))
    }

    async fn list_processes(&self) -> Vec<ProcessRecord> {
        let processes = self.processes.lock().await;
        let mut records: Vec<ProcessRecord> =
            processes.values().map(|t| t.record.clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

/// Graceful then forceful termination of a process group.
async fn terminate(mut tracked: Tracked, grace: Duration) -> Result<(), SupervisorError> {
    let name = tracked.record.name.clone();
    let pid = tracked.record.pid;

    if let Ok(Some(status)) = tracked.child.try_wait() {
        // Leader already gone; clean up anything left in its group.
        let _ = signal_group(pid, Signal::Kill);
        info!(worker = %name, pid, status = %status, "Worker had already exited");
        return Ok(());
    }

    signal_group(pid, Signal::Term)?;

    match tokio::time::timeout(grace, tracked.child.wait()).await {
        Ok(Ok(status)) => {
            let _ = signal_group(pid, Signal::Kill);
            info!(worker = %name, pid, status = %status, "Stopped worker");
            Ok(())
        }
        Ok(Err(e)) => Err(SupervisorError::Signal {
            pid,
            message: e.to_string(),
        }),
        Err(_) => {
            warn!(
                worker = %name,
                pid,
                grace_secs = grace.as_secs_f64(),
                "Worker ignored SIGTERM, sending SIGKILL"
            );
            signal_group(pid, Signal::Kill)?;
            tracked
                .child
                .wait()
                .await
                .map_err(|e| SupervisorError::Signal {
                    pid,
                    message: e.to_string(),
                })?;
            info!(worker = %name, pid, "Killed worker");
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> Result<(), SupervisorError> {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pgid = libc::pid_t::try_from(pid).map_err(|e| SupervisorError::Signal {
        pid,
        message: e.to_string(),
    })?;
    // SAFETY: killpg only sends a signal; the group id came from a child we spawned.
    let rc = unsafe { libc::killpg(pgid, sig) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Group already gone.
        return Ok(());
    }
    Err(SupervisorError::Signal {
        pid,
        message: err.to_string(),
    })
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: Signal) -> Result<(), SupervisorError> {
    debug!(pid, "Process groups unsupported on this platform");
    Ok(())
}

#[cfg(unix)]
fn probe_untracked(pid: u32) -> ProcessStatus {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return ProcessStatus::Unknown;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        // Alive, but not one of ours.
        return ProcessStatus::Unknown;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => ProcessStatus::Stopped,
        _ => ProcessStatus::Unknown,
    }
}

#[cfg(not(unix))]
fn probe_untracked(_pid: u32) -> ProcessStatus {
    ProcessStatus::Unknown
}
