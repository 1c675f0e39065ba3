//! Agent Stack Control Plane Library
//!
//! Supervises the agent processes declared in `asc.toml`, reapplies the file
//! when it changes, watches agent health through the status relay, and keeps
//! a single consistent view of every agent for readers.

pub mod config;
pub mod control_plane;
pub mod error;
pub mod health;
pub mod loader;
pub mod locks;
pub mod poller;
pub mod reconciler;
pub mod state;
pub mod supervisor;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, ControlPlaneOverrides};
pub use control_plane::{ControlPlane, ControlPlaneHandle};
pub use error::ControlPlaneError;
pub use health::{HealthConfig, HealthMonitor, HealthReport};
pub use locks::WorkerLocks;
pub use poller::{PollUpdate, Poller};
pub use reconciler::{ReconcileOutcome, ReconcileReport, Reconciler};
pub use state::{AgentStateModel, Connectivity};
pub use supervisor::{ProcessSupervisor, Supervisor, SupervisorError};
pub use watcher::{ConfigWatcher, SnapshotLoader, WatchEvent};
