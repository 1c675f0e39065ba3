//! Agent Stack Controller Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Process spawning
//! - Runtime specifics
//!
//! Everything the supervisor, reconciler, health monitor and status clients
//! exchange is defined here.

pub mod agent;
pub mod error;
pub mod event;
pub mod health;
pub mod ids;
pub mod plan;
pub mod process;
pub mod snapshot;
pub mod status;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use agent::{AgentStatus, Heartbeat};
pub use error::ConfigError;
pub use event::{Message, MessageType, StatusEvent};
pub use health::{
    HealthIssue, HealthIssueKind, RecoveryAction, RecoveryKind, RecoveryStats, Severity,
};
pub use ids::WorkerName;
pub use plan::ReconciliationPlan;
pub use process::ProcessRecord;
pub use snapshot::{ConfigSnapshot, CoreSettings};
pub use status::{AgentState, ProcessStatus};
pub use task::Task;
pub use worker::{LaunchSpec, WorkerKind, WorkerSpec};
