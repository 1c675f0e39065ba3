//! Control plane errors.

use asc_core::ConfigError;
use asc_status_client::ClientError;
use thiserror::Error;

use crate::supervisor::SupervisorError;

/// Top-level errors. Only startup failures are fatal.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("status client error: {0}")]
    Client(#[from] ClientError),

    /// The control plane could not be brought up.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The control plane has been shut down.
    #[error("control plane is shut down")]
    ShutDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
