//! Error types for the status and task clients.

use thiserror::Error;

/// Errors that can occur when talking to the relay or the task tracker.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to establish or keep a connection.
    #[error("connection failed: {0}")]
    Connection(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The client was closed and will not reconnect.
    #[error("client closed")]
    Closed,

    /// External command failed.
    #[error("command failed: {0}")]
    Command(String),
}

impl ClientError {
    /// 4xx responses. Retrying these will not help.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Status { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
