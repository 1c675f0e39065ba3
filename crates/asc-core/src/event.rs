//! Relay messages and the events a status source emits.

use crate::AgentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a relay message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// File or resource lease traffic.
    Lease,
    /// Task tracker updates.
    Beads,
    Error,
    Message,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Lease => "lease",
            Self::Beads => "beads",
            Self::Error => "error",
            Self::Message => "message",
        };
        f.write_str(s)
    }
}

/// A message exchanged between agents through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sender (agent name or service).
    pub source: String,
    pub content: String,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(
        message_type: MessageType,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            message_type,
            source: source.into(),
            content: content.into(),
        }
    }
}

/// Events emitted by a status source and consumed once by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Push connection established.
    Connected,
    /// Push connection lost. All pushed status should be treated as stale.
    Disconnected,
    AgentStatusChanged(AgentStatus),
    NewMessage(Message),
    /// A transport or protocol failure. Never terminates the source.
    Error(String),
}

impl StatusEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::AgentStatusChanged(_) => "agent_status",
            Self::NewMessage(_) => "new_message",
            Self::Error(_) => "error",
        }
    }
}
