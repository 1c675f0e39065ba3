//! Agent status and heartbeat types exchanged with the status relay.

use crate::{AgentState, WorkerName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Externally visible runtime status of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub name: WorkerName,

    pub state: AgentState,

    /// Task the agent is working on, if any.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_task: Option<String>,

    /// When the agent was last heard from. `None` if never.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl AgentStatus {
    pub fn new(name: impl Into<WorkerName>, state: AgentState) -> Self {
        Self {
            name: name.into(),
            state,
            current_task: None,
            last_seen: None,
        }
    }

    /// Status for an agent that has never been heard from.
    pub fn offline(name: impl Into<WorkerName>) -> Self {
        Self::new(name, AgentState::Offline)
    }

    /// Builder method to set the current task.
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.current_task = Some(task.into());
        self
    }

    /// Builder method to set the last-seen timestamp.
    pub fn seen_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_seen = Some(at);
        self
    }

    /// True if `now - last_seen` exceeds `threshold`, or the agent was never seen.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.last_seen {
            Some(seen) => exceeds(now, seen, threshold),
            None => true,
        }
    }
}

/// A liveness report from an agent, as served by `GET /heartbeats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_name: WorkerName,

    pub state: AgentState,

    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_task: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    /// Convert to a status, forcing `Offline` when older than `offline_threshold`.
    pub fn to_status(&self, now: DateTime<Utc>, offline_threshold: Duration) -> AgentStatus {
        let state = if exceeds(now, self.timestamp, offline_threshold) {
            AgentState::Offline
        } else {
            self.state
        };
        AgentStatus {
            name: self.agent_name.clone(),
            state,
            current_task: self.current_task.clone(),
            last_seen: Some(self.timestamp),
        }
    }
}

/// `now - then > threshold`. Timestamps in the future never exceed.
pub fn exceeds(now: DateTime<Utc>, then: DateTime<Utc>, threshold: Duration) -> bool {
    match (now - then).to_std() {
        Ok(elapsed) => elapsed > threshold,
        Err(_) => false,
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}
