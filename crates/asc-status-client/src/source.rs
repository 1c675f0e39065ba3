//! The status source capability.

use asc_core::{AgentStatus, Message, StatusEvent, WorkerName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// Remote status and messaging endpoint.
///
/// Pull methods are always available. Push-capable implementations override
/// the event methods; the defaults describe a pull-only source.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Current status of one agent.
    async fn get_agent_status(&self, name: &WorkerName) -> Result<AgentStatus, ClientError>;

    /// Status of every agent that has reported, with entries older than
    /// `offline_threshold` marked `Offline`.
    async fn get_all_agent_statuses(
        &self,
        offline_threshold: Duration,
    ) -> Result<Vec<AgentStatus>, ClientError>;

    /// Messages posted at or after `since`.
    async fn get_messages(&self, since: DateTime<Utc>) -> Result<Vec<Message>, ClientError>;

    async fn send_message(&self, message: &Message) -> Result<(), ClientError>;

    /// Release any resource leases held on behalf of an agent.
    async fn release_agent_leases(&self, name: &WorkerName) -> Result<(), ClientError>;

    /// Whether this source can push events.
    fn supports_push(&self) -> bool {
        false
    }

    /// Take the receiving end of the event stream. Returns `Some` at most once.
    fn take_events(&self) -> Option<mpsc::Receiver<StatusEvent>> {
        None
    }

    /// Open the push connection and start reconnecting in the background.
    async fn connect(&self) -> Result<(), ClientError> {
        Ok(())
    }

    /// Stop the push connection permanently.
    async fn close(&self) {}

    /// Whether the push connection is currently up.
    fn is_connected(&self) -> bool {
        false
    }
}

#[async_trait]
impl<T: StatusSource + ?Sized> StatusSource for Arc<T> {
    async fn get_agent_status(&self, name: &WorkerName) -> Result<AgentStatus, ClientError> {
        (**self).get_agent_status(name).await
    }

    async fn get_all_agent_statuses(
        &self,
        offline_threshold: Duration,
    ) -> Result<Vec<AgentStatus>, ClientError> {
        (**self).get_all_agent_statuses(offline_threshold).await
    }

    async fn get_messages(&self, since: DateTime<Utc>) -> Result<Vec<Message>, ClientError> {
        (**self).get_messages(since).await
    }

    async fn send_message(&self, message: &Message) -> Result<(), ClientError> {
        (**self).send_message(message).await
    }

    async fn release_agent_leases(&self, name: &WorkerName) -> Result<(), ClientError> {
        (**self).release_agent_leases(name).await
    }

    fn supports_push(&self) -> bool {
        (**self).supports_push()
    }

    fn take_events(&self) -> Option<mpsc::Receiver<StatusEvent>> {
        (**self).take_events()
    }

    async fn connect(&self) -> Result<(), ClientError> {
        (**self).connect().await
    }

    async fn close(&self) {
        (**self).close().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
