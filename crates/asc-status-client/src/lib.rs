//! Clients for the agent status relay and the task tracker.
//!
//! [`StatusSource`] is the single capability the control plane depends on.
//! [`HttpStatusClient`] implements it with request/response polling,
//! [`PushStatusClient`] adds a server-sent event stream with automatic
//! reconnection on top of the same pull methods.

pub mod backoff;
pub mod error;
pub mod http;
pub mod push;
pub mod source;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{Backoff, BackoffPolicy};
pub use error::ClientError;
pub use http::{HttpClientConfig, HttpStatusClient};
pub use push::{PushConfig, PushStatusClient};
pub use source::StatusSource;
pub use tasks::{BeadsClient, TaskSource};
