//! Push client: a server-sent event stream from the relay with automatic
//! reconnection.
//!
//! The stream is consumed by a background task that owns the only sender of
//! the bounded event channel. `Connected` and `Disconnected` are synthesized
//! locally; everything else comes from `data:` frames shaped like
//!
//! ```json
//! { "type": "agent_status", "agent_status": { ... } }
//! { "type": "new_message", "message": { ... } }
//! { "type": "error", "error": "..." }
//! ```

use asc_core::{AgentStatus, Message, StatusEvent, WorkerName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::error::ClientError;
use crate::http::HttpStatusClient;
use crate::source::StatusSource;

/// Settings for [`PushStatusClient`].
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Path of the event stream endpoint.
    pub events_path: String,
    /// Capacity of the event channel.
    pub buffer: usize,
    /// Bound on connecting and receiving the response headers.
    pub connect_timeout: Duration,
    /// Longest silence tolerated on an open stream. The relay is expected to
    /// send keep-alive comments more often than this.
    pub idle_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            events_path: "/events".to_string(),
            buffer: 100,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(45),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FrameType {
    AgentStatus,
    NewMessage,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    frame_type: FrameType,
    #[serde(default)]
    agent_status: Option<AgentStatus>,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    error: Option<String>,
}

/// Decode one `data:` payload. `Ok(None)` for frames that carry nothing useful.
fn decode_frame(data: &str) -> Result<Option<StatusEvent>, ClientError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    let frame: Frame = serde_json::from_str(data)?;
    let event = match frame.frame_type {
        FrameType::AgentStatus => frame.agent_status.map(StatusEvent::AgentStatusChanged),
        FrameType::NewMessage => frame.message.map(StatusEvent::NewMessage),
        FrameType::Error => Some(StatusEvent::Error(
            frame.error.unwrap_or_else(|| "relay reported an error".to_string()),
        )),
        FrameType::Unknown => None,
    };
    Ok(event)
}

/// Push-capable status source. Pull methods go through an inner [`HttpStatusClient`].
pub struct PushStatusClient {
    pull: HttpStatusClient,
    stream_client: reqwest::Client,
    events_url: String,
    config: PushConfig,
    events_tx: mpsc::Sender<StatusEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<StatusEvent>>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PushStatusClient {
    pub fn new(pull: HttpStatusClient, config: PushConfig) -> Result<Self, ClientError> {
        // No overall timeout: the stream is expected to stay open indefinitely.
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        let events_url = format!("{}{}", pull.base_url(), config.events_path);
        let (events_tx, events_rx) = mpsc::channel(config.buffer.max(1));

        Ok(Self {
            pull,
            stream_client,
            events_url,
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        })
    }

    /// The pull client used for request/response calls.
    pub fn pull(&self) -> &HttpStatusClient {
        &self.pull
    }

    fn stream_loop(&self) -> StreamLoop {
        StreamLoop {
            client: self.stream_client.clone(),
            url: self.events_url.clone(),
            tx: self.events_tx.clone(),
            connected: Arc::clone(&self.connected),
            cancel: self.cancel.clone(),
            connect_timeout: self.config.connect_timeout,
            idle_timeout: self.config.idle_timeout,
            backoff: Backoff::new(self.config.backoff),
        }
    }
}

#[async_trait]
impl StatusSource for PushStatusClient {
    async fn get_agent_status(&self, name: &WorkerName) -> Result<AgentStatus, ClientError> {
        self.pull.get_agent_status(name).await
    }

    async fn get_all_agent_statuses(
        &self,
        offline_threshold: Duration,
    ) -> Result<Vec<AgentStatus>, ClientError> {
        self.pull.get_all_agent_statuses(offline_threshold).await
    }

    async fn get_messages(&self, since: DateTime<Utc>) -> Result<Vec<Message>, ClientError> {
        self.pull.get_messages(since).await
    }

    async fn send_message(&self, message: &Message) -> Result<(), ClientError> {
        self.pull.send_message(message).await
    }

    async fn release_agent_leases(&self, name: &WorkerName) -> Result<(), ClientError> {
        self.pull.release_agent_leases(name).await
    }

    fn supports_push(&self) -> bool {
        true
    }

    fn take_events(&self) -> Option<mpsc::Receiver<StatusEvent>> {
        match self.events_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Make the first connection attempt inline, then keep the stream alive in
    /// the background. A failed first attempt is returned, but the background
    /// loop keeps retrying regardless.
    async fn connect(&self) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }

        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Push client already started");
            return Ok(());
        }

        let stream_loop = self.stream_loop();
        let Some(first) = stream_loop.open_bounded().await else {
            return Err(ClientError::Closed);
        };
        let result = match &first {
            Ok(_) => Ok(()),
            Err(e) => Err(ClientError::Connection(e.to_string())),
        };

        *task = Some(tokio::spawn(stream_loop.run(first)));
        result
    }

    async fn close(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(url = %self.events_url, "Push client closed");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for PushStatusClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by the background receive/reconnect task.
struct StreamLoop {
    client: reqwest::Client,
    url: String,
    tx: mpsc::Sender<StatusEvent>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    connect_timeout: Duration,
    idle_timeout: Duration,
    backoff: Backoff,
}

impl StreamLoop {
    async fn open(&self) -> Result<reqwest::Response, ClientError> {
        debug!(url = %self.url, "Opening event stream");
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// [`Self::open`] under the connect timeout. `None` when cancelled first.
    async fn open_bounded(&self) -> Option<Result<reqwest::Response, ClientError>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            opened = tokio::time::timeout(self.connect_timeout, self.open()) => Some(
                opened.unwrap_or_else(|_| {
                    Err(ClientError::Connection(format!(
                        "no response within {:?}",
                        self.connect_timeout
                    )))
                }),
            ),
        }
    }

    /// Send an event unless the loop is being cancelled. False when nobody is listening.
    async fn emit(&self, event: StatusEvent) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    async fn run(mut self, first: Result<reqwest::Response, ClientError>) {
        let mut pending = match first {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(url = %self.url, error = %e, "Initial event stream connection failed");
                if !self.emit(StatusEvent::Error(e.to_string())).await {
                    return;
                }
                None
            }
        };

        loop {
            let response = match pending.take() {
                Some(response) => response,
                None => {
                    let delay = self.backoff.next_delay();
                    debug!(delay_ms = delay.as_millis() as u64, "Reconnecting event stream");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match self.open_bounded().await {
                        None => break,
                        Some(Ok(response)) => response,
                        Some(Err(e)) => {
                            warn!(url = %self.url, error = %e, "Event stream reconnect failed");
                            if !self.emit(StatusEvent::Error(e.to_string())).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            self.backoff.reset();
            self.connected.store(true, Ordering::SeqCst);
            info!(url = %self.url, "Event stream connected");
            if !self.emit(StatusEvent::Connected).await {
                break;
            }

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = self.read(response) => Some(result),
            };

            self.connected.store(false, Ordering::SeqCst);
            let Some(result) = outcome else {
                break;
            };

            warn!(url = %self.url, "Event stream disconnected");
            if !self.emit(StatusEvent::Disconnected).await {
                break;
            }
            if let Err(e) = result {
                if !self.emit(StatusEvent::Error(e.to_string())).await {
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        debug!(url = %self.url, "Event stream loop stopped");
    }

    /// Forward frames until the stream ends, fails or goes quiet for longer
    /// than the idle timeout.
    async fn read(&self, response: reqwest::Response) -> Result<(), ClientError> {
        let idle = self.idle_timeout;
        let stream = tokio_stream::StreamExt::timeout(response.bytes_stream(), idle)
            .map(move |chunk| match chunk {
                Ok(chunk) => chunk.map_err(|e| ClientError::Connection(e.to_string())),
                Err(_) => Err(ClientError::Connection(format!("no data for {idle:?}"))),
            })
            .eventsource();
        tokio::pin!(stream);

        while let Some(item) = stream.next().await {
            let event = item.map_err(|e| ClientError::Connection(e.to_string()))?;
            match decode_frame(&event.data) {
                Ok(Some(status_event)) => {
                    if !self.emit(status_event).await {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed event frame");
                    if !self.emit(StatusEvent::Error(e.to_string())).await {
                        return Ok(());
                    }
                }
            }
        }

        Err(ClientError::Connection("event stream closed by server".to_string()))
    }
}
