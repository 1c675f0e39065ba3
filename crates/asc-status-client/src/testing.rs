//! In-process fake relay used by the client tests.

use asc_core::{AgentState, AgentStatus, Heartbeat, Message};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

#[derive(Default)]
struct RelayData {
    heartbeats: Vec<Heartbeat>,
    statuses: HashMap<String, AgentStatus>,
    messages: Vec<Message>,
    released: Vec<String>,
}

struct Inner {
    data: Mutex<RelayData>,
    /// `None` closes every open stream.
    frames: broadcast::Sender<Option<String>>,
    events_available: AtomicBool,
    fail_heartbeats: AtomicUsize,
    heartbeat_requests: AtomicUsize,
    status_requests: AtomicUsize,
    stream_attempts: AtomicUsize,
    stream_connections: AtomicUsize,
}

#[derive(Clone)]
pub(crate) struct FakeRelay {
    inner: Arc<Inner>,
}

#[derive(Deserialize)]
struct SinceQuery {
    since: Option<i64>,
}

impl FakeRelay {
    pub(crate) fn new() -> Self {
        let (frames, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(RelayData::default()),
                frames,
                events_available: AtomicBool::new(true),
                fail_heartbeats: AtomicUsize::new(0),
                heartbeat_requests: AtomicUsize::new(0),
                status_requests: AtomicUsize::new(0),
                stream_attempts: AtomicUsize::new(0),
                stream_connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Serve on an ephemeral port and return the base URL.
    pub(crate) async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/heartbeats", get(heartbeats))
            .route("/agents/:name/status", get(agent_status))
            .route("/agents/:name/leases/release", post(release))
            .route("/messages", get(list_messages).post(post_message))
            .route("/events", get(events))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub(crate) fn add_heartbeat(&self, name: &str, state: AgentState, age_secs: i64) {
        self.inner.data.lock().unwrap().heartbeats.push(Heartbeat {
            agent_name: name.into(),
            state,
            current_task: None,
            timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
        });
    }

    pub(crate) fn fail_next_heartbeats(&self, n: usize) {
        self.inner.fail_heartbeats.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_events_available(&self, available: bool) {
        self.inner.events_available.store(available, Ordering::SeqCst);
    }

    pub(crate) fn push_status(&self, status: AgentStatus) {
        let frame = serde_json::json!({ "type": "agent_status", "agent_status": status });
        let _ = self.inner.frames.send(Some(frame.to_string()));
    }

    pub(crate) fn push_message(&self, message: Message) {
        let frame = serde_json::json!({ "type": "new_message", "message": message });
        let _ = self.inner.frames.send(Some(frame.to_string()));
    }

    /// End every open event stream from the server side.
    pub(crate) fn drop_streams(&self) {
        let _ = self.inner.frames.send(None);
    }

    pub(crate) fn released(&self) -> Vec<String> {
        self.inner.data.lock().unwrap().released.clone()
    }

    pub(crate) fn heartbeat_requests(&self) -> usize {
        self.inner.heartbeat_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn status_requests(&self) -> usize {
        self.inner.status_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_attempts(&self) -> usize {
        self.inner.stream_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_connections(&self) -> usize {
        self.inner.stream_connections.load(Ordering::SeqCst)
    }
}

async fn heartbeats(State(relay): State<FakeRelay>) -> Result<Json<Vec<Heartbeat>>, StatusCode> {
    relay.inner.heartbeat_requests.fetch_add(1, Ordering::SeqCst);
    let failing = relay
        .inner
        .fail_heartbeats
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(relay.inner.data.lock().unwrap().heartbeats.clone()))
}

async fn agent_status(
    State(relay): State<FakeRelay>,
    Path(name): Path<String>,
) -> Result<Json<AgentStatus>, StatusCode> {
    relay.inner.status_requests.fetch_add(1, Ordering::SeqCst);
    relay
        .inner
        .data
        .lock()
        .unwrap()
        .statuses
        .get(&name)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn release(State(relay): State<FakeRelay>, Path(name): Path<String>) -> StatusCode {
    relay.inner.data.lock().unwrap().released.push(name);
    StatusCode::OK
}

async fn list_messages(
    State(relay): State<FakeRelay>,
    Query(query): Query<SinceQuery>,
) -> Json<Vec<Message>> {
    let since = query.since.unwrap_or(0);
    let data = relay.inner.data.lock().unwrap();
    Json(
        data.messages
            .iter()
            .filter(|m| m.timestamp.timestamp() >= since)
            .cloned()
            .collect(),
    )
}

async fn post_message(State(relay): State<FakeRelay>, Json(message): Json<Message>) -> StatusCode {
    relay.inner.data.lock().unwrap().messages.push(message);
    StatusCode::CREATED
}

async fn events(State(relay): State<FakeRelay>) -> Result<impl IntoResponse, StatusCode> {
    relay.inner.stream_attempts.fetch_add(1, Ordering::SeqCst);
    if !relay.inner.events_available.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    relay.inner.stream_connections.fetch_add(1, Ordering::SeqCst);

    let stream = BroadcastStream::new(relay.inner.frames.subscribe())
        .take_while(|frame| matches!(frame, Ok(Some(_))))
        .filter_map(|frame| frame.ok().flatten())
        .map(|data| Ok::<_, Infallible>(Event::default().data(data)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_millis(50))))
}
