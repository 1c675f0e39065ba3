//! HTTP pull client for the relay's REST endpoints.

use asc_core::{AgentStatus, Heartbeat, Message, WorkerName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::source::StatusSource;

/// Settings for [`HttpStatusClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Retries after the first attempt. 4xx responses are never retried.
    pub max_retries: u32,
    /// Base retry delay, multiplied by the attempt number.
    pub retry_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Pull-mode status source backed by the relay's HTTP API.
#[derive(Clone)]
pub struct HttpStatusClient {
    inner: reqwest::Client,
    base_url: String,
    config: HttpClientConfig,
}

impl HttpStatusClient {
    /// Create a new HTTP client with default settings.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_config(base_url, HttpClientConfig::default())
    }

    pub fn with_config(base_url: &str, config: HttpClientConfig) -> Result<Self, ClientError> {
        let inner = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            inner,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Raw heartbeats, as reported by the agents.
    pub async fn get_heartbeats(&self) -> Result<Vec<Heartbeat>, ClientError> {
        let heartbeats: Option<Vec<Heartbeat>> = self.get_json("/heartbeats", &[]).await?;
        Ok(heartbeats.unwrap_or_default())
    }

    /// Status of one agent derived from its latest heartbeat.
    ///
    /// An agent with no heartbeat at all is reported `Offline` with no last-seen time.
    pub async fn track_agent_status(
        &self,
        name: &WorkerName,
        offline_threshold: Duration,
    ) -> Result<AgentStatus, ClientError> {
        let heartbeats = self.get_heartbeats().await?;
        let now = Utc::now();
        Ok(heartbeats
            .iter()
            .find(|hb| &hb.agent_name == name)
            .map(|hb| hb.to_status(now, offline_threshold))
            .unwrap_or_else(|| AgentStatus::offline(name.clone())))
    }

    /// GET a JSON document.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "GET request");

        let response = self
            .send_with_retry(path, || self.inner.get(&url).query(query))
            .await?;

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// POST a JSON body, ignoring the response body.
    async fn post_json<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ClientError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "POST request");

        let body = serde_json::to_vec(body)?;
        self.send_with_retry(path, || {
            self.inner
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone())
        })
        .await?;
        Ok(())
    }

    async fn send_with_retry<F>(
        &self,
        path: &str,
        build: F,
    ) -> Result<reqwest::Response, ClientError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }

            match send_once(path, build()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_client_error() => return Err(e),
                Err(e) => {
                    debug!(path, attempt, error = %e, "Request failed");
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| ClientError::Connection(path.to_string()));
        warn!(
            path,
            retries = self.config.max_retries,
            error = %error,
            "Request failed after retries"
        );
        Err(error)
    }
}

async fn send_once(
    path: &str,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, ClientError> {
    let response = request.send().await.map_err(|e| {
        if e.is_connect() || e.is_timeout() {
            ClientError::Connection(e.to_string())
        } else {
            ClientError::Http(e)
        }
    })?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(path.to_string()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

#[async_trait]
impl StatusSource for HttpStatusClient {
    async fn get_agent_status(&self, name: &WorkerName) -> Result<AgentStatus, ClientError> {
        self.get_json(&format!("/agents/{name}/status"), &[]).await
    }

    async fn get_all_agent_statuses(
        &self,
        offline_threshold: Duration,
    ) -> Result<Vec<AgentStatus>, ClientError> {
        let heartbeats = self.get_heartbeats().await?;
        let now = Utc::now();
        Ok(heartbeats
            .iter()
            .map(|hb| hb.to_status(now, offline_threshold))
            .collect())
    }

    async fn get_messages(&self, since: DateTime<Utc>) -> Result<Vec<Message>, ClientError> {
        let messages: Option<Vec<Message>> = self
            .get_json("/messages", &[("since", since.timestamp().to_string())])
            .await?;
        Ok(messages.unwrap_or_default())
    }

    async fn send_message(&self, message: &Message) -> Result<(), ClientError> {
        self.post_json("/messages", message).await
    }

    async fn release_agent_leases(&self, name: &WorkerName) -> Result<(), ClientError> {
        self.post_json(&format!("/agents/{name}/leases/release"), &serde_json::json!({}))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRelay;
    use asc_core::{AgentState, MessageType};

    fn fast_config() -> HttpClientConfig {
        HttpClientConfig {
            request_timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_get_all_agent_statuses_marks_stale_offline() {
        let relay = FakeRelay::new();
        relay.add_heartbeat("planner", AgentState::Working, 5);
        relay.add_heartbeat("coder", AgentState::Idle, 600);
        let url = relay.spawn().await;

        let client = HttpStatusClient::with_config(&url, fast_config()).unwrap();
        let mut statuses = client
            .get_all_agent_statuses(Duration::from_secs(120))
            .await
            .unwrap();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].name.as_str(), "coder");
        assert_eq!(statuses[0].state, AgentState::Offline);
        assert_eq!(statuses[1].state, AgentState::Working);
    }

    #[tokio::test]
    async fn test_track_missing_agent_is_offline() {
        let relay = FakeRelay::new();
        let url = relay.spawn().await;
        let client = HttpStatusClient::with_config(&url, fast_config()).unwrap();

        let status = client
            .track_agent_status(&WorkerName::new("ghost"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(status.state, AgentState::Offline);
        assert!(status.last_seen.is_none());
    }

    #[tokio::test]
    async fn test_get_agent_status_not_found_is_not_retried() {
        let relay = FakeRelay::new();
        let url = relay.spawn().await;
        let client = HttpStatusClient::with_config(&url, fast_config()).unwrap();

        let err = client
            .get_agent_status(&WorkerName::new("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
        assert_eq!(relay.status_requests(), 1);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let relay = FakeRelay::new();
        relay.add_heartbeat("planner", AgentState::Idle, 1);
        relay.fail_next_heartbeats(2);
        let url = relay.spawn().await;
        let client = HttpStatusClient::with_config(&url, fast_config()).unwrap();

        let heartbeats = client.get_heartbeats().await.unwrap();
        assert_eq!(heartbeats.len(), 1);
        assert_eq!(relay.heartbeat_requests(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let relay = FakeRelay::new();
        relay.fail_next_heartbeats(10);
        let url = relay.spawn().await;
        let client = HttpStatusClient::with_config(&url, fast_config()).unwrap();

        let err = client.get_heartbeats().await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 503, .. }));
        assert_eq!(relay.heartbeat_requests(), 3);
    }

    #[tokio::test]
    async fn test_messages_round_trip_through_relay() {
        let relay = FakeRelay::new();
        let url = relay.spawn().await;
        let client = HttpStatusClient::with_config(&url, fast_config()).unwrap();

        let since = Utc::now() - chrono::Duration::seconds(5);
        let msg = Message::new(MessageType::Message, "planner", "plan ready");
        client.send_message(&msg).await.unwrap();

        let messages = client.get_messages(since).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "plan ready");

        let later = client
            .get_messages(Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn test_release_leases() {
        let relay = FakeRelay::new();
        let url = relay.spawn().await;
        let client = HttpStatusClient::with_config(&url, fast_config()).unwrap();

        client
            .release_agent_leases(&WorkerName::new("coder"))
            .await
            .unwrap();
        assert_eq!(relay.released(), vec!["coder".to_string()]);
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        let client = HttpStatusClient::with_config(
            "http://127.0.0.1:1",
            HttpClientConfig {
                max_retries: 0,
                ..fast_config()
            },
        )
        .unwrap();
        let err = client.get_heartbeats().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)), "{err:?}");
    }
}
