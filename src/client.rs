//! HTTP collaborator used by the coordinator.
//!
//! [`Backend`] is the seam the coordinator depends on; [`ApiClient`] is the
//! `reqwest` implementation against the admin API.
//!
//! ## Endpoints
//!
//! | Method | Path                          | Used for                               |
//! |--------|-------------------------------|----------------------------------------|
//! | GET    | `/queue/status`               | queue snapshot when the socket is down |
//! | GET    | `/progress/{task_id}`         | authoritative task snapshot            |
//! | GET    | `/requests?user_id={user_id}` | the user's request list                |
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `error` (or `detail`) field in the JSON
//! body. If parsing fails, the raw response body is returned as the message.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::error::ClientError;
use crate::models::{QueueStatus, RequestRecord, TaskProgress};

#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_queue_status(&self) -> Result<QueueStatus, ClientError>;

    async fn fetch_task_detail(&self, task_id: &str) -> Result<TaskProgress, ClientError>;

    async fn fetch_requests(&self, user_id: &str) -> Result<Vec<RequestRecord>, ClientError>;
}

/// HTTP client for the admin API.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::Protocol(format!("invalid API base URL {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Protocol(format!(
                "invalid API base URL {base_url}"
            )));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        let mut req = self.http.get(self.endpoint(segments));
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        Self::handle_response(resp).await
    }

    /// Parse an HTTP response: the JSON body on success, or a
    /// [`ClientError`] with the error message on failure.
    async fn handle_response<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| ClientError::Protocol(format!("unexpected response body: {e}")))
        } else {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("error")
                        .or_else(|| v.get("detail"))
                        .and_then(Value::as_str)
                        .map(String::from)
                })
                .unwrap_or(body);
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl Backend for ApiClient {
    /// `GET /queue/status`
    async fn fetch_queue_status(&self) -> Result<QueueStatus, ClientError> {
        self.get(&["queue", "status"], &[]).await
    }

    /// `GET /progress/{task_id}`
    async fn fetch_task_detail(&self, task_id: &str) -> Result<TaskProgress, ClientError> {
        let mut detail: TaskProgress = self.get(&["progress", task_id], &[]).await?;
        if detail.task_id.is_empty() {
            detail.task_id = task_id.to_string();
        }
        Ok(detail)
    }

    /// `GET /requests?user_id={user_id}`
    async fn fetch_requests(&self, user_id: &str) -> Result<Vec<RequestRecord>, ClientError> {
        self.get(&["requests"], &[("user_id", user_id)]).await
    }
}
