//! HTTP collaborator for session lifecycle calls.
//!
//! Endpoints, relative to `backend.apiUrl`:
//!
//! | Call | Request |
//! |---|---|
//! | create | `POST /api/sessions` `{"task": ...}` |
//! | pause / resume / stop | `POST /api/sessions/{id}/{action}` |
//! | close one | `DELETE /api/sessions/{id}` |
//! | close all | `DELETE /api/sessions` |
//! | snapshot | `GET /api/sessions/{id}` (404 means gone) |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use cobrowse_core::ids::SessionId;
use cobrowse_core::protocol::SessionUpdate;
use cobrowse_settings::BackendSettings;

/// Snapshot returned by the polling fallback. Same shape as a streamed
/// `session_update`.
pub type SessionSnapshot = SessionUpdate;

/// A failed backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport failure or client construction failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode backend response: {0}")]
    Decode(String),
}

/// Response to a create call.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CreatedSession {
    /// New session identifier.
    pub session_id: SessionId,
    /// Live-view URL, when already available.
    #[serde(default)]
    pub browser_url: Option<String>,
}

/// Lifecycle operations on the browser-automation backend.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Start a task in a new session.
    async fn create_session(&self, task: &str) -> Result<CreatedSession, BackendError>;
    /// Suspend the agent.
    async fn pause(&self, session_id: &SessionId) -> Result<(), BackendError>;
    /// Resume the agent.
    async fn resume(&self, session_id: &SessionId) -> Result<(), BackendError>;
    /// Stop the task, keeping the session.
    async fn stop(&self, session_id: &SessionId) -> Result<(), BackendError>;
    /// Tear one session down.
    async fn close_session(&self, session_id: &SessionId) -> Result<(), BackendError>;
    /// Tear every session down.
    async fn close_all(&self) -> Result<(), BackendError>;
    /// Current state of one session, or `None` if the backend no longer has it.
    async fn fetch_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionSnapshot>, BackendError>;
}

/// `reqwest` implementation of [`BrowserBackend`].
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Client for `settings.api_url` with the configured request timeout.
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.api_url.trim_end_matches('/').to_owned(),
        })
    }

    fn sessions_url(&self) -> String {
        format!("{}/api/sessions", self.base_url)
    }

    fn session_url(&self, session_id: &SessionId) -> String {
        format!("{}/api/sessions/{session_id}", self.base_url)
    }

    async fn post_action(&self, session_id: &SessionId, action: &str) -> Result<(), BackendError> {
        let url = format!("{}/{action}", self.session_url(session_id));
        let response = self.client.post(&url).send().await?;
        let _ = check(response).await?;
        debug!(session_id = %session_id, action, "backend action applied");
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl BrowserBackend for HttpBackend {
    async fn create_session(&self, task: &str) -> Result<CreatedSession, BackendError> {
        let response = self
            .client
            .post(self.sessions_url())
            .json(&serde_json::json!({ "task": task }))
            .send()
            .await?;
        let created: CreatedSession = check(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        info!(session_id = %created.session_id, "session created");
        Ok(created)
    }

    async fn pause(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.post_action(session_id, "pause").await
    }

    async fn resume(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.post_action(session_id, "resume").await
    }

    async fn stop(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.post_action(session_id, "stop").await
    }

    async fn close_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        let response = self.client.delete(self.session_url(session_id)).send().await?;
        let _ = check(response).await?;
        info!(session_id = %session_id, "session closed");
        Ok(())
    }

    async fn close_all(&self) -> Result<(), BackendError> {
        let response = self.client.delete(self.sessions_url()).send().await?;
        let _ = check(response).await?;
        info!("all sessions closed");
        Ok(())
    }

    async fn fetch_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionSnapshot>, BackendError> {
        let response = self.client.get(self.session_url(session_id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let snapshot = check(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(Some(snapshot))
    }
}
