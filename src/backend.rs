//! Backend HTTP client
//!
//! Typed wrapper around the session endpoints used by the transcription
//! client:
//!
//! - `POST /sessions` creates a task
//! - `POST /sessions/{id}/audio` uploads audio in degraded mode
//! - `GET  /sessions/{id}/transcripts` returns accumulated results
//! - `POST /sessions/{id}/complete` marks the session finished
//! - `GET  /sessions/health` reports availability

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::streaming::polling::PollCursor;
use crate::streaming::{TranscriptSegment, TranscriptTracker};

/// Errors from the backend HTTP surface
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Request never produced a response (DNS, refused, timeout)
    Network(String),
    /// Backend answered with a non-2xx status
    Api { status: u16, message: String },
    /// Response body was not what we expected
    Parse(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Network(e) => write!(f, "Network error: {}", e),
            BackendError::Api { status, message } => {
                write!(f, "Backend error ({}): {}", status, message)
            }
            BackendError::Parse(e) => write!(f, "Failed to parse backend response: {}", e),
        }
    }
}

impl std::error::Error for BackendError {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    meeting_id: &'a str,
    topic: &'a str,
}

/// Ids returned by task creation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
    pub task_id: String,
    /// Absent or empty means degraded mode
    #[serde(default)]
    pub meeting_join_url: Option<String>,
}

impl CreatedSession {
    pub fn join_url(&self) -> Option<&str> {
        self.meeting_join_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
    }
}

#[derive(Debug, Serialize)]
struct AudioChunkRequest {
    chunk: String,
}

/// HTTP client for one backend base path.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    health_timeout: Duration,
}

impl BackendClient {
    pub fn new(config: &ClientConfig) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            health_timeout: config.health_timeout(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-2xx response into `BackendError::Api`.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(BackendError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// `POST /sessions`
    pub async fn create_session(
        &self,
        meeting_id: &str,
        topic: &str,
    ) -> Result<CreatedSession, BackendError> {
        let response = self
            .http
            .post(self.url("/sessions"))
            .json(&CreateSessionRequest { meeting_id, topic })
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        Self::check(response)
            .await?
            .json::<CreatedSession>()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    /// `POST /sessions/{id}/complete`. The response body is ignored.
    pub async fn complete_session(&self, session_id: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.url(&format!("/sessions/{}/complete", session_id)))
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        Self::check(response).await.map(|_| ())
    }

    /// `POST /sessions/{id}/audio` with the buffer base64-encoded.
    pub async fn upload_audio(&self, session_id: &str, buffer: &[u8]) -> Result<(), BackendError> {
        let body = AudioChunkRequest {
            chunk: STANDARD.encode(buffer),
        };

        let response = self
            .http
            .post(self.url(&format!("/sessions/{}/audio", session_id)))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        Self::check(response).await.map(|_| ())
    }

    /// `GET /sessions/{id}/transcripts`, returned as raw JSON for the
    /// polling normalizer.
    pub async fn fetch_transcripts(&self, session_id: &str) -> Result<Value, BackendError> {
        let response = self
            .http
            .get(self.url(&format!("/sessions/{}/transcripts", session_id)))
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        Self::check(response)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    /// Stored transcript of a finished session, normalized into segments.
    ///
    /// Returns an empty list on any failure.
    pub async fn transcript_history(&self, session_id: &str) -> Vec<TranscriptSegment> {
        let body = match self.fetch_transcripts(session_id).await {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Backend: transcript history for {} failed: {}", session_id, e);
                return Vec::new();
            }
        };

        let mut tracker = TranscriptTracker::new(session_id);
        match PollCursor::new().advance(&body) {
            Ok(results) => results
                .iter()
                .map(|r| tracker.finalize(&r.text, r.start_ms, r.end_ms, r.confidence))
                .collect(),
            Err(e) => {
                log::warn!("Backend: {}", e);
                Vec::new()
            }
        }
    }

    /// `GET /sessions/health`; any failure or a slow answer means unavailable.
    pub async fn is_healthy(&self) -> bool {
        let request = self
            .http
            .get(self.url("/sessions/health"))
            .timeout(self.health_timeout)
            .send();

        match tokio::time::timeout(self.health_timeout, request).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                log::debug!("Backend: health probe failed: {}", e);
                false
            }
            Err(_) => {
                log::debug!("Backend: health probe timed out");
                false
            }
        }
    }
}
