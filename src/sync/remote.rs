//! Remote Store Client
//!
//! The seam between the engine and the shared remote store. The trait
//! carries the three-way outcome the retry policy depends on: success,
//! transient failure (retry with backoff), or permanent rejection
//! (surface to the user, never retry automatically).

use crate::sync::models::ChangeEvent;
use crate::sync::queue::QueueEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outcome classification for remote operations
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Network error or remote temporarily unavailable; retryable
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Remote rejected the payload; retrying cannot succeed
    #[error("remote rejected request: {0}")]
    Permanent(String),
}

/// Write endpoint and reconciliation source of the shared remote store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Push one queue entry. `Ok(())` means the remote has durably
    /// acknowledged the mutation.
    async fn push_entry(&self, entry: &QueueEntry) -> Result<(), RemoteError>;

    /// Pull all changes committed since `since` (all changes when `None`),
    /// for a reconciliation pass repairing gaps missed by the push stream.
    async fn pull_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangeEvent>, RemoteError>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    op: &'a str,
    record: &'a Value,
}

/// HTTP client for the sync server
pub struct HttpRemote {
    client: Client,
    base_url: String,
    /// Bearer token (cached in memory, set by the host application)
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            access_token: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn set_token(&self, token: String) {
        *self.access_token.write().await = Some(token);
    }

    pub async fn clear_token(&self) {
        *self.access_token.write().await = None;
    }

    async fn bearer(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn push_entry(&self, entry: &QueueEntry) -> Result<(), RemoteError> {
        let url = format!("{}/sync/{}", self.base_url, entry.record_type.as_str());
        let body = PushRequest {
            op: entry.op.as_str(),
            record: &entry.snapshot,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = self.bearer().await {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(classify_status(status, response.text().await.ok()))
    }

    async fn pull_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangeEvent>, RemoteError> {
        let url = format!("{}/sync/changes", self.base_url);

        let mut request = self.client.get(&url);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }
        if let Some(token) = self.bearer().await {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, response.text().await.ok()));
        }

        let frames: Vec<Value> = response
            .json()
            .await
            .map_err(|e| RemoteError::Permanent(format!("invalid change feed: {}", e)))?;

        // Frames are validated here, at the boundary; malformed ones are
        // logged and dropped rather than poisoning the whole pull.
        let mut events = Vec::with_capacity(frames.len());
        for frame in &frames {
            match ChangeEvent::from_value(frame) {
                Ok(event) => events.push(event),
                Err(e) => log::warn!("Skipping malformed change frame in pull: {}", e),
            }
        }
        Ok(events)
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    // Connection failures and timeouts are retryable by definition
    RemoteError::Transient(e.to_string())
}

fn classify_status(status: StatusCode, body: Option<String>) -> RemoteError {
    let detail = body
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| status.to_string());
    match status {
        // The remote is alive but overloaded or momentarily unable
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(detail)
        }
        s if s.is_server_error() => RemoteError::Transient(detail),
        // Schema/validation rejections and auth problems: retrying the
        // same payload cannot succeed without user action
        _ => RemoteError::Permanent(detail),
    }
}

// ============================================================================
// Tests
// ============================================================================
