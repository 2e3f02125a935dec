//! Remote Source: the shared server copy of the document.
//!
//! The server applies optimistic locking on writes: a write carries the
//! server version it was based on, and is rejected with the server's current
//! copy when that version is stale.

use crate::errors::{AppError, AppResult};
use crate::models::AppState;
use crate::sanitize::sanitize_app_state;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const BASE_VERSION_HEADER: &str = "X-Base-Version";
const FORCE_BASE_VERSION: &str = "force";
const DATA_PATH: &str = "/api/data";

/// Raised when a write is rejected because the server copy is newer than the
/// write's base version. Carries the server copy as received.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEvent {
    pub server_data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Accepted { server_version: i64 },
    Conflict(ConflictEvent),
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// `None` means the server is unreachable or returned no usable document.
    async fn fetch(&self) -> Option<AppState>;

    /// `base_version` is the last server version this client has seen; `None`
    /// forces the write.
    async fn push(&self, state: &AppState, base_version: Option<i64>) -> AppResult<PushOutcome>;
}

/// The document as sent to the server: session-local fields stripped.
pub fn server_payload(state: &AppState) -> AppResult<Value> {
    let mut payload = serde_json::to_value(state)?;
    if let Value::Object(map) = &mut payload {
        map.remove("currentUser");
        map.remove("theme");
    }
    Ok(payload)
}

fn is_usable_document(value: &Value) -> bool {
    value
        .as_object()
        .map(|map| map.contains_key("users") || map.contains_key("teams"))
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct PushAccepted {
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushRejected {
    #[serde(default)]
    server_data: Value,
}

#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    data_url: String,
}

impl HttpRemote {
    pub fn new(server_url: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| AppError::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            client,
            data_url: format!("{}{}", server_url.trim_end_matches('/'), DATA_PATH),
        })
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn fetch(&self) -> Option<AppState> {
        let response = match self.client.get(&self.data_url).send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(error = %error, url = %self.data_url, "remote fetch failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), "remote fetch returned an error status");
            return None;
        }

        match response.json::<Value>().await {
            Ok(body) if is_usable_document(&body) => Some(sanitize_app_state(body)),
            Ok(_) => {
                tracing::warn!("remote document has neither users nor teams; ignoring it");
                None
            }
            Err(error) => {
                tracing::warn!(error = %error, "remote document is not valid JSON");
                None
            }
        }
    }

    async fn push(&self, state: &AppState, base_version: Option<i64>) -> AppResult<PushOutcome> {
        let base_header = base_version
            .map(|version| version.to_string())
            .unwrap_or_else(|| FORCE_BASE_VERSION.to_string());

        let response = self
            .client
            .post(&self.data_url)
            .header(BASE_VERSION_HEADER, base_header)
            .json(&server_payload(state)?)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            let rejected: PushRejected = response.json().await?;
            return Ok(PushOutcome::Conflict(ConflictEvent {
                server_data: rejected.server_data,
            }));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Remote(format!(
                "server rejected write with status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let accepted: PushAccepted = response.json().await?;
        Ok(PushOutcome::Accepted {
            server_version: accepted.timestamp,
        })
    }
}

/// In-process server with the same locking rule as the HTTP server. Accepted
/// writes are stamped no lower than the clock they carry.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    document: Mutex<Option<Value>>,
    unreachable: AtomicBool,
    accepted_writes: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(state: &AppState) -> AppResult<Self> {
        let remote = Self::new();
        remote.replace_document(state)?;
        Ok(remote)
    }

    /// Replaces the server copy as another client's accepted write would,
    /// keeping the clock `state` carries.
    pub fn replace_document(&self, state: &AppState) -> AppResult<()> {
        let payload = server_payload(state)?;
        let mut document = self
            .document
            .lock()
            .map_err(|_| AppError::Internal("remote mutex poisoned".to_string()))?;
        *document = Some(payload);
        Ok(())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn document(&self) -> Option<AppState> {
        let document = self.document.lock().ok()?;
        document.clone().map(sanitize_app_state)
    }

    pub fn accepted_writes(&self) -> usize {
        self.accepted_writes.load(Ordering::SeqCst)
    }

    fn current_version(document: &Option<Value>) -> i64 {
        document
            .as_ref()
            .and_then(|value| value.get("lastUpdated"))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteSource for MemoryRemote {
    async fn fetch(&self) -> Option<AppState> {
        if self.unreachable.load(Ordering::SeqCst) {
            return None;
        }
        let document = self.document.lock().ok()?.clone()?;
        if !is_usable_document(&document) {
            return None;
        }
        Some(sanitize_app_state(document))
    }

    async fn push(&self, state: &AppState, base_version: Option<i64>) -> AppResult<PushOutcome> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AppError::Remote("server unreachable".to_string()));
        }

        let mut document = self
            .document
            .lock()
            .map_err(|_| AppError::Internal("remote mutex poisoned".to_string()))?;
        let current_version = Self::current_version(&document);

        if let Some(base_version) = base_version {
            if document.is_some() && base_version != current_version {
                return Ok(PushOutcome::Conflict(ConflictEvent {
                    server_data: document.clone().unwrap_or(Value::Null),
                }));
            }
        }

        let server_version = Utc::now()
            .timestamp_millis()
            .max(current_version + 1)
            .max(state.last_updated);
        let mut payload = server_payload(state)?;
        if let Value::Object(map) = &mut payload {
            map.insert("lastUpdated".to_string(), Value::from(server_version));
        }
        *document = Some(payload);
        self.accepted_writes.fetch_add(1, Ordering::SeqCst);

        Ok(PushOutcome::Accepted { server_version })
    }
}

#[cfg(test)]
mod tests {
    use super::{server_payload, MemoryRemote, PushOutcome, RemoteSource};
    use crate::db::default_state;
    use crate::models::{Theme, UserRole};

    #[test]
    fn payload_strips_session_fields() {
        let mut state = default_state(10);
        state.current_user = state.users.first().cloned();
        state.theme = Theme::Dark;

        let payload = server_payload(&state).expect("payload");
        assert!(payload.get("currentUser").is_none());
        assert!(payload.get("theme").is_none());
        assert_eq!(payload["lastUpdated"], 10);
    }

    #[tokio::test]
    async fn stale_base_version_is_rejected_with_server_copy() {
        let remote = MemoryRemote::with_document(&default_state(100)).expect("remote");

        let outcome = remote
            .push(&default_state(120), Some(90))
            .await
            .expect("push");
        let conflict = match outcome {
            PushOutcome::Conflict(conflict) => conflict,
            other => panic!("expected a conflict, got {other:?}"),
        };
        assert_eq!(conflict.server_data["lastUpdated"], 100);
        assert_eq!(remote.accepted_writes(), 0);
    }

    #[tokio::test]
    async fn matching_base_version_is_accepted_with_new_clock() {
        let remote = MemoryRemote::with_document(&default_state(100)).expect("remote");

        let outcome = remote
            .push(&default_state(100), Some(100))
            .await
            .expect("push");
        let server_version = match outcome {
            PushOutcome::Accepted { server_version } => server_version,
            other => panic!("expected acceptance, got {other:?}"),
        };
        assert!(server_version > 100);

        let stored = remote.document().expect("document");
        assert_eq!(stored.last_updated, server_version);
        assert_eq!(stored.users[0].role, UserRole::Admin);
        assert!(stored.current_user.is_none());
    }

    #[tokio::test]
    async fn unreachable_remote_fetches_nothing() {
        let remote = MemoryRemote::with_document(&default_state(100)).expect("remote");
        remote.set_reachable(false);
        assert!(remote.fetch().await.is_none());
        assert!(remote.push(&default_state(1), None).await.is_err());

        remote.set_reachable(true);
        assert_eq!(remote.fetch().await.map(|state| state.last_updated), Some(100));
    }
}
