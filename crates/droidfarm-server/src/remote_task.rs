//! Remote task client
//!
//! Server-side workflow steps run on an external task service (Celery-style)
//! reachable over HTTP: POST to dispatch, then poll the task status every
//! two seconds until a terminal state, the step deadline, or cancellation.

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Poll cadence for task status
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum RemoteTaskError {
    #[error("remote task request failed: {0}")]
    Http(String),

    #[error("remote task {name} failed: {message}")]
    TaskFailed { name: String, message: String },

    #[error("remote task {0} was revoked")]
    Revoked(String),

    #[error("remote task {0} timed out")]
    Timeout(String),

    #[error("remote task {0} cancelled")]
    Cancelled(String),
}

/// Task states surfaced by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteTaskState {
    Pending,
    Started,
    Success,
    Failure,
    Revoked,
    Retry,
}

impl RemoteTaskState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }
}

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: RemoteTaskState,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    progress: Option<u8>,
}

pub struct RemoteTaskExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteTaskExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Dispatch `name` with `params` and poll until terminal
    ///
    /// `progress` observes intermediate progress reports; PENDING/STARTED/
    /// RETRY keep the loop polling.
    #[instrument(skip(self, params, cancel, progress))]
    pub async fn execute(
        &self,
        name: &str,
        params: &serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
        progress: impl Fn(u8) + Send,
    ) -> Result<serde_json::Value, RemoteTaskError> {
        let dispatch: DispatchResponse = self
            .client
            .post(format!("{}/api/tasks/execute", self.base_url))
            .json(&serde_json::json!({ "task": name, "kwargs": params }))
            .send()
            .await
            .map_err(|e| RemoteTaskError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| RemoteTaskError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| RemoteTaskError::Http(e.to_string()))?;

        debug!(task_id = %dispatch.task_id, "remote task dispatched");
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(RemoteTaskError::Cancelled(name.to_string()));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RemoteTaskError::Timeout(name.to_string()));
            }

            let status: StatusResponse = self
                .client
                .get(format!(
                    "{}/api/tasks/{}/status",
                    self.base_url, dispatch.task_id
                ))
                .send()
                .await
                .map_err(|e| RemoteTaskError::Http(e.to_string()))?
                .error_for_status()
                .map_err(|e| RemoteTaskError::Http(e.to_string()))?
                .json()
                .await
                .map_err(|e| RemoteTaskError::Http(e.to_string()))?;

            if let Some(p) = status.progress {
                progress(p.min(100));
            }

            if status.state.is_terminal() {
                return match status.state {
                    RemoteTaskState::Success => Ok(status.result),
                    RemoteTaskState::Revoked => Err(RemoteTaskError::Revoked(name.to_string())),
                    _ => Err(RemoteTaskError::TaskFailed {
                        name: name.to_string(),
                        message: status
                            .error
                            .unwrap_or_else(|| "task reported FAILURE".to_string()),
                    }),
                };
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    return Err(RemoteTaskError::Cancelled(name.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parsing_matches_wire_names() {
        let s: RemoteTaskState = serde_json::from_str("\"SUCCESS\"").unwrap();
        assert_eq!(s, RemoteTaskState::Success);
        let s: RemoteTaskState = serde_json::from_str("\"RETRY\"").unwrap();
        assert!(!s.is_terminal());
        let s: RemoteTaskState = serde_json::from_str("\"REVOKED\"").unwrap();
        assert!(s.is_terminal());
    }
}
