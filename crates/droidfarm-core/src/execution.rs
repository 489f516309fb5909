//! Workflow executions: one dispatch of a workflow to one or more devices
//!
//! Executions carry two identities: a surrogate `execution_id` (UUID v7) and a
//! user-visible execution key of the form `exec_<millis>_<rand>`.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Mixed device outcomes
    Partial,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Partial
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "partial" => Ok(Self::Partial),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Outcome of one device within a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOutcome {
    pub device_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub result: serde_json::Value,
}

impl DeviceOutcome {
    pub fn success(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            success: true,
            duration_ms: None,
            error: None,
            result: serde_json::Value::Null,
        }
    }

    pub fn failure(device_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            success: false,
            duration_ms: None,
            error: Some(error.into()),
            result: serde_json::Value::Null,
        }
    }
}

/// Aggregate of per-device outcomes for a finished job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAggregate {
    pub status: ExecutionStatus,
    pub total_devices: u32,
    pub completed_devices: u32,
    pub failed_devices: u32,
    pub outcomes: Vec<DeviceOutcome>,
}

impl ExecutionAggregate {
    /// Aggregation rule: all success -> completed, none -> failed, mixed ->
    /// partial. An empty outcome list counts as failed (nothing ran).
    pub fn from_outcomes(outcomes: Vec<DeviceOutcome>) -> Self {
        let total = outcomes.len() as u32;
        let completed = outcomes.iter().filter(|o| o.success).count() as u32;
        let failed = total - completed;
        let status = if total == 0 || completed == 0 {
            ExecutionStatus::Failed
        } else if failed == 0 {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Partial
        };
        Self {
            status,
            total_devices: total,
            completed_devices: completed,
            failed_devices: failed,
            outcomes,
        }
    }

    /// First error across the outcomes, for the execution row's error_message
    pub fn first_error(&self) -> Option<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_deref())
            .next()
    }
}

/// One dispatch of a workflow against a set of devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    /// User-visible key, `exec_<millis>_<rand>`
    pub execution_key: String,

    pub workflow_id: String,
    pub workflow_version: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub device_ids: Vec<String>,

    #[serde(default)]
    pub params: serde_json::Value,

    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// 0-100
    pub progress: u8,

    pub total_devices: u32,
    pub completed_devices: u32,
    pub failed_devices: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// A freshly enqueued execution
    pub fn enqueued(
        workflow_id: impl Into<String>,
        workflow_version: u32,
        node_id: impl Into<String>,
        device_ids: Vec<String>,
        params: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::now_v7(),
            execution_key: generate_execution_key(),
            workflow_id: workflow_id.into(),
            workflow_version,
            node_id: Some(node_id.into()),
            total_devices: device_ids.len() as u32,
            device_ids,
            params,
            status: ExecutionStatus::Queued,
            current_step: None,
            progress: 0,
            completed_devices: 0,
            failed_devices: 0,
            started_at: None,
            completed_at: None,
            result: serde_json::Value::Null,
            error_message: None,
            created_at: now,
        }
    }
}

const KEY_SUFFIX_LEN: usize = 9;
const KEY_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a user-visible execution key: `exec_<millis>_<rand>`
pub fn generate_execution_key() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..KEY_SUFFIX_LEN)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect();
    format!("exec_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// Parse an execution key back into its timestamp component
///
/// Returns `None` when the key is not of the `exec_<millis>_<rand>` shape.
pub fn parse_execution_key(key: &str) -> Option<DateTime<Utc>> {
    let rest = key.strip_prefix("exec_")?;
    let (millis, suffix) = rest.split_once('_')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    DateTime::from_timestamp_millis(millis.parse().ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_all_success() {
        let agg = ExecutionAggregate::from_outcomes(vec![
            DeviceOutcome::success("D1"),
            DeviceOutcome::success("D2"),
        ]);
        assert_eq!(agg.status, ExecutionStatus::Completed);
        assert_eq!(agg.completed_devices + agg.failed_devices, agg.total_devices);
    }

    #[test]
    fn aggregation_mixed_is_partial() {
        let agg = ExecutionAggregate::from_outcomes(vec![
            DeviceOutcome::success("D1"),
            DeviceOutcome::failure("D2", "tap failed"),
            DeviceOutcome::success("D3"),
        ]);
        assert_eq!(agg.status, ExecutionStatus::Partial);
        assert_eq!(agg.completed_devices, 2);
        assert_eq!(agg.failed_devices, 1);
        assert_eq!(agg.first_error(), Some("tap failed"));
    }

    #[test]
    fn aggregation_none_success_is_failed() {
        let agg =
            ExecutionAggregate::from_outcomes(vec![DeviceOutcome::failure("D1", "boom")]);
        assert_eq!(agg.status, ExecutionStatus::Failed);
    }

    #[test]
    fn execution_key_round_trip() {
        let key = generate_execution_key();
        let ts = parse_execution_key(&key).expect("key parses");
        let drift = (Utc::now() - ts).num_seconds().abs();
        assert!(drift < 5, "timestamp component is recent, drift={drift}s");
    }

    #[test]
    fn malformed_execution_keys_rejected() {
        assert!(parse_execution_key("exec_abc_def").is_none());
        assert!(parse_execution_key("run_123_abc").is_none());
        assert!(parse_execution_key("exec_123").is_none());
        assert!(parse_execution_key("exec_123_").is_none());
    }

    #[test]
    fn terminal_statuses() {
        for s in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Partial,
        ] {
            assert!(s.is_terminal());
        }
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Queued.is_terminal());
    }
}
