//! Message payloads shared by both ends of the node channel

use droidfarm_core::workflow::Workflow;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Acknowledgement for a command frame
///
/// `received` is the baseline contract; `cancelled` is meaningful only in
/// response to CANCEL_WORKFLOW.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    /// Frame id of the command being acknowledged
    pub frame_id: Uuid,
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn received(frame_id: Uuid) -> Self {
        Self {
            frame_id,
            received: true,
            cancelled: None,
            error: None,
        }
    }

    pub fn cancelled(frame_id: Uuid, cancelled: bool) -> Self {
        Self {
            frame_id,
            received: true,
            cancelled: Some(cancelled),
            error: None,
        }
    }

    pub fn rejected(frame_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            frame_id,
            received: false,
            cancelled: None,
            error: Some(error.into()),
        }
    }
}

/// EXECUTE_WORKFLOW command body
///
/// The workflow ships with server steps already stripped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteWorkflow {
    pub job_id: String,
    pub execution_key: String,
    pub workflow_id: String,
    pub workflow: Workflow,
    pub device_ids: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// CANCEL_WORKFLOW command body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelWorkflow {
    pub job_id: String,
}

/// REGISTER event body: first frame a node sends on a fresh connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_count: Option<u32>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// One device as reported in a DEVICE_STATUS heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub android_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usb_port: Option<String>,
}

/// Host gauges attached to a DEVICE_STATUS heartbeat
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReportedSystem {
    pub cpu: f64,
    pub memory: f64,
}

/// WORKFLOW_PROGRESS event body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowProgressReport {
    pub job_id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// 0-100
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// WORKFLOW_COMPLETE event body: terminal signal for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCompleteReport {
    pub job_id: String,
    pub device_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub result: serde_json::Value,
}

/// WORKFLOW_ERROR event body
///
/// The coordinator treats this as WORKFLOW_COMPLETE with success=false and a
/// composite error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowErrorReport {
    pub job_id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub error: String,
    #[serde(default)]
    pub retry_count: u32,
}

impl WorkflowErrorReport {
    /// Error message as recorded on the device outcome
    pub fn composite_error(&self) -> String {
        match &self.step_id {
            Some(step) => format!("step {} failed: {}", step, self.error),
            None => self.error.clone(),
        }
    }
}
