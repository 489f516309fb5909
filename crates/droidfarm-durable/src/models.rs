// Database models (internal rows, may differ from the live view structs)

use chrono::{DateTime, Utc};
use droidfarm_core::alert::AlertLevel;
use droidfarm_core::device::DeviceStatus;
use droidfarm_core::execution::ExecutionStatus;
use droidfarm_core::log::{LogLevel, LogStatus};
use droidfarm_core::node::NodeStatus;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================
// nodes
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub id: String,
    pub label: Option<String>,
    pub status: String,
    pub network_addr: Option<String>,
    pub cpu: f64,
    pub memory: f64,
    pub device_capacity: Option<i32>,
    pub connected_devices: i32,
    pub last_seen: Option<DateTime<Utc>>,
    pub metadata: sqlx::types::JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for upserting a node (keyed by id)
#[derive(Debug, Clone)]
pub struct UpsertNode {
    pub id: String,
    pub label: Option<String>,
    pub status: NodeStatus,
    pub network_addr: Option<String>,
    pub cpu: f64,
    pub memory: f64,
    pub connected_devices: i32,
    pub last_seen: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

// ============================================
// devices + device_states
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct DeviceRow {
    pub id: String,
    pub pc_id: Option<String>,
    pub device_number: Option<i32>,
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub battery: Option<i32>,
    pub ip_address: Option<String>,
    pub connection_type: Option<String>,
    pub usb_port: Option<String>,
    pub status: String,
    pub error_count: i32,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metadata: sqlx::types::JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRow {
    pub fn parsed_status(&self) -> Option<DeviceStatus> {
        self.status.parse().ok()
    }
}

#[derive(Debug, Clone)]
pub struct UpsertDevice {
    pub id: String,
    pub pc_id: Option<String>,
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub battery: Option<i32>,
    pub ip_address: Option<String>,
    pub usb_port: Option<String>,
    pub status: DeviceStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Mirror of the live per-device execution view (`device_states` table)
#[derive(Debug, Clone, FromRow)]
pub struct DeviceStateRow {
    pub device_id: String,
    pub node_id: Option<String>,
    pub state: String,
    pub workflow_id: Option<String>,
    pub current_step: Option<String>,
    pub progress: i32,
    pub battery: Option<i32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct UpsertDeviceState {
    pub device_id: String,
    pub node_id: Option<String>,
    pub state: DeviceStatus,
    pub workflow_id: Option<String>,
    pub current_step: Option<String>,
    pub progress: i32,
    pub battery: Option<i32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

// ============================================
// workflows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub version: i32,
    pub steps: sqlx::types::JsonValue,
    pub tags: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateWorkflow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub steps: serde_json::Value,
    pub tags: Vec<String>,
}

// ============================================
// workflow_executions
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_version: Option<i32>,
    pub device_id: Option<String>,
    pub device_ids: Vec<String>,
    pub node_id: Option<String>,
    pub status: String,
    pub params: sqlx::types::JsonValue,
    pub result: Option<sqlx::types::JsonValue>,
    pub error_message: Option<String>,
    pub current_step: Option<String>,
    pub progress: i32,
    pub total_devices: i32,
    pub completed_devices: i32,
    pub failed_devices: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRow {
    pub fn parsed_status(&self) -> Option<ExecutionStatus> {
        self.status.parse().ok()
    }
}

#[derive(Debug, Clone)]
pub struct CreateExecution {
    pub id: Uuid,
    /// User-visible execution key (`exec_<ts>_<rand>`)
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_version: Option<i32>,
    pub device_ids: Vec<String>,
    pub node_id: Option<String>,
    pub status: ExecutionStatus,
    pub params: serde_json::Value,
    pub total_devices: i32,
}

/// Partial, latest-wins update to an execution row, keyed by execution key
#[derive(Debug, Clone, Default)]
pub struct UpdateExecution {
    pub status: Option<ExecutionStatus>,
    pub current_step: Option<String>,
    pub progress: Option<i32>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Which counter `increment_execution_device_count` bumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountType {
    Completed,
    Failed,
}

impl CountType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

// ============================================
// execution_logs
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionLogRow {
    pub id: i64,
    pub execution_id: String,
    pub device_id: Option<String>,
    pub workflow_id: Option<String>,
    pub step_id: Option<String>,
    pub level: String,
    pub status: Option<String>,
    pub message: Option<String>,
    pub data: sqlx::types::JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateExecutionLog {
    pub execution_id: String,
    pub device_id: Option<String>,
    pub workflow_id: Option<String>,
    pub step_id: Option<String>,
    pub level: LogLevel,
    pub status: Option<LogStatus>,
    pub message: Option<String>,
    pub data: serde_json::Value,
}

// ============================================
// alerts
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct AlertRow {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub source: Option<String>,
    pub data: sqlx::types::JsonValue,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateAlert {
    pub level: AlertLevel,
    pub message: String,
    pub source: Option<String>,
    pub data: serde_json::Value,
}

// ============================================
// settings
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct SettingRow {
    pub key: String,
    pub value: sqlx::types::JsonValue,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}
