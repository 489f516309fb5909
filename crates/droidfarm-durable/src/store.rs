//! DurableStore trait definition
//!
//! Typed operations over the store of record. Lookups by primary key return
//! `None` when the row is absent (no error); upserts are atomic and return
//! the post-image. Counter operations are atomic end to end: backends either
//! run a native SQL function or fall back to bounded compare-and-set.

use async_trait::async_trait;
use droidfarm_core::device::DeviceStatus;

use crate::models::*;

/// Compare-and-set fallback bounds for counter operations
pub const CAS_MAX_ATTEMPTS: u32 = 3;
pub const CAS_BACKOFF_MS: u64 = 10;

/// Error type for durable-store operations
#[derive(Debug, thiserror::Error)]
pub enum DurableStoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compare-and-set fallback exhausted its attempts
    #[error("concurrency exhausted after {attempts} attempts on {operation}")]
    ConcurrencyExhausted { operation: &'static str, attempts: u32 },

    /// Target row of a counter operation does not exist
    #[error("row not found: {0}")]
    RowMissing(String),
}

/// Result of an atomic execution counter bump
#[derive(Debug, Clone)]
pub struct ExecutionCounts {
    pub completed_devices: i32,
    pub failed_devices: i32,
    pub total_devices: i32,
    /// Aggregate status computed by the store when the counters reached the
    /// total; `None` while devices are still outstanding
    pub final_status: Option<String>,
}

impl ExecutionCounts {
    pub fn is_settled(&self) -> bool {
        self.completed_devices + self.failed_devices >= self.total_devices
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    // Nodes
    async fn upsert_node(&self, input: UpsertNode) -> Result<NodeRow, DurableStoreError>;
    async fn get_node(&self, id: &str) -> Result<Option<NodeRow>, DurableStoreError>;
    async fn list_nodes(&self) -> Result<Vec<NodeRow>, DurableStoreError>;

    // Devices
    async fn upsert_device(&self, input: UpsertDevice) -> Result<DeviceRow, DurableStoreError>;
    async fn get_device(&self, id: &str) -> Result<Option<DeviceRow>, DurableStoreError>;
    async fn list_devices(&self) -> Result<Vec<DeviceRow>, DurableStoreError>;

    /// Atomic: increments error_count, moves the device to ERROR (or
    /// QUARANTINE once the count reaches the threshold), records the error
    /// fields. Returns the post-image.
    async fn update_device_status_with_error(
        &self,
        device_id: &str,
        last_error: &str,
    ) -> Result<DeviceRow, DurableStoreError>;

    /// Atomic: bumps error_count only, leaving status untouched
    async fn increment_device_error_count(
        &self,
        device_id: &str,
    ) -> Result<i32, DurableStoreError>;

    /// Latest-wins status write used by the device-state mirror
    async fn set_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), DurableStoreError>;

    // Device execution view
    async fn upsert_device_state(
        &self,
        input: UpsertDeviceState,
    ) -> Result<DeviceStateRow, DurableStoreError>;
    async fn get_device_state(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceStateRow>, DurableStoreError>;

    // Workflows
    async fn create_workflow(&self, input: CreateWorkflow)
        -> Result<WorkflowRow, DurableStoreError>;
    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRow>, DurableStoreError>;

    /// Atomic: bumps the version and returns the new value. No two concurrent
    /// calls observe the same pre-image.
    async fn increment_workflow_version(&self, id: &str) -> Result<i32, DurableStoreError>;

    // Executions
    async fn insert_execution(
        &self,
        input: CreateExecution,
    ) -> Result<ExecutionRow, DurableStoreError>;
    async fn get_execution(
        &self,
        execution_key: &str,
    ) -> Result<Option<ExecutionRow>, DurableStoreError>;
    async fn update_execution(
        &self,
        execution_key: &str,
        update: UpdateExecution,
    ) -> Result<Option<ExecutionRow>, DurableStoreError>;
    async fn list_running_executions(&self) -> Result<Vec<ExecutionRow>, DurableStoreError>;

    /// Atomic: bumps one device counter and computes the aggregate status when
    /// completed + failed reaches total.
    async fn increment_execution_device_count(
        &self,
        execution_key: &str,
        count_type: CountType,
    ) -> Result<ExecutionCounts, DurableStoreError>;

    // Logs
    async fn insert_execution_log(
        &self,
        input: CreateExecutionLog,
    ) -> Result<(), DurableStoreError>;
    async fn list_execution_logs(
        &self,
        execution_key: &str,
    ) -> Result<Vec<ExecutionLogRow>, DurableStoreError>;

    // Alerts
    async fn insert_alert(&self, input: CreateAlert) -> Result<AlertRow, DurableStoreError>;
    async fn acknowledge_alert(
        &self,
        id: i64,
        by: &str,
    ) -> Result<Option<AlertRow>, DurableStoreError>;
    async fn list_active_alerts(&self) -> Result<Vec<AlertRow>, DurableStoreError>;

    // Settings
    async fn get_setting(
        &self,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DurableStoreError>;
    async fn set_setting(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), DurableStoreError>;

    /// Connectivity probe
    async fn ping(&self) -> Result<(), DurableStoreError>;
}
