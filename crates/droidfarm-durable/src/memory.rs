//! In-memory implementation of DurableStore for testing
//!
//! Stores all rows in maps behind one lock, which makes every counter
//! operation trivially atomic with the same observable semantics as the
//! PostgreSQL backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use droidfarm_core::device::{DeviceStatus, QUARANTINE_THRESHOLD};
use parking_lot::Mutex;

use crate::models::*;
use crate::store::{DurableStore, DurableStoreError, ExecutionCounts};

#[derive(Default)]
struct Tables {
    nodes: HashMap<String, NodeRow>,
    devices: HashMap<String, DeviceRow>,
    device_states: HashMap<String, DeviceStateRow>,
    workflows: HashMap<String, WorkflowRow>,
    executions: HashMap<String, ExecutionRow>,
    logs: Vec<ExecutionLogRow>,
    alerts: Vec<AlertRow>,
    settings: HashMap<String, serde_json::Value>,
}

pub struct InMemoryDurableStore {
    tables: Mutex<Tables>,
    log_seq: AtomicI64,
    alert_seq: AtomicI64,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            log_seq: AtomicI64::new(1),
            alert_seq: AtomicI64::new(1),
        }
    }

    /// Number of log rows, for test assertions
    pub fn log_count(&self) -> usize {
        self.tables.lock().logs.len()
    }

    fn missing(what: &str, id: &str) -> DurableStoreError {
        DurableStoreError::RowMissing(format!("{what} {id}"))
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

fn aggregate_status(completed: i32, failed: i32) -> &'static str {
    if failed == 0 {
        "completed"
    } else if completed == 0 {
        "failed"
    } else {
        "partial"
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn upsert_node(&self, input: UpsertNode) -> Result<NodeRow, DurableStoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        let row = tables
            .nodes
            .entry(input.id.clone())
            .and_modify(|row| {
                if input.label.is_some() {
                    row.label = input.label.clone();
                }
                row.status = input.status.to_string();
                if input.network_addr.is_some() {
                    row.network_addr = input.network_addr.clone();
                }
                row.cpu = input.cpu;
                row.memory = input.memory;
                row.connected_devices = input.connected_devices;
                row.last_seen = input.last_seen;
                row.metadata = input.metadata.clone();
                row.updated_at = now;
            })
            .or_insert_with(|| NodeRow {
                id: input.id.clone(),
                label: input.label.clone(),
                status: input.status.to_string(),
                network_addr: input.network_addr.clone(),
                cpu: input.cpu,
                memory: input.memory,
                device_capacity: None,
                connected_devices: input.connected_devices,
                last_seen: input.last_seen,
                metadata: input.metadata.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(row.clone())
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeRow>, DurableStoreError> {
        Ok(self.tables.lock().nodes.get(id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRow>, DurableStoreError> {
        let mut rows: Vec<NodeRow> = self.tables.lock().nodes.values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn upsert_device(&self, input: UpsertDevice) -> Result<DeviceRow, DurableStoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        let row = tables
            .devices
            .entry(input.id.clone())
            .and_modify(|row| {
                if input.pc_id.is_some() {
                    row.pc_id = input.pc_id.clone();
                }
                if input.serial_number.is_some() {
                    row.serial_number = input.serial_number.clone();
                }
                if input.model.is_some() {
                    row.model = input.model.clone();
                }
                if input.android_version.is_some() {
                    row.android_version = input.android_version.clone();
                }
                if input.battery.is_some() {
                    row.battery = input.battery;
                }
                if input.ip_address.is_some() {
                    row.ip_address = input.ip_address.clone();
                }
                if input.usb_port.is_some() {
                    row.usb_port = input.usb_port.clone();
                }
                row.status = input.status.to_string();
                row.last_heartbeat = input.last_heartbeat;
                row.updated_at = now;
            })
            .or_insert_with(|| DeviceRow {
                id: input.id.clone(),
                pc_id: input.pc_id.clone(),
                device_number: None,
                serial_number: input.serial_number.clone(),
                model: input.model.clone(),
                android_version: input.android_version.clone(),
                battery: input.battery,
                ip_address: input.ip_address.clone(),
                connection_type: None,
                usb_port: input.usb_port.clone(),
                status: input.status.to_string(),
                error_count: 0,
                last_error: None,
                last_error_at: None,
                last_heartbeat: input.last_heartbeat,
                metadata: serde_json::Value::Null,
                created_at: now,
                updated_at: now,
            });
        Ok(row.clone())
    }

    async fn get_device(&self, id: &str) -> Result<Option<DeviceRow>, DurableStoreError> {
        Ok(self.tables.lock().devices.get(id).cloned())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRow>, DurableStoreError> {
        let mut rows: Vec<DeviceRow> = self.tables.lock().devices.values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn update_device_status_with_error(
        &self,
        device_id: &str,
        last_error: &str,
    ) -> Result<DeviceRow, DurableStoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        let row = tables
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Self::missing("device", device_id))?;
        row.error_count += 1;
        row.status = if row.error_count >= QUARANTINE_THRESHOLD as i32 {
            DeviceStatus::Quarantine.to_string()
        } else {
            DeviceStatus::Error.to_string()
        };
        row.last_error = Some(last_error.to_string());
        row.last_error_at = Some(now);
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn increment_device_error_count(
        &self,
        device_id: &str,
    ) -> Result<i32, DurableStoreError> {
        let mut tables = self.tables.lock();
        let row = tables
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Self::missing("device", device_id))?;
        row.error_count += 1;
        row.updated_at = Utc::now();
        Ok(row.error_count)
    }

    async fn set_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), DurableStoreError> {
        let mut tables = self.tables.lock();
        if let Some(row) = tables.devices.get_mut(device_id) {
            row.status = status.to_string();
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn upsert_device_state(
        &self,
        input: UpsertDeviceState,
    ) -> Result<DeviceStateRow, DurableStoreError> {
        let mut tables = self.tables.lock();
        let row = DeviceStateRow {
            device_id: input.device_id.clone(),
            node_id: input.node_id,
            state: input.state.to_string(),
            workflow_id: input.workflow_id,
            current_step: input.current_step,
            progress: input.progress,
            battery: input.battery,
            last_heartbeat: input.last_heartbeat,
        };
        tables
            .device_states
            .insert(input.device_id.clone(), row.clone());
        Ok(row)
    }

    async fn get_device_state(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceStateRow>, DurableStoreError> {
        Ok(self.tables.lock().device_states.get(device_id).cloned())
    }

    async fn create_workflow(
        &self,
        input: CreateWorkflow,
    ) -> Result<WorkflowRow, DurableStoreError> {
        let now = Utc::now();
        let row = WorkflowRow {
            id: input.id.clone(),
            name: input.name,
            description: input.description,
            category: input.category,
            version: 1,
            steps: input.steps,
            tags: input.tags,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.tables.lock().workflows.insert(input.id, row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRow>, DurableStoreError> {
        Ok(self.tables.lock().workflows.get(id).cloned())
    }

    async fn increment_workflow_version(&self, id: &str) -> Result<i32, DurableStoreError> {
        let mut tables = self.tables.lock();
        let row = tables
            .workflows
            .get_mut(id)
            .ok_or_else(|| Self::missing("workflow", id))?;
        row.version += 1;
        row.updated_at = Utc::now();
        Ok(row.version)
    }

    async fn insert_execution(
        &self,
        input: CreateExecution,
    ) -> Result<ExecutionRow, DurableStoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        // Idempotent by execution key
        if let Some(existing) = tables.executions.get(&input.execution_id) {
            return Ok(existing.clone());
        }
        let row = ExecutionRow {
            id: input.id,
            execution_id: input.execution_id.clone(),
            workflow_id: input.workflow_id,
            workflow_version: input.workflow_version,
            device_id: None,
            device_ids: input.device_ids,
            node_id: input.node_id,
            status: input.status.to_string(),
            params: input.params,
            result: None,
            error_message: None,
            current_step: None,
            progress: 0,
            total_devices: input.total_devices,
            completed_devices: 0,
            failed_devices: 0,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        tables
            .executions
            .insert(input.execution_id, row.clone());
        Ok(row)
    }

    async fn get_execution(
        &self,
        execution_key: &str,
    ) -> Result<Option<ExecutionRow>, DurableStoreError> {
        Ok(self.tables.lock().executions.get(execution_key).cloned())
    }

    async fn update_execution(
        &self,
        execution_key: &str,
        update: UpdateExecution,
    ) -> Result<Option<ExecutionRow>, DurableStoreError> {
        let mut tables = self.tables.lock();
        let Some(row) = tables.executions.get_mut(execution_key) else {
            return Ok(None);
        };
        if let Some(status) = update.status {
            row.status = status.to_string();
        }
        if let Some(step) = update.current_step {
            row.current_step = Some(step);
        }
        if let Some(progress) = update.progress {
            row.progress = progress;
        }
        if let Some(result) = update.result {
            row.result = Some(result);
        }
        if let Some(error) = update.error_message {
            row.error_message = Some(error);
        }
        if row.started_at.is_none() {
            row.started_at = update.started_at;
        }
        if let Some(at) = update.completed_at {
            row.completed_at = Some(at);
        }
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn list_running_executions(&self) -> Result<Vec<ExecutionRow>, DurableStoreError> {
        let mut rows: Vec<ExecutionRow> = self
            .tables
            .lock()
            .executions
            .values()
            .filter(|r| r.status == "running")
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn increment_execution_device_count(
        &self,
        execution_key: &str,
        count_type: CountType,
    ) -> Result<ExecutionCounts, DurableStoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        let row = tables
            .executions
            .get_mut(execution_key)
            .ok_or_else(|| Self::missing("execution", execution_key))?;
        match count_type {
            CountType::Completed => row.completed_devices += 1,
            CountType::Failed => row.failed_devices += 1,
        }
        let settled = row.completed_devices + row.failed_devices >= row.total_devices;
        let final_status = if settled {
            let status = aggregate_status(row.completed_devices, row.failed_devices);
            row.status = status.to_string();
            row.completed_at.get_or_insert(now);
            Some(status.to_string())
        } else {
            None
        };
        row.updated_at = now;
        Ok(ExecutionCounts {
            completed_devices: row.completed_devices,
            failed_devices: row.failed_devices,
            total_devices: row.total_devices,
            final_status,
        })
    }

    async fn insert_execution_log(
        &self,
        input: CreateExecutionLog,
    ) -> Result<(), DurableStoreError> {
        let row = ExecutionLogRow {
            id: self.log_seq.fetch_add(1, Ordering::Relaxed),
            execution_id: input.execution_id,
            device_id: input.device_id,
            workflow_id: input.workflow_id,
            step_id: input.step_id,
            level: input.level.as_str().to_string(),
            status: input.status.map(|s| s.as_str().to_string()),
            message: input.message,
            data: input.data,
            created_at: Utc::now(),
        };
        self.tables.lock().logs.push(row);
        Ok(())
    }

    async fn list_execution_logs(
        &self,
        execution_key: &str,
    ) -> Result<Vec<ExecutionLogRow>, DurableStoreError> {
        Ok(self
            .tables
            .lock()
            .logs
            .iter()
            .filter(|l| l.execution_id == execution_key)
            .cloned()
            .collect())
    }

    async fn insert_alert(&self, input: CreateAlert) -> Result<AlertRow, DurableStoreError> {
        let row = AlertRow {
            id: self.alert_seq.fetch_add(1, Ordering::Relaxed),
            level: input.level.to_string(),
            message: input.message,
            source: input.source,
            data: input.data,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            created_at: Utc::now(),
        };
        self.tables.lock().alerts.push(row.clone());
        Ok(row)
    }

    async fn acknowledge_alert(
        &self,
        id: i64,
        by: &str,
    ) -> Result<Option<AlertRow>, DurableStoreError> {
        let mut tables = self.tables.lock();
        let Some(row) = tables.alerts.iter_mut().find(|a| a.id == id) else {
            return Ok(None);
        };
        row.acknowledged = true;
        row.acknowledged_by = Some(by.to_string());
        row.acknowledged_at = Some(Utc::now());
        Ok(Some(row.clone()))
    }

    async fn list_active_alerts(&self) -> Result<Vec<AlertRow>, DurableStoreError> {
        Ok(self
            .tables
            .lock()
            .alerts
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect())
    }

    async fn get_setting(
        &self,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DurableStoreError> {
        Ok(self.tables.lock().settings.get(key).cloned())
    }

    async fn set_setting(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), DurableStoreError> {
        self.tables.lock().settings.insert(key.to_string(), value);
        Ok(())
    }

    async fn ping(&self) -> Result<(), DurableStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use droidfarm_core::execution::ExecutionStatus;
    use uuid::Uuid;

    fn device_input(id: &str) -> UpsertDevice {
        UpsertDevice {
            id: id.to_string(),
            pc_id: Some("node-1".into()),
            serial_number: Some(id.to_string()),
            model: None,
            android_version: None,
            battery: None,
            ip_address: None,
            usb_port: None,
            status: DeviceStatus::Idle,
            last_heartbeat: Some(Utc::now()),
        }
    }

    fn execution_input(key: &str, total: i32) -> CreateExecution {
        CreateExecution {
            id: Uuid::now_v7(),
            execution_id: key.to_string(),
            workflow_id: "wf-1".into(),
            workflow_version: Some(1),
            device_ids: (0..total).map(|i| format!("D{i}")).collect(),
            node_id: Some("node-1".into()),
            status: ExecutionStatus::Queued,
            params: serde_json::Value::Null,
            total_devices: total,
        }
    }

    #[tokio::test]
    async fn quarantine_exactly_at_threshold() {
        let store = InMemoryDurableStore::new();
        store.upsert_device(device_input("D1")).await.unwrap();

        let first = store
            .update_device_status_with_error("D1", "tap failed")
            .await
            .unwrap();
        assert_eq!(first.error_count, 1);
        assert_eq!(first.status, "ERROR");

        let second = store
            .update_device_status_with_error("D1", "tap failed")
            .await
            .unwrap();
        assert_eq!(second.status, "ERROR");

        let third = store
            .update_device_status_with_error("D1", "tap failed")
            .await
            .unwrap();
        assert_eq!(third.error_count, 3);
        assert_eq!(third.status, "QUARANTINE");
    }

    #[tokio::test]
    async fn concurrent_error_updates_quarantine_once() {
        // Two atomic updates racing from error_count=2: exactly one crosses
        // the threshold, both observe consistent post-images
        let store = Arc::new(InMemoryDurableStore::new());
        store.upsert_device(device_input("D1")).await.unwrap();
        store
            .update_device_status_with_error("D1", "e1")
            .await
            .unwrap();
        store
            .update_device_status_with_error("D1", "e2")
            .await
            .unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.update_device_status_with_error("D1", "e3").await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.update_device_status_with_error("D1", "e4").await })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        let crossed: Vec<_> = [&a, &b]
            .into_iter()
            .filter(|r| r.error_count == 3 && r.status == "QUARANTINE")
            .collect();
        assert_eq!(crossed.len(), 1, "exactly one update crosses the threshold");
        let final_row = store.get_device("D1").await.unwrap().unwrap();
        assert_eq!(final_row.error_count, 4);
        assert_eq!(final_row.status, "QUARANTINE");
    }

    #[tokio::test]
    async fn workflow_versions_never_collide() {
        let store = Arc::new(InMemoryDurableStore::new());
        store
            .create_workflow(CreateWorkflow {
                id: "wf-1".into(),
                name: "demo".into(),
                description: None,
                category: None,
                steps: serde_json::json!([]),
                tags: vec![],
            })
            .await
            .unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment_workflow_version("wf-1").await.unwrap()
            }));
        }
        let mut versions = vec![];
        for h in handles {
            versions.push(h.await.unwrap());
        }
        versions.sort_unstable();
        versions.dedup();
        assert_eq!(versions.len(), 8, "no two increments observe the same pre-image");
    }

    #[tokio::test]
    async fn device_counts_settle_into_aggregate_status() {
        let store = InMemoryDurableStore::new();
        store
            .insert_execution(execution_input("exec_1_aaaa", 3))
            .await
            .unwrap();

        let one = store
            .increment_execution_device_count("exec_1_aaaa", CountType::Completed)
            .await
            .unwrap();
        assert!(one.final_status.is_none());

        store
            .increment_execution_device_count("exec_1_aaaa", CountType::Failed)
            .await
            .unwrap();
        let last = store
            .increment_execution_device_count("exec_1_aaaa", CountType::Completed)
            .await
            .unwrap();

        assert_eq!(last.final_status.as_deref(), Some("partial"));
        assert_eq!(last.completed_devices + last.failed_devices, last.total_devices);

        let row = store.get_execution("exec_1_aaaa").await.unwrap().unwrap();
        assert_eq!(row.status, "partial");
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn insert_execution_is_idempotent_by_key() {
        let store = InMemoryDurableStore::new();
        let first = store
            .insert_execution(execution_input("exec_1_bbbb", 1))
            .await
            .unwrap();
        let second = store
            .insert_execution(execution_input("exec_1_bbbb", 1))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn update_execution_sets_started_at_only_once() {
        let store = InMemoryDurableStore::new();
        store
            .insert_execution(execution_input("exec_1_cccc", 1))
            .await
            .unwrap();

        let t1 = Utc::now();
        store
            .update_execution(
                "exec_1_cccc",
                UpdateExecution {
                    status: Some(ExecutionStatus::Running),
                    started_at: Some(t1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let t2 = t1 + chrono::Duration::seconds(10);
        let row = store
            .update_execution(
                "exec_1_cccc",
                UpdateExecution {
                    started_at: Some(t2),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.started_at, Some(t1));
    }
}
