//! PostgreSQL implementation of DurableStore
//!
//! Counter operations call the native SQL functions from the migration
//! first. When a deployment lacks them (error code 42883), the adapter
//! branches on the typed code and falls back to compare-and-set with bounded
//! attempts and `10ms x attempt` backoff.

use std::time::Duration;

use async_trait::async_trait;
use droidfarm_core::device::{DeviceStatus, QUARANTINE_THRESHOLD};
use sqlx::postgres::PgPool;
use tracing::{debug, instrument, warn};

use crate::models::*;
use crate::store::{
    DurableStore, DurableStoreError, ExecutionCounts, CAS_BACKOFF_MS, CAS_MAX_ATTEMPTS,
};

#[derive(Clone)]
pub struct PostgresDurableStore {
    pool: PgPool,
}

fn db_err(e: sqlx::Error) -> DurableStoreError {
    DurableStoreError::Database(e.to_string())
}

/// Typed detection of a missing SQL function (undefined_function, 42883)
fn is_undefined_function(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("42883")
    )
}

/// Aggregate rule shared with the SQL function
fn aggregate_status(completed: i32, failed: i32) -> &'static str {
    if failed == 0 {
        "completed"
    } else if completed == 0 {
        "failed"
    } else {
        "partial"
    }
}

#[derive(sqlx::FromRow)]
struct CountsRow {
    completed_devices: i32,
    failed_devices: i32,
    total_devices: i32,
    final_status: Option<String>,
}

impl PostgresDurableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database; fails fast when unreachable
    pub async fn connect(database_url: &str) -> Result<Self, DurableStoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        Ok(Self { pool })
    }

    /// Apply embedded migrations
    pub async fn migrate(&self) -> Result<(), DurableStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DurableStoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn cas_backoff(attempt: u32) {
        tokio::time::sleep(Duration::from_millis(CAS_BACKOFF_MS * attempt as u64)).await;
    }

    #[instrument(skip(self))]
    async fn increment_workflow_version_cas(
        &self,
        id: &str,
    ) -> Result<i32, DurableStoreError> {
        for attempt in 1..=CAS_MAX_ATTEMPTS {
            let current: Option<i32> =
                sqlx::query_scalar("SELECT version FROM workflows WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_err)?;
            let Some(current) = current else {
                return Err(DurableStoreError::RowMissing(format!("workflow {id}")));
            };

            let updated = sqlx::query(
                "UPDATE workflows SET version = $1, updated_at = now() \
                 WHERE id = $2 AND version = $3",
            )
            .bind(current + 1)
            .bind(id)
            .bind(current)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            if updated.rows_affected() == 1 {
                return Ok(current + 1);
            }
            debug!(id, attempt, "workflow version CAS conflict, retrying");
            Self::cas_backoff(attempt).await;
        }
        Err(DurableStoreError::ConcurrencyExhausted {
            operation: "increment_workflow_version",
            attempts: CAS_MAX_ATTEMPTS,
        })
    }

    #[instrument(skip(self, last_error))]
    async fn update_device_status_with_error_cas(
        &self,
        device_id: &str,
        last_error: &str,
    ) -> Result<DeviceRow, DurableStoreError> {
        for attempt in 1..=CAS_MAX_ATTEMPTS {
            let device = self
                .get_device(device_id)
                .await?
                .ok_or_else(|| DurableStoreError::RowMissing(format!("device {device_id}")))?;

            let new_count = device.error_count + 1;
            let new_status = if new_count >= QUARANTINE_THRESHOLD as i32 {
                DeviceStatus::Quarantine
            } else {
                DeviceStatus::Error
            };

            let row = sqlx::query_as::<_, DeviceRow>(
                r#"
                UPDATE devices
                   SET error_count = $1, status = $2, last_error = $3,
                       last_error_at = now(), updated_at = now()
                 WHERE id = $4 AND error_count = $5
                RETURNING *
                "#,
            )
            .bind(new_count)
            .bind(new_status.to_string())
            .bind(last_error)
            .bind(device_id)
            .bind(device.error_count)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(row) = row {
                return Ok(row);
            }
            debug!(device_id, attempt, "device error CAS conflict, retrying");
            Self::cas_backoff(attempt).await;
        }
        Err(DurableStoreError::ConcurrencyExhausted {
            operation: "update_device_status_with_error",
            attempts: CAS_MAX_ATTEMPTS,
        })
    }

    #[instrument(skip(self))]
    async fn increment_execution_device_count_cas(
        &self,
        execution_key: &str,
        count_type: CountType,
    ) -> Result<ExecutionCounts, DurableStoreError> {
        for attempt in 1..=CAS_MAX_ATTEMPTS {
            let row = self.get_execution(execution_key).await?.ok_or_else(|| {
                DurableStoreError::RowMissing(format!("execution {execution_key}"))
            })?;

            let (new_completed, new_failed) = match count_type {
                CountType::Completed => (row.completed_devices + 1, row.failed_devices),
                CountType::Failed => (row.completed_devices, row.failed_devices + 1),
            };
            let settled = new_completed + new_failed >= row.total_devices;
            let final_status =
                settled.then(|| aggregate_status(new_completed, new_failed).to_string());

            let updated = sqlx::query(
                r#"
                UPDATE workflow_executions
                   SET completed_devices = $1,
                       failed_devices = $2,
                       status = COALESCE($3, status),
                       completed_at = CASE WHEN $3 IS NOT NULL
                                           THEN COALESCE(completed_at, now())
                                           ELSE completed_at END,
                       updated_at = now()
                 WHERE execution_id = $4
                   AND completed_devices = $5 AND failed_devices = $6
                "#,
            )
            .bind(new_completed)
            .bind(new_failed)
            .bind(final_status.as_deref())
            .bind(execution_key)
            .bind(row.completed_devices)
            .bind(row.failed_devices)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            if updated.rows_affected() == 1 {
                return Ok(ExecutionCounts {
                    completed_devices: new_completed,
                    failed_devices: new_failed,
                    total_devices: row.total_devices,
                    final_status,
                });
            }
            debug!(execution_key, attempt, "execution count CAS conflict, retrying");
            Self::cas_backoff(attempt).await;
        }
        Err(DurableStoreError::ConcurrencyExhausted {
            operation: "increment_execution_device_count",
            attempts: CAS_MAX_ATTEMPTS,
        })
    }
}

#[async_trait]
impl DurableStore for PostgresDurableStore {
    async fn upsert_node(&self, input: UpsertNode) -> Result<NodeRow, DurableStoreError> {
        sqlx::query_as::<_, NodeRow>(
            r#"
            INSERT INTO nodes (id, label, status, network_addr, cpu, memory,
                               connected_devices, last_seen, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                label = COALESCE(EXCLUDED.label, nodes.label),
                status = EXCLUDED.status,
                network_addr = COALESCE(EXCLUDED.network_addr, nodes.network_addr),
                cpu = EXCLUDED.cpu,
                memory = EXCLUDED.memory,
                connected_devices = EXCLUDED.connected_devices,
                last_seen = EXCLUDED.last_seen,
                metadata = EXCLUDED.metadata,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(&input.id)
        .bind(&input.label)
        .bind(input.status.to_string())
        .bind(&input.network_addr)
        .bind(input.cpu)
        .bind(input.memory)
        .bind(input.connected_devices)
        .bind(input.last_seen)
        .bind(&input.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeRow>, DurableStoreError> {
        sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRow>, DurableStoreError> {
        sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn upsert_device(&self, input: UpsertDevice) -> Result<DeviceRow, DurableStoreError> {
        sqlx::query_as::<_, DeviceRow>(
            r#"
            INSERT INTO devices (id, pc_id, serial_number, model, android_version,
                                 battery, ip_address, usb_port, status, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                pc_id = COALESCE(EXCLUDED.pc_id, devices.pc_id),
                serial_number = COALESCE(EXCLUDED.serial_number, devices.serial_number),
                model = COALESCE(EXCLUDED.model, devices.model),
                android_version = COALESCE(EXCLUDED.android_version, devices.android_version),
                battery = COALESCE(EXCLUDED.battery, devices.battery),
                ip_address = COALESCE(EXCLUDED.ip_address, devices.ip_address),
                usb_port = COALESCE(EXCLUDED.usb_port, devices.usb_port),
                status = EXCLUDED.status,
                last_heartbeat = EXCLUDED.last_heartbeat,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(&input.id)
        .bind(&input.pc_id)
        .bind(&input.serial_number)
        .bind(&input.model)
        .bind(&input.android_version)
        .bind(input.battery)
        .bind(&input.ip_address)
        .bind(&input.usb_port)
        .bind(input.status.to_string())
        .bind(input.last_heartbeat)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_device(&self, id: &str) -> Result<Option<DeviceRow>, DurableStoreError> {
        sqlx::query_as::<_, DeviceRow>("SELECT * FROM devices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRow>, DurableStoreError> {
        sqlx::query_as::<_, DeviceRow>("SELECT * FROM devices ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn update_device_status_with_error(
        &self,
        device_id: &str,
        last_error: &str,
    ) -> Result<DeviceRow, DurableStoreError> {
        let native = sqlx::query_as::<_, DeviceRow>(
            "SELECT * FROM update_device_status_with_error($1, $2)",
        )
        .bind(device_id)
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await;

        match native {
            Ok(Some(row)) => Ok(row),
            Ok(None) => Err(DurableStoreError::RowMissing(format!("device {device_id}"))),
            Err(e) if is_undefined_function(&e) => {
                warn!("update_device_status_with_error function missing, using CAS fallback");
                self.update_device_status_with_error_cas(device_id, last_error)
                    .await
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn increment_device_error_count(
        &self,
        device_id: &str,
    ) -> Result<i32, DurableStoreError> {
        let native = sqlx::query_scalar::<_, i32>("SELECT increment_device_error_count($1)")
            .bind(device_id)
            .fetch_one(&self.pool)
            .await;

        match native {
            Ok(count) => Ok(count),
            Err(e) if is_undefined_function(&e) => {
                // A plain arithmetic update is already atomic; no CAS needed
                let count: Option<i32> = sqlx::query_scalar(
                    "UPDATE devices SET error_count = error_count + 1, updated_at = now() \
                     WHERE id = $1 RETURNING error_count",
                )
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
                count.ok_or_else(|| DurableStoreError::RowMissing(format!("device {device_id}")))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn set_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), DurableStoreError> {
        sqlx::query("UPDATE devices SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.to_string())
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_device_state(
        &self,
        input: UpsertDeviceState,
    ) -> Result<DeviceStateRow, DurableStoreError> {
        sqlx::query_as::<_, DeviceStateRow>(
            r#"
            INSERT INTO device_states (device_id, node_id, state, workflow_id,
                                       current_step, progress, battery, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (device_id) DO UPDATE SET
                node_id = EXCLUDED.node_id,
                state = EXCLUDED.state,
                workflow_id = EXCLUDED.workflow_id,
                current_step = EXCLUDED.current_step,
                progress = EXCLUDED.progress,
                battery = COALESCE(EXCLUDED.battery, device_states.battery),
                last_heartbeat = EXCLUDED.last_heartbeat
            RETURNING *
            "#,
        )
        .bind(&input.device_id)
        .bind(&input.node_id)
        .bind(input.state.to_string())
        .bind(&input.workflow_id)
        .bind(&input.current_step)
        .bind(input.progress)
        .bind(input.battery)
        .bind(input.last_heartbeat)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_device_state(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceStateRow>, DurableStoreError> {
        sqlx::query_as::<_, DeviceStateRow>("SELECT * FROM device_states WHERE device_id = $1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn create_workflow(
        &self,
        input: CreateWorkflow,
    ) -> Result<WorkflowRow, DurableStoreError> {
        sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO workflows (id, name, description, category, steps, tags)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&input.id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(&input.category)
        .bind(&input.steps)
        .bind(&input.tags)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRow>, DurableStoreError> {
        sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn increment_workflow_version(&self, id: &str) -> Result<i32, DurableStoreError> {
        let native = sqlx::query_scalar::<_, i32>("SELECT increment_workflow_version($1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await;

        match native {
            Ok(version) => Ok(version),
            Err(e) if is_undefined_function(&e) => {
                warn!("increment_workflow_version function missing, using CAS fallback");
                self.increment_workflow_version_cas(id).await
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn insert_execution(
        &self,
        input: CreateExecution,
    ) -> Result<ExecutionRow, DurableStoreError> {
        let inserted = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO workflow_executions
                (id, execution_id, workflow_id, workflow_version, device_ids,
                 node_id, status, params, total_devices)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (execution_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(input.id)
        .bind(&input.execution_id)
        .bind(&input.workflow_id)
        .bind(input.workflow_version)
        .bind(&input.device_ids)
        .bind(&input.node_id)
        .bind(input.status.to_string())
        .bind(&input.params)
        .bind(input.total_devices)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        // Idempotent by execution key: a repeat insert returns the existing row
        match inserted {
            Some(row) => Ok(row),
            None => self.get_execution(&input.execution_id).await?.ok_or_else(|| {
                DurableStoreError::Database(format!(
                    "execution {} vanished during idempotent insert",
                    input.execution_id
                ))
            }),
        }
    }

    async fn get_execution(
        &self,
        execution_key: &str,
    ) -> Result<Option<ExecutionRow>, DurableStoreError> {
        sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM workflow_executions WHERE execution_id = $1",
        )
        .bind(execution_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn update_execution(
        &self,
        execution_key: &str,
        update: UpdateExecution,
    ) -> Result<Option<ExecutionRow>, DurableStoreError> {
        sqlx::query_as::<_, ExecutionRow>(
            r#"
            UPDATE workflow_executions SET
                status = COALESCE($1, status),
                current_step = COALESCE($2, current_step),
                progress = COALESCE($3, progress),
                result = COALESCE($4, result),
                error_message = COALESCE($5, error_message),
                started_at = COALESCE(started_at, $6),
                completed_at = COALESCE($7, completed_at),
                updated_at = now()
            WHERE execution_id = $8
            RETURNING *
            "#,
        )
        .bind(update.status.map(|s| s.to_string()))
        .bind(&update.current_step)
        .bind(update.progress)
        .bind(&update.result)
        .bind(&update.error_message)
        .bind(update.started_at)
        .bind(update.completed_at)
        .bind(execution_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_running_executions(&self) -> Result<Vec<ExecutionRow>, DurableStoreError> {
        sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM workflow_executions WHERE status = 'running' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn increment_execution_device_count(
        &self,
        execution_key: &str,
        count_type: CountType,
    ) -> Result<ExecutionCounts, DurableStoreError> {
        let native = sqlx::query_as::<_, CountsRow>(
            "SELECT * FROM increment_execution_device_count($1, $2)",
        )
        .bind(execution_key)
        .bind(count_type.as_str())
        .fetch_one(&self.pool)
        .await;

        match native {
            Ok(row) => Ok(ExecutionCounts {
                completed_devices: row.completed_devices,
                failed_devices: row.failed_devices,
                total_devices: row.total_devices,
                final_status: row.final_status,
            }),
            Err(e) if is_undefined_function(&e) => {
                warn!("increment_execution_device_count function missing, using CAS fallback");
                self.increment_execution_device_count_cas(execution_key, count_type)
                    .await
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn insert_execution_log(
        &self,
        input: CreateExecutionLog,
    ) -> Result<(), DurableStoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs
                (execution_id, device_id, workflow_id, step_id, level, status, message, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&input.execution_id)
        .bind(&input.device_id)
        .bind(&input.workflow_id)
        .bind(&input.step_id)
        .bind(input.level.as_str())
        .bind(input.status.map(|s| s.as_str()))
        .bind(&input.message)
        .bind(&input.data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_execution_logs(
        &self,
        execution_key: &str,
    ) -> Result<Vec<ExecutionLogRow>, DurableStoreError> {
        sqlx::query_as::<_, ExecutionLogRow>(
            "SELECT * FROM execution_logs WHERE execution_id = $1 ORDER BY id",
        )
        .bind(execution_key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn insert_alert(&self, input: CreateAlert) -> Result<AlertRow, DurableStoreError> {
        sqlx::query_as::<_, AlertRow>(
            r#"
            INSERT INTO alerts (level, message, source, data)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(input.level.to_string())
        .bind(&input.message)
        .bind(&input.source)
        .bind(&input.data)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn acknowledge_alert(
        &self,
        id: i64,
        by: &str,
    ) -> Result<Option<AlertRow>, DurableStoreError> {
        sqlx::query_as::<_, AlertRow>(
            r#"
            UPDATE alerts
               SET acknowledged = TRUE, acknowledged_by = $1, acknowledged_at = now()
             WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(by)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_active_alerts(&self) -> Result<Vec<AlertRow>, DurableStoreError> {
        sqlx::query_as::<_, AlertRow>(
            "SELECT * FROM alerts WHERE acknowledged = FALSE ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_setting(
        &self,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DurableStoreError> {
        sqlx::query_scalar::<_, serde_json::Value>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn set_setting(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), DurableStoreError> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), DurableStoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(db_err)
    }
}

