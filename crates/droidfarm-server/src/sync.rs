//! SyncWriter: mirrors live events into the store of record
//!
//! A pure bus subscriber. Every event maps to fire-and-forget durable
//! writes: failures are logged and dropped, producers never block, and
//! mirrored rows are written latest-wins (events may arrive reordered).
//! Device counters go through the store's atomic RPCs so terminal counts
//! always satisfy completed + failed == total.

use std::sync::Arc;

use chrono::Utc;
use droidfarm_core::device::DeviceStatus;
use droidfarm_core::events::{EventBus, OrchestratorEvent};
use droidfarm_core::execution::{ExecutionAggregate, ExecutionStatus};
use droidfarm_core::log::{LogLevel, LogStatus};
use droidfarm_core::node::NodeStatus;
use droidfarm_durable::{
    CountType, CreateExecution, CreateExecutionLog, DurableStore, UpdateExecution, UpsertDeviceState,
    UpsertNode,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coordinator::SERVER_DEVICE;

pub struct SyncWriter {
    durable: Arc<dyn DurableStore>,
    bus: EventBus,
}

impl SyncWriter {
    pub fn new(durable: Arc<dyn DurableStore>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self { durable, bus })
    }

    /// Consume bus events until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut rx = self.bus.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    match event {
                        Ok(event) => {
                            let durable = self.durable.clone();
                            tokio::spawn(async move {
                                if let Err(e) = write_event(durable, event).await {
                                    warn!(error = %e, "sync write failed");
                                }
                            });
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "sync writer lagged on bus events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!("sync writer stopped");
    }
}

async fn write_event(
    durable: Arc<dyn DurableStore>,
    event: OrchestratorEvent,
) -> Result<(), droidfarm_durable::DurableStoreError> {
    match event {
        OrchestratorEvent::WorkflowStart {
            job_id,
            execution_key,
            workflow_id,
            workflow_version,
            node_id,
            device_ids,
            params,
        } => {
            durable
                .insert_execution(CreateExecution {
                    id: Uuid::now_v7(),
                    execution_id: execution_key.clone(),
                    workflow_id: workflow_id.clone(),
                    workflow_version: Some(workflow_version as i32),
                    device_ids: device_ids.clone(),
                    node_id: Some(node_id.clone()),
                    status: ExecutionStatus::Running,
                    params,
                    total_devices: device_ids.len() as i32,
                })
                .await?;
            durable
                .update_execution(
                    &execution_key,
                    UpdateExecution {
                        status: Some(ExecutionStatus::Running),
                        started_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            durable
                .insert_execution_log(CreateExecutionLog {
                    execution_id: execution_key.clone(),
                    device_id: None,
                    workflow_id: Some(workflow_id.clone()),
                    step_id: None,
                    level: LogLevel::Info,
                    status: Some(LogStatus::Started),
                    message: Some(format!("job {job_id} started on {node_id}")),
                    data: serde_json::Value::Null,
                })
                .await?;
            for device_id in device_ids {
                durable
                    .upsert_device_state(UpsertDeviceState {
                        device_id,
                        node_id: Some(node_id.clone()),
                        state: DeviceStatus::Running,
                        workflow_id: Some(workflow_id.clone()),
                        current_step: None,
                        progress: 0,
                        battery: None,
                        last_heartbeat: Some(Utc::now()),
                    })
                    .await?;
            }
        }

        OrchestratorEvent::WorkflowProgress {
            execution_key,
            device_id,
            current_step,
            progress,
            message,
            ..
        } => {
            durable
                .update_execution(
                    &execution_key,
                    UpdateExecution {
                        current_step: current_step.clone(),
                        progress: Some(progress as i32),
                        ..Default::default()
                    },
                )
                .await?;
            durable
                .insert_execution_log(CreateExecutionLog {
                    execution_id: execution_key,
                    device_id: (device_id != SERVER_DEVICE).then_some(device_id),
                    workflow_id: None,
                    step_id: current_step,
                    level: LogLevel::Debug,
                    status: Some(LogStatus::Progress),
                    message,
                    data: serde_json::json!({ "progress": progress }),
                })
                .await?;
        }

        OrchestratorEvent::WorkflowComplete {
            execution_key,
            aggregate,
            ..
        } => {
            write_aggregate(&durable, &execution_key, &aggregate).await?;
        }

        OrchestratorEvent::WorkflowError {
            execution_key,
            device_id,
            step_id,
            error,
            retry_count,
            ..
        } => {
            durable
                .insert_execution_log(CreateExecutionLog {
                    execution_id: execution_key,
                    device_id: Some(device_id.clone()),
                    workflow_id: None,
                    step_id,
                    level: LogLevel::Error,
                    status: Some(LogStatus::Failed),
                    message: Some(error.clone()),
                    data: serde_json::json!({ "retry_count": retry_count }),
                })
                .await?;
            durable
                .update_device_status_with_error(&device_id, &error)
                .await?;
        }

        OrchestratorEvent::JobFailed {
            execution_key,
            error,
            will_retry,
            ..
        } => {
            if will_retry {
                durable
                    .insert_execution_log(CreateExecutionLog {
                        execution_id: execution_key,
                        device_id: None,
                        workflow_id: None,
                        step_id: None,
                        level: LogLevel::Warn,
                        status: Some(LogStatus::Retrying),
                        message: Some(error),
                        data: serde_json::Value::Null,
                    })
                    .await?;
            } else {
                durable
                    .update_execution(
                        &execution_key,
                        UpdateExecution {
                            status: Some(ExecutionStatus::Failed),
                            error_message: Some(error.clone()),
                            completed_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                durable
                    .insert_execution_log(CreateExecutionLog {
                        execution_id: execution_key,
                        device_id: None,
                        workflow_id: None,
                        step_id: None,
                        level: LogLevel::Error,
                        status: Some(LogStatus::Failed),
                        message: Some(error),
                        data: serde_json::Value::Null,
                    })
                    .await?;
            }
        }

        OrchestratorEvent::NodeRegistered { node_id } => {
            durable
                .upsert_node(UpsertNode {
                    id: node_id,
                    label: None,
                    status: NodeStatus::Online,
                    network_addr: None,
                    cpu: 0.0,
                    memory: 0.0,
                    connected_devices: 0,
                    last_seen: Some(Utc::now()),
                    metadata: serde_json::Value::Null,
                })
                .await?;
        }

        OrchestratorEvent::NodeDisconnected { node_id } => {
            durable
                .upsert_node(UpsertNode {
                    id: node_id,
                    label: None,
                    status: NodeStatus::Offline,
                    network_addr: None,
                    cpu: 0.0,
                    memory: 0.0,
                    connected_devices: 0,
                    last_seen: Some(Utc::now()),
                    metadata: serde_json::Value::Null,
                })
                .await?;
        }

        OrchestratorEvent::DeviceUpdated { device_id, status } => {
            // Latest-wins device mirror; keeps the devices table in step with
            // the live view without compare-and-set
            durable
                .upsert_device(droidfarm_durable::UpsertDevice {
                    id: device_id.clone(),
                    pc_id: None,
                    serial_number: Some(device_id),
                    model: None,
                    android_version: None,
                    battery: None,
                    ip_address: None,
                    usb_port: None,
                    status,
                    last_heartbeat: Some(Utc::now()),
                })
                .await?;
        }

        // Everything else is either telemetry the AlertManager owns or
        // in-process bookkeeping with no durable counterpart
        _ => {}
    }
    Ok(())
}

/// Terminal aggregate: atomic per-device counters, per-device logs, device
/// state mirror, then the latest-wins execution row update
async fn write_aggregate(
    durable: &Arc<dyn DurableStore>,
    execution_key: &str,
    aggregate: &ExecutionAggregate,
) -> Result<(), droidfarm_durable::DurableStoreError> {
    for outcome in &aggregate.outcomes {
        let count_type = if outcome.success {
            CountType::Completed
        } else {
            CountType::Failed
        };
        durable
            .increment_execution_device_count(execution_key, count_type)
            .await?;

        durable
            .insert_execution_log(CreateExecutionLog {
                execution_id: execution_key.to_string(),
                device_id: Some(outcome.device_id.clone()),
                workflow_id: None,
                step_id: None,
                level: if outcome.success {
                    LogLevel::Info
                } else {
                    LogLevel::Error
                },
                status: Some(if outcome.success {
                    LogStatus::Completed
                } else {
                    LogStatus::Failed
                }),
                message: outcome.error.clone(),
                data: serde_json::json!({ "duration_ms": outcome.duration_ms }),
            })
            .await?;

        durable
            .upsert_device_state(UpsertDeviceState {
                device_id: outcome.device_id.clone(),
                node_id: None,
                state: if outcome.success {
                    DeviceStatus::Idle
                } else {
                    DeviceStatus::Error
                },
                workflow_id: None,
                current_step: None,
                progress: 100,
                battery: None,
                last_heartbeat: Some(Utc::now()),
            })
            .await?;
    }

    durable
        .update_execution(
            execution_key,
            UpdateExecution {
                status: Some(aggregate.status),
                result: Some(serde_json::to_value(&aggregate.outcomes).unwrap_or_default()),
                error_message: aggregate.first_error().map(String::from),
                completed_at: Some(Utc::now()),
                progress: Some(100),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidfarm_core::execution::DeviceOutcome;
    use droidfarm_durable::InMemoryDurableStore;

    async fn start_writer() -> (Arc<InMemoryDurableStore>, EventBus, CancellationToken) {
        let durable = Arc::new(InMemoryDurableStore::new());
        let bus = EventBus::new();
        let writer = SyncWriter::new(durable.clone(), bus.clone());
        let shutdown = CancellationToken::new();
        tokio::spawn(writer.run(shutdown.clone()));
        tokio::task::yield_now().await;
        (durable, bus, shutdown)
    }

    async fn settle() {
        // bus delivery + spawned write
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn workflow_start_inserts_execution_and_devices() {
        let (durable, bus, _guard) = start_writer().await;

        bus.emit(OrchestratorEvent::WorkflowStart {
            job_id: "J1".into(),
            execution_key: "exec_1_syncstart".into(),
            workflow_id: "wf-1".into(),
            workflow_version: 2,
            node_id: "N1".into(),
            device_ids: vec!["D1".into(), "D2".into()],
            params: serde_json::Value::Null,
        });
        settle().await;

        let row = durable
            .get_execution("exec_1_syncstart")
            .await
            .unwrap()
            .expect("execution row");
        assert_eq!(row.status, "running");
        assert_eq!(row.total_devices, 2);
        assert!(row.started_at.is_some());

        let d1 = durable.get_device_state("D1").await.unwrap().unwrap();
        assert_eq!(d1.state, "RUNNING");
        assert_eq!(durable.log_count(), 1);
    }

    #[tokio::test]
    async fn aggregate_settles_counts_and_status() {
        let (durable, bus, _guard) = start_writer().await;

        bus.emit(OrchestratorEvent::WorkflowStart {
            job_id: "J1".into(),
            execution_key: "exec_1_syncagg".into(),
            workflow_id: "wf-1".into(),
            workflow_version: 1,
            node_id: "N1".into(),
            device_ids: vec!["D1".into(), "D2".into(), "D3".into()],
            params: serde_json::Value::Null,
        });
        settle().await;

        let aggregate = ExecutionAggregate::from_outcomes(vec![
            DeviceOutcome::success("D1"),
            DeviceOutcome::failure("D2", "tap failed"),
            DeviceOutcome::success("D3"),
        ]);
        bus.emit(OrchestratorEvent::WorkflowComplete {
            job_id: "J1".into(),
            execution_key: "exec_1_syncagg".into(),
            aggregate,
        });
        settle().await;

        let row = durable
            .get_execution("exec_1_syncagg")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "partial");
        assert_eq!(row.completed_devices, 2);
        assert_eq!(row.failed_devices, 1);
        assert_eq!(
            row.completed_devices + row.failed_devices,
            row.total_devices
        );
        assert!(row.completed_at.is_some());
        assert_eq!(row.error_message.as_deref(), Some("tap failed"));

        let d2 = durable.get_device_state("D2").await.unwrap().unwrap();
        assert_eq!(d2.state, "ERROR");
    }

    #[tokio::test]
    async fn final_job_failure_closes_execution() {
        let (durable, bus, _guard) = start_writer().await;

        bus.emit(OrchestratorEvent::WorkflowStart {
            job_id: "J1".into(),
            execution_key: "exec_1_syncfail".into(),
            workflow_id: "wf-1".into(),
            workflow_version: 1,
            node_id: "N1".into(),
            device_ids: vec!["D1".into()],
            params: serde_json::Value::Null,
        });
        settle().await;

        bus.emit(OrchestratorEvent::JobFailed {
            queue: "workflow:N1".into(),
            job_id: "J1".into(),
            execution_key: "exec_1_syncfail".into(),
            error: "job timeout: node N1 never delivered outcomes for J1 (orphaned)".into(),
            will_retry: false,
        });
        settle().await;

        let row = durable
            .get_execution("exec_1_syncfail")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "failed");
        assert!(row.error_message.unwrap().contains("timeout"));
        assert!(row.completed_at.is_some());
    }
}
