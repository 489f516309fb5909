//! StateManager: the live view of the fleet
//!
//! Sole writer of `live:node:*`, `live:device:*` and `live:execution:*`.
//! Every mutation pipelines into one commit, publishes a typed event on the
//! in-process bus, and mirrors a JSON payload onto the Redis state channel
//! for external consumers (fire-and-forget).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use droidfarm_core::device::{DeviceState, DeviceStateUpdate, DeviceStatus, QUARANTINE_THRESHOLD};
use droidfarm_core::execution::WorkflowExecution;
use droidfarm_core::node::{NodeState, NodeStateUpdate, NodeStatus, SystemGauges};
use droidfarm_core::events::{EventBus, OrchestratorEvent};
use droidfarm_live::{hash, keys, LiveStore, LiveStoreError, PipelineOp};
use droidfarm_proto::DeviceReport;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Terminal executions linger in the live store this long
const EXECUTION_TTL: Duration = Duration::from_secs(30 * 60);

/// COMPLETED is transient; devices decay to IDLE after this
const COMPLETED_DECAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct StateManager {
    live: Arc<dyn LiveStore>,
    bus: EventBus,
    /// Serialises error accounting per device (increment + threshold check
    /// must be one atomic step)
    device_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl StateManager {
    pub fn new(live: Arc<dyn LiveStore>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            live,
            bus,
            device_locks: Arc::new(DashMap::new()),
        })
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.device_locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Mirror an event onto the Redis state channel; never blocks the caller
    fn publish_state_change(&self, event: &OrchestratorEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        let live = self.live.clone();
        let kind = event.kind();
        tokio::spawn(async move {
            if let Err(e) = live.publish(keys::CHANNEL_STATE, &payload).await {
                debug!(kind, error = %e, "state channel publish failed");
            }
        });
    }

    fn emit(&self, event: OrchestratorEvent) {
        self.publish_state_change(&event);
        self.bus.emit(event);
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Create (or revive) a node with its reported devices, all IDLE
    #[instrument(skip(self, device_ids))]
    pub async fn register_node(
        &self,
        node_id: &str,
        device_ids: &[String],
    ) -> Result<NodeState, LiveStoreError> {
        let now = Utc::now();
        let mut node = match self.get_node_state(node_id).await? {
            Some(mut existing) => {
                existing.status = NodeStatus::Online;
                existing.last_seen = now;
                existing
            }
            None => NodeState::registered(node_id, now),
        };
        node.connected_devices = device_ids.len() as u32;

        let mut ops = vec![
            PipelineOp::HSet {
                key: keys::node(node_id),
                fields: hash::node_to_hash(&node),
            },
            PipelineOp::ZAdd {
                key: keys::HEARTBEAT.to_string(),
                member: node_id.to_string(),
                score: now.timestamp_millis() as f64,
            },
        ];
        for device_id in device_ids {
            let device = DeviceState::discovered(device_id, node_id, now);
            ops.push(PipelineOp::HSet {
                key: keys::device(device_id),
                fields: hash::device_to_hash(&device),
            });
            ops.push(PipelineOp::SAdd {
                key: keys::node_devices(node_id),
                member: device_id.clone(),
            });
            ops.push(PipelineOp::SAdd {
                key: keys::DEVICES_INDEX.to_string(),
                member: device_id.clone(),
            });
        }
        self.live.pipeline(ops).await?;

        self.emit(OrchestratorEvent::NodeRegistered {
            node_id: node_id.to_string(),
        });
        Ok(node)
    }

    /// Apply a partial update; `last_seen` defaults to now
    pub async fn update_node_state(
        &self,
        node_id: &str,
        update: NodeStateUpdate,
    ) -> Result<NodeState, LiveStoreError> {
        let now = Utc::now();
        let mut node = self
            .get_node_state(node_id)
            .await?
            .unwrap_or_else(|| NodeState::registered(node_id, now));
        update.apply(&mut node, now);

        self.live
            .pipeline(vec![
                PipelineOp::HSet {
                    key: keys::node(node_id),
                    fields: hash::node_to_hash(&node),
                },
                PipelineOp::ZAdd {
                    key: keys::HEARTBEAT.to_string(),
                    member: node_id.to_string(),
                    score: node.last_seen.timestamp_millis() as f64,
                },
            ])
            .await?;
        Ok(node)
    }

    /// Liveness signal: online, fresh heartbeat
    pub async fn heartbeat(&self, node_id: &str) -> Result<(), LiveStoreError> {
        self.update_node_state(
            node_id,
            NodeStateUpdate {
                status: Some(NodeStatus::Online),
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Ingest one DEVICE_STATUS heartbeat: refresh node gauges and walk the
    /// reported devices (first report of a device creates it IDLE;
    /// DISCONNECTED devices listed again come back as IDLE).
    pub async fn heartbeat_devices(
        &self,
        node_id: &str,
        devices: &[DeviceReport],
        system: Option<SystemGauges>,
    ) -> Result<(), LiveStoreError> {
        self.update_node_state(
            node_id,
            NodeStateUpdate {
                status: Some(NodeStatus::Online),
                system,
                connected_devices: Some(devices.len() as u32),
                ..Default::default()
            },
        )
        .await?;

        for report in devices {
            let current = self.get_device_state(&report.device_id).await?;
            let revive = match &current {
                Some(d) => d.status == DeviceStatus::Disconnected,
                None => true,
            };
            self.update_device_state(
                &report.device_id,
                DeviceStateUpdate {
                    node_id: Some(Some(node_id.to_string())),
                    status: revive.then_some(DeviceStatus::Idle),
                    model: report.model.clone(),
                    android_version: report.android_version.clone(),
                    battery: report.battery,
                    ip_address: report.ip_address.clone(),
                    usb_port: report.usb_port.clone(),
                    ..Default::default()
                },
            )
            .await?;
            self.live
                .sadd(&keys::node_devices(node_id), &report.device_id)
                .await?;
        }
        Ok(())
    }

    /// Node is gone: offline, heartbeat entry removed, devices DISCONNECTED
    #[instrument(skip(self))]
    pub async fn disconnect_node(&self, node_id: &str) -> Result<(), LiveStoreError> {
        let now = Utc::now();
        let device_ids = self.live.smembers(&keys::node_devices(node_id)).await?;

        let mut ops = vec![PipelineOp::ZRem {
            key: keys::HEARTBEAT.to_string(),
            member: node_id.to_string(),
        }];
        if let Some(mut node) = self.get_node_state(node_id).await? {
            node.status = NodeStatus::Offline;
            node.last_seen = now;
            ops.push(PipelineOp::HSet {
                key: keys::node(node_id),
                fields: hash::node_to_hash(&node),
            });
        }
        self.live.pipeline(ops).await?;

        for device_id in &device_ids {
            self.update_device_state(
                device_id,
                DeviceStateUpdate::status(DeviceStatus::Disconnected),
            )
            .await?;
        }

        self.emit(OrchestratorEvent::NodeDisconnected {
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Apply a partial device update, auto-creating the entry when absent
    pub async fn update_device_state(
        &self,
        device_id: &str,
        update: DeviceStateUpdate,
    ) -> Result<DeviceState, LiveStoreError> {
        let now = Utc::now();
        let mut device = match self.get_device_state(device_id).await? {
            Some(d) => d,
            None => {
                let mut fresh = DeviceState::discovered(device_id, "", now);
                fresh.node_id = None;
                fresh
            }
        };
        let next_status = update.status;
        update.apply(&mut device, now);

        self.live
            .pipeline(vec![
                PipelineOp::HSet {
                    key: keys::device(device_id),
                    fields: hash::device_to_hash(&device),
                },
                PipelineOp::SAdd {
                    key: keys::DEVICES_INDEX.to_string(),
                    member: device_id.to_string(),
                },
            ])
            .await?;

        self.emit(OrchestratorEvent::DeviceUpdated {
            device_id: device_id.to_string(),
            status: device.status,
        });

        if next_status == Some(DeviceStatus::Completed) {
            self.schedule_completed_decay(device_id);
        }
        Ok(device)
    }

    /// COMPLETED -> IDLE after one second, unless something else moved first
    fn schedule_completed_decay(&self, device_id: &str) {
        let manager = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(COMPLETED_DECAY).await;
            let still_completed = matches!(
                manager.get_device_state(&device_id).await,
                Ok(Some(d)) if d.status == DeviceStatus::Completed
            );
            if still_completed {
                if let Err(e) = manager
                    .update_device_state(&device_id, DeviceStateUpdate::status(DeviceStatus::Idle))
                    .await
                {
                    warn!(%device_id, error = %e, "completed decay failed");
                }
            }
        });
    }

    /// Atomic error accounting: increment + quarantine-threshold check under
    /// the device's lock. Returns the post-state.
    #[instrument(skip(self, message))]
    pub async fn record_device_error(
        &self,
        device_id: &str,
        message: &str,
    ) -> Result<DeviceState, LiveStoreError> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut device = match self.get_device_state(device_id).await? {
            Some(d) => d,
            None => DeviceState::discovered(device_id, "", now),
        };
        device.error_count += 1;
        device.status = if device.error_count >= QUARANTINE_THRESHOLD {
            DeviceStatus::Quarantine
        } else {
            DeviceStatus::Error
        };
        device.last_error = Some(message.to_string());
        device.last_error_at = Some(now);
        device.last_heartbeat = now;

        self.live
            .pipeline(vec![
                PipelineOp::HSet {
                    key: keys::device(device_id),
                    fields: hash::device_to_hash(&device),
                },
                PipelineOp::SAdd {
                    key: keys::DEVICES_INDEX.to_string(),
                    member: device_id.to_string(),
                },
            ])
            .await?;

        self.emit(OrchestratorEvent::DeviceUpdated {
            device_id: device_id.to_string(),
            status: device.status,
        });
        Ok(device)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_node_state(&self, node_id: &str) -> Result<Option<NodeState>, LiveStoreError> {
        let key = keys::node(node_id);
        let fields = self.live.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        hash::node_from_hash(&key, &fields).map(Some)
    }

    /// Nodes with a live heartbeat entry that read back online
    pub async fn get_online_nodes(&self) -> Result<Vec<NodeState>, LiveStoreError> {
        let ids = self
            .live
            .zrange_by_score(keys::HEARTBEAT, f64::NEG_INFINITY, f64::INFINITY)
            .await?;
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.get_node_state(&id).await? {
                if node.is_online() {
                    nodes.push(node);
                }
            }
        }
        Ok(nodes)
    }

    pub async fn get_device_state(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceState>, LiveStoreError> {
        let key = keys::device(device_id);
        let fields = self.live.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        hash::device_from_hash(&key, &fields).map(Some)
    }

    pub async fn get_all_device_states(&self) -> Result<Vec<DeviceState>, LiveStoreError> {
        let ids = self.live.smembers(keys::DEVICES_INDEX).await?;
        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(device) = self.get_device_state(&id).await? {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    pub async fn get_node_devices(
        &self,
        node_id: &str,
    ) -> Result<Vec<DeviceState>, LiveStoreError> {
        let ids = self.live.smembers(&keys::node_devices(node_id)).await?;
        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(device) = self.get_device_state(&id).await? {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    /// Devices eligible for dispatch, optionally scoped to one node
    pub async fn get_idle_devices(
        &self,
        node_id: Option<&str>,
    ) -> Result<Vec<DeviceState>, LiveStoreError> {
        let devices = match node_id {
            Some(id) => self.get_node_devices(id).await?,
            None => self.get_all_device_states().await?,
        };
        Ok(devices
            .into_iter()
            .filter(|d| d.status.is_dispatchable())
            .collect())
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Write the live execution row; terminal rows get a 30-minute TTL
    pub async fn set_execution_state(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<(), LiveStoreError> {
        let key = keys::execution(&execution.execution_key);
        let mut ops = vec![PipelineOp::HSet {
            key: key.clone(),
            fields: hash::execution_to_hash(execution),
        }];
        if execution.status.is_terminal() {
            ops.push(PipelineOp::Expire {
                key,
                ttl: EXECUTION_TTL,
            });
        }
        self.live.pipeline(ops).await
    }

    pub async fn get_execution_state(
        &self,
        execution_key: &str,
    ) -> Result<Option<WorkflowExecution>, LiveStoreError> {
        let key = keys::execution(execution_key);
        let fields = self.live.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        hash::execution_from_hash(&key, &fields).map(Some)
    }

    /// Heartbeat entries older than the cutoff (stale candidates)
    pub async fn stale_nodes(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, LiveStoreError> {
        self.live
            .zrange_by_score(
                keys::HEARTBEAT,
                f64::NEG_INFINITY,
                cutoff.timestamp_millis() as f64,
            )
            .await
    }

    /// Device counts bucketed by state, for the metrics snapshot
    pub async fn device_state_counts(&self) -> Result<HashMap<DeviceStatus, u32>, LiveStoreError> {
        let mut counts = HashMap::new();
        for device in self.get_all_device_states().await? {
            *counts.entry(device.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidfarm_live::InMemoryLiveStore;

    fn manager() -> Arc<StateManager> {
        StateManager::new(Arc::new(InMemoryLiveStore::new()), EventBus::new())
    }

    fn reports(ids: &[&str]) -> Vec<DeviceReport> {
        ids.iter()
            .map(|id| DeviceReport {
                device_id: id.to_string(),
                model: None,
                android_version: None,
                battery: None,
                ip_address: None,
                usb_port: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn register_creates_node_and_idle_devices() {
        let state = manager();
        state
            .register_node("N1", &["D1".to_string(), "D2".to_string()])
            .await
            .unwrap();

        let node = state.get_node_state("N1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.connected_devices, 2);

        let d1 = state.get_device_state("D1").await.unwrap().unwrap();
        assert_eq!(d1.status, DeviceStatus::Idle);
        assert_eq!(d1.node_id.as_deref(), Some("N1"));
        assert_eq!(state.get_idle_devices(Some("N1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn heartbeat_keeps_sorted_set_in_step_with_last_seen() {
        let state = manager();
        state.register_node("N1", &[]).await.unwrap();
        state.heartbeat("N1").await.unwrap();

        let node = state.get_node_state("N1").await.unwrap().unwrap();
        // the zset score and the hash field must agree
        let stale = state.stale_nodes(node.last_seen).await.unwrap();
        assert_eq!(stale, vec!["N1".to_string()]);
        let fresh = state
            .stale_nodes(node.last_seen - chrono::Duration::milliseconds(1))
            .await
            .unwrap();
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn disconnect_marks_devices_disconnected() {
        let state = manager();
        state
            .register_node("N1", &["D1".to_string()])
            .await
            .unwrap();
        state.disconnect_node("N1").await.unwrap();

        let node = state.get_node_state("N1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        let device = state.get_device_state("D1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Disconnected);
        assert!(state.get_online_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn relisted_device_revives_from_disconnected() {
        let state = manager();
        state
            .register_node("N1", &["D1".to_string()])
            .await
            .unwrap();
        state.disconnect_node("N1").await.unwrap();

        state
            .heartbeat_devices("N1", &reports(&["D1"]), None)
            .await
            .unwrap();
        let device = state.get_device_state("D1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Idle);
    }

    #[tokio::test]
    async fn error_accounting_reaches_quarantine_once() {
        let state = manager();
        state
            .register_node("N1", &["D1".to_string()])
            .await
            .unwrap();

        state.record_device_error("D1", "e1").await.unwrap();
        state.record_device_error("D1", "e2").await.unwrap();

        // Two concurrent updates from count=2: both serialise, exactly one
        // crosses the threshold
        let (a, b) = tokio::join!(
            state.record_device_error("D1", "e3"),
            state.record_device_error("D1", "e4"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let crossed = [&a, &b]
            .iter()
            .filter(|d| d.error_count == QUARANTINE_THRESHOLD)
            .count();
        assert_eq!(crossed, 1);

        let device = state.get_device_state("D1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Quarantine);
        assert_eq!(device.error_count, 4);
    }

    #[tokio::test]
    async fn idle_transition_clears_error_accounting() {
        let state = manager();
        state
            .register_node("N1", &["D1".to_string()])
            .await
            .unwrap();
        state.record_device_error("D1", "boom").await.unwrap();

        let device = state
            .update_device_state("D1", DeviceStateUpdate::status(DeviceStatus::Idle))
            .await
            .unwrap();
        assert_eq!(device.error_count, 0);
        assert!(device.last_error.is_none());
    }

    #[tokio::test]
    async fn completed_decays_to_idle() {
        tokio::time::pause();
        let state = manager();
        state
            .register_node("N1", &["D1".to_string()])
            .await
            .unwrap();
        state
            .update_device_state("D1", DeviceStateUpdate::status(DeviceStatus::Running))
            .await
            .unwrap();
        state
            .update_device_state("D1", DeviceStateUpdate::status(DeviceStatus::Completed))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(1100)).await;
        // allow the decay task to run
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let device = state.get_device_state("D1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Idle);
    }

    #[tokio::test]
    async fn terminal_execution_gets_ttl() {
        let state = manager();
        let mut exec = WorkflowExecution::enqueued(
            "wf-1",
            1,
            "N1",
            vec!["D1".to_string()],
            serde_json::Value::Null,
        );
        exec.status = droidfarm_core::execution::ExecutionStatus::Completed;
        state.set_execution_state(&exec).await.unwrap();

        let read = state
            .get_execution_state(&exec.execution_key)
            .await
            .unwrap();
        assert!(read.is_some());
    }
}
