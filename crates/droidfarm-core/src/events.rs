//! Orchestrator event bus
//!
//! A single in-process broadcast bus carries every state-change and queue
//! event the engine produces. SyncWriter and AlertManager are pure
//! subscribers; emission is fire-and-forget and never blocks a producer.
//! Mirroring selected events onto Redis channels for external consumers is
//! the LiveStore's concern, not the bus's.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::alert::Alert;
use crate::device::DeviceStatus;
use crate::execution::ExecutionAggregate;
use crate::metrics::MetricsSnapshot;

/// Sized to absorb bursts from large fan-outs without lagging subscribers
const BUS_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum OrchestratorEvent {
    // Queue events
    JobAdded {
        queue: String,
        job_id: String,
    },
    JobCompleted {
        queue: String,
        job_id: String,
    },
    JobFailed {
        queue: String,
        job_id: String,
        execution_key: String,
        error: String,
        /// Whether another attempt is scheduled
        will_retry: bool,
    },
    JobProgress {
        queue: String,
        job_id: String,
        progress: u8,
    },
    JobCancelRequest {
        queue: String,
        job_id: String,
    },

    // Workflow lifecycle
    WorkflowStart {
        job_id: String,
        execution_key: String,
        workflow_id: String,
        workflow_version: u32,
        node_id: String,
        device_ids: Vec<String>,
        params: serde_json::Value,
    },
    WorkflowProgress {
        job_id: String,
        execution_key: String,
        device_id: String,
        current_step: Option<String>,
        progress: u8,
        message: Option<String>,
    },
    WorkflowComplete {
        job_id: String,
        execution_key: String,
        aggregate: ExecutionAggregate,
    },
    WorkflowError {
        job_id: String,
        execution_key: String,
        device_id: String,
        step_id: Option<String>,
        error: String,
        retry_count: u32,
    },

    // Node and device state
    NodeRegistered {
        node_id: String,
    },
    NodeDisconnected {
        node_id: String,
    },
    NodeJobOrphaned {
        node_id: String,
        job_id: String,
    },
    DeviceUpdated {
        device_id: String,
        status: DeviceStatus,
    },

    // Telemetry
    MetricsSampled {
        snapshot: MetricsSnapshot,
    },
    AlertFired {
        alert: Alert,
    },
}

impl OrchestratorEvent {
    /// Channel-style event name, matching the wire vocabulary
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobAdded { .. } => "job:added",
            Self::JobCompleted { .. } => "job:completed",
            Self::JobFailed { .. } => "job:failed",
            Self::JobProgress { .. } => "job:progress",
            Self::JobCancelRequest { .. } => "job:cancel-request",
            Self::WorkflowStart { .. } => "workflow:start",
            Self::WorkflowProgress { .. } => "workflow:progress",
            Self::WorkflowComplete { .. } => "workflow:complete",
            Self::WorkflowError { .. } => "workflow:error",
            Self::NodeRegistered { .. } => "node:registered",
            Self::NodeDisconnected { .. } => "node:disconnected",
            Self::NodeJobOrphaned { .. } => "node:job:orphaned",
            Self::DeviceUpdated { .. } => "device:updated",
            Self::MetricsSampled { .. } => "metrics:sampled",
            Self::AlertFired { .. } => "alert:fired",
        }
    }
}

/// Cloneable handle to the orchestrator's broadcast bus
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: OrchestratorEvent) {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::trace!(kind, receivers, "bus event");
            }
            Err(_) => {
                tracing::trace!(kind, "bus event dropped (no subscribers)");
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(OrchestratorEvent::NodeRegistered {
            node_id: "node-1".into(),
        });

        for rx in [&mut a, &mut b] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.kind(), "node:registered");
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(OrchestratorEvent::NodeDisconnected {
            node_id: "node-1".into(),
        });
        // no panic, no error surfaced
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn event_serialisation_is_tagged() {
        let event = OrchestratorEvent::JobAdded {
            queue: "workflow:node-1".into(),
            job_id: "j1".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "job-added");
        assert_eq!(value["queue"], "workflow:node-1");
    }
}
