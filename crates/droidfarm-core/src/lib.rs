// Droidfarm core domain model
//
// This crate defines the entities the whole control plane agrees on:
// - Nodes (worker hosts) and their lifecycle status
// - Devices (Android handsets) and their state machine
// - Workflows (versioned step sequences) and step policies
// - Executions (one dispatch of a workflow to a set of devices)
// - Execution logs and operator alerts
// - The in-process orchestrator event bus
//
// Key design decisions:
// - No I/O here: store adapters and transports depend on this crate, never the reverse
// - Dynamic payloads (params, results, log data) are carried as serde_json::Value
// - Device state uses the long vocabulary (DISCONNECTED..QUARANTINE) end to end

pub mod alert;
pub mod device;
pub mod events;
pub mod execution;
pub mod log;
pub mod metrics;
pub mod node;
pub mod workflow;

// Re-exports for convenience
pub use alert::{Alert, AlertLevel};
pub use device::{DeviceState, DeviceStateUpdate, DeviceStatus, QUARANTINE_THRESHOLD};
pub use events::{EventBus, OrchestratorEvent};
pub use execution::{
    generate_execution_key, parse_execution_key, DeviceOutcome, ExecutionAggregate,
    ExecutionStatus, WorkflowExecution,
};
pub use log::{ExecutionLogEntry, LogLevel, LogStatus};
pub use metrics::MetricsSnapshot;
pub use node::{NodeState, NodeStateUpdate, NodeStatus, SystemGauges};
pub use workflow::{OnError, RetryPolicy, StepAction, Workflow, WorkflowStep};
