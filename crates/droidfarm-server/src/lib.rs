// Droidfarm orchestration server
//
// The control plane of the device farm: per-node priority job queues, the
// persistent node channel, the workflow execution coordinator, liveness
// sweeps, metrics and alerting, and the live-to-durable sync bridge.
//
// Ownership rules the modules follow:
// - StateManager is the only writer of live:node:*, live:device:*, live:execution:*
// - QueueManager is the only writer of queue structures
// - WorkflowCoordinator is the only writer of execution status for jobs it owns
// - SyncWriter reads the bus and writes the durable store, never the reverse

pub mod alerts;
pub mod config;
pub mod coordinator;
pub mod gateway;
pub mod liveness;
pub mod metrics;
pub mod queue;
pub mod remote_task;
pub mod state;
pub mod sync;

pub use alerts::{default_rules, AlertManager, AlertRule, Comparator};
pub use config::ServerConfig;
pub use coordinator::{CoordinatorConfig, CoordinatorError, WorkflowCoordinator, SERVER_DEVICE};
pub use gateway::{GatewayError, NodeCommand, NodeCommander, NodeGateway, NodeWorkflowEvent};
pub use liveness::LivenessMonitor;
pub use metrics::MetricsCollector;
pub use queue::{workflow_queue, JobState, QueueError, QueueJob, QueueManager, QueueStats};
pub use remote_task::{RemoteTaskError, RemoteTaskExecutor, RemoteTaskState};
pub use state::StateManager;
pub use sync::SyncWriter;
