//! WorkflowCoordinator: turns queued jobs into device outcomes
//!
//! One consumer loop per queue with configured concurrency. For each job:
//! server steps run sequentially through the remote task service, then the
//! remaining workflow ships to the node as one EXECUTE_WORKFLOW command. The
//! coordinator keeps a pending entry per job and folds the node's per-device
//! terminal reports into an aggregate: all success -> completed, none ->
//! failed, mixed -> partial, cancel-requested -> cancelled.
//!
//! The coordinator is the only writer of execution status for jobs it owns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use droidfarm_core::device::{DeviceStateUpdate, DeviceStatus};
use droidfarm_core::events::{EventBus, OrchestratorEvent};
use droidfarm_core::execution::{
    DeviceOutcome, ExecutionAggregate, ExecutionStatus, WorkflowExecution,
};
use droidfarm_core::workflow::{OnError, WorkflowStep};
use droidfarm_proto::{CancelWorkflow, ExecuteWorkflow};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::gateway::{NodeCommand, NodeCommander, NodeWorkflowEvent};
use crate::queue::{workflow_queue, QueueError, QueueJob, QueueManager};
use crate::remote_task::RemoteTaskExecutor;
use crate::state::StateManager;

/// Placeholder device id used in progress events for server-side steps
pub const SERVER_DEVICE: &str = "server";

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("node-not-connected: {0}")]
    NodeNotConnected(String),

    #[error("node {node_id} did not acknowledge dispatch: {reason}")]
    DispatchRejected { node_id: String, reason: String },

    #[error("job timeout: node {node_id} never delivered outcomes for {job_id} (orphaned)")]
    JobTimeout { node_id: String, job_id: String },

    #[error("job cancelled")]
    Cancelled,

    #[error("shutdown")]
    Shutdown,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub job_timeout: Duration,
    pub agent_response_timeout: Duration,
    pub node_concurrency: usize,
    /// Idle consumer poll cadence (also drives delayed-job promotion)
    pub poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(300),
            agent_response_timeout: Duration::from_secs(30),
            node_concurrency: 5,
            poll_interval: Duration::from_millis(500),
        }
    }
}

struct PendingJob {
    execution_key: String,
    node_id: String,
    total: usize,
    outcomes: HashMap<String, DeviceOutcome>,
    cancel_requested: bool,
    done: Option<oneshot::Sender<()>>,
}

pub struct WorkflowCoordinator {
    queues: Arc<QueueManager>,
    state: Arc<StateManager>,
    commander: Arc<dyn NodeCommander>,
    remote: Arc<RemoteTaskExecutor>,
    bus: EventBus,
    config: CoordinatorConfig,
    pending: DashMap<String, PendingJob>,
    consumers: DashMap<String, ()>,
    shutdown: CancellationToken,
}

impl WorkflowCoordinator {
    pub fn new(
        queues: Arc<QueueManager>,
        state: Arc<StateManager>,
        commander: Arc<dyn NodeCommander>,
        remote: Arc<RemoteTaskExecutor>,
        bus: EventBus,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues,
            state,
            commander,
            remote,
            bus,
            config,
            pending: DashMap::new(),
            consumers: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Jobs currently awaiting node outcomes
    pub fn active_job_count(&self) -> usize {
        self.pending.len()
    }

    /// Spawn the event pumps. `events` is the gateway's workflow stream.
    pub fn start(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<NodeWorkflowEvent>) {
        // Node workflow events
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        coordinator.handle_node_event(event).await;
                    }
                }
            }
        });

        // Bus events: new queues get consumers, cancel requests reach nodes,
        // disconnects orphan their pending jobs
        let coordinator = self.clone();
        let mut bus_rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    event = bus_rx.recv() => {
                        match event {
                            Ok(OrchestratorEvent::JobAdded { queue, .. }) => {
                                coordinator.ensure_consumer(&queue);
                            }
                            Ok(OrchestratorEvent::JobCancelRequest { queue, job_id }) => {
                                coordinator.relay_cancel(&queue, &job_id).await;
                            }
                            Ok(OrchestratorEvent::NodeDisconnected { node_id }) => {
                                coordinator.orphan_node_jobs(&node_id);
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "coordinator lagged on bus events");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }

    /// Stop consuming and reject everything pending with `shutdown`
    pub async fn stop(&self) {
        self.shutdown.cancel();
        for mut entry in self.pending.iter_mut() {
            if let Some(done) = entry.value_mut().done.take() {
                let _ = done.send(());
            }
        }
        info!("coordinator stopped");
    }

    /// Ensure a consumer loop exists for `queue`
    pub fn ensure_consumer(self: &Arc<Self>, queue: &str) {
        if self.consumers.insert(queue.to_string(), ()).is_some() {
            return;
        }
        let coordinator = self.clone();
        let queue = queue.to_string();
        info!(%queue, "queue consumer started");
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(coordinator.config.node_concurrency));
            loop {
                if coordinator.shutdown.is_cancelled() {
                    break;
                }
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                match coordinator.queues.next_job(&queue).await {
                    Ok(Some(job)) => {
                        let coordinator = coordinator.clone();
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            coordinator.run_job(&queue, job).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        tokio::select! {
                            _ = tokio::time::sleep(coordinator.config.poll_interval) => {}
                            _ = coordinator.shutdown.cancelled() => break,
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        warn!(%queue, error = %e, "queue poll failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    async fn run_job(self: &Arc<Self>, queue: &str, job: QueueJob) {
        let job_id = job.job_id.clone();
        let result = self.process_job(&job).await;
        self.pending.remove(&job_id);

        match result {
            Ok(aggregate) => {
                self.finish_execution(&job, &aggregate).await;
                self.bus.emit(OrchestratorEvent::WorkflowComplete {
                    job_id: job_id.clone(),
                    execution_key: job.execution_key.clone(),
                    aggregate,
                });
                if let Err(e) = self.queues.complete_job(queue, &job_id).await {
                    warn!(%job_id, error = %e, "complete_job failed");
                }
            }
            Err(e) => {
                warn!(%job_id, error = %e, "job failed");
                if let Err(qe) = self.queues.fail_job(queue, &job_id, &e.to_string()).await {
                    warn!(%job_id, error = %qe, "fail_job failed");
                }
            }
        }
    }

    /// Execute one job end to end; returns the device aggregate
    async fn process_job(
        self: &Arc<Self>,
        job: &QueueJob,
    ) -> Result<ExecutionAggregate, CoordinatorError> {
        self.bus.emit(OrchestratorEvent::WorkflowStart {
            job_id: job.job_id.clone(),
            execution_key: job.execution_key.clone(),
            workflow_id: job.workflow_id.clone(),
            workflow_version: job.workflow.version,
            node_id: job.node_id.clone(),
            device_ids: job.device_ids.clone(),
            params: job.params.clone(),
        });
        self.write_live_execution(job, ExecutionStatus::Running, None)
            .await;

        // Server steps run sequentially before any agent dispatch
        let (server_steps, _) = job.workflow.partition_steps();
        let mut server_failures: Vec<(String, String)> = Vec::new();
        for step in server_steps {
            if self.shutdown.is_cancelled() {
                return Err(CoordinatorError::Shutdown);
            }
            match self.run_server_step(job, step).await {
                Ok(()) => {}
                Err(message) => match step.on_error {
                    OnError::Fail => {
                        // Every device is marked failed; no agent dispatch
                        let outcomes = job
                            .device_ids
                            .iter()
                            .map(|d| DeviceOutcome::failure(d, &message))
                            .collect();
                        return Ok(ExecutionAggregate::from_outcomes(outcomes));
                    }
                    OnError::Skip | OnError::Continue => {
                        server_failures.push((step.id.clone(), message));
                    }
                },
            }
        }

        if !job.workflow.has_agent_steps() {
            // Synthesised result: server outcomes speak for every device
            let outcomes = job
                .device_ids
                .iter()
                .map(|d| match server_failures.first() {
                    None => DeviceOutcome::success(d),
                    Some((_, error)) => DeviceOutcome::failure(d, error),
                })
                .collect();
            return Ok(ExecutionAggregate::from_outcomes(outcomes));
        }

        self.dispatch_to_node(job).await
    }

    /// One remote task invocation with per-step timeout and progress relay
    async fn run_server_step(
        &self,
        job: &QueueJob,
        step: &WorkflowStep,
    ) -> Result<(), String> {
        let task_name = step
            .params
            .get("task")
            .and_then(|v| v.as_str())
            .unwrap_or(&step.id)
            .to_string();
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.job_timeout);
        let merged = merge_params(&job.params, &step.params);

        let bus = self.bus.clone();
        let job_id = job.job_id.clone();
        let execution_key = job.execution_key.clone();
        let step_id = step.id.clone();
        let progress = move |p: u8| {
            bus.emit(OrchestratorEvent::WorkflowProgress {
                job_id: job_id.clone(),
                execution_key: execution_key.clone(),
                device_id: SERVER_DEVICE.to_string(),
                current_step: Some(step_id.clone()),
                progress: p,
                message: None,
            });
        };

        debug!(job_id = %job.job_id, step = %step.id, task = %task_name, "server step");
        self.remote
            .execute(&task_name, &merged, timeout, &self.shutdown, progress)
            .await
            .map(|_| ())
            .map_err(|e| format!("Celery step {} failed: {}", step.id, e))
    }

    /// Ship the agent steps to the node and await per-device outcomes
    async fn dispatch_to_node(
        self: &Arc<Self>,
        job: &QueueJob,
    ) -> Result<ExecutionAggregate, CoordinatorError> {
        let node_id = &job.node_id;
        if !self.commander.is_connected(node_id) {
            return Err(CoordinatorError::NodeNotConnected(node_id.clone()));
        }

        // Pending entry goes in before the command leaves: a fast node must
        // never report into a void
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.insert(
            job.job_id.clone(),
            PendingJob {
                execution_key: job.execution_key.clone(),
                node_id: node_id.clone(),
                total: job.device_ids.len(),
                outcomes: HashMap::new(),
                cancel_requested: false,
                done: Some(done_tx),
            },
        );

        let command = NodeCommand::ExecuteWorkflow(ExecuteWorkflow {
            job_id: job.job_id.clone(),
            execution_key: job.execution_key.clone(),
            workflow_id: job.workflow_id.clone(),
            workflow: job.workflow.agent_view(),
            device_ids: job.device_ids.clone(),
            params: job.params.clone(),
        });
        let ack = self
            .commander
            .send_command(node_id, command, self.config.agent_response_timeout)
            .await;
        match ack {
            Ok(ack) if ack.received => {}
            Ok(ack) => {
                self.pending.remove(&job.job_id);
                return Err(CoordinatorError::DispatchRejected {
                    node_id: node_id.clone(),
                    reason: ack.error.unwrap_or_else(|| "rejected".to_string()),
                });
            }
            Err(e) => {
                self.pending.remove(&job.job_id);
                return Err(CoordinatorError::DispatchRejected {
                    node_id: node_id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let deadline = job
            .workflow
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.job_timeout);

        tokio::select! {
            _ = done_rx => {}
            _ = tokio::time::sleep(deadline) => {
                self.pending.remove(&job.job_id);
                return Err(CoordinatorError::JobTimeout {
                    node_id: node_id.clone(),
                    job_id: job.job_id.clone(),
                });
            }
        }

        if self.shutdown.is_cancelled() {
            self.pending.remove(&job.job_id);
            return Err(CoordinatorError::Shutdown);
        }

        let (_, entry) = self
            .pending
            .remove(&job.job_id)
            .ok_or(CoordinatorError::Cancelled)?;
        let mut outcomes: Vec<DeviceOutcome> = entry.outcomes.into_values().collect();
        outcomes.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        let mut aggregate = ExecutionAggregate::from_outcomes(outcomes);
        if entry.cancel_requested {
            aggregate.status = ExecutionStatus::Cancelled;
        }
        Ok(aggregate)
    }

    /// Fold one node event into its pending entry
    pub async fn handle_node_event(&self, event: NodeWorkflowEvent) {
        match event {
            NodeWorkflowEvent::Progress(report) => {
                let Some(entry) = self.pending.get(&report.job_id) else {
                    debug!(job_id = %report.job_id, "progress for unknown job");
                    return;
                };
                let execution_key = entry.execution_key.clone();
                drop(entry);

                if let Err(e) = self
                    .state
                    .update_device_state(
                        &report.device_id,
                        DeviceStateUpdate {
                            status: Some(DeviceStatus::Running),
                            current_step: Some(report.current_step.clone()),
                            progress: Some(report.progress),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!(device_id = %report.device_id, error = %e, "progress state write failed");
                }
                self.bus.emit(OrchestratorEvent::WorkflowProgress {
                    job_id: report.job_id,
                    execution_key,
                    device_id: report.device_id,
                    current_step: report.current_step,
                    progress: report.progress,
                    message: report.message,
                });
            }
            NodeWorkflowEvent::Complete(report) => {
                if report.success {
                    if let Err(e) = self
                        .state
                        .update_device_state(
                            &report.device_id,
                            DeviceStateUpdate {
                                status: Some(DeviceStatus::Completed),
                                progress: Some(100),
                                workflow_id: Some(None),
                                current_step: Some(None),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        warn!(device_id = %report.device_id, error = %e, "completion state write failed");
                    }
                } else if let Err(e) = self
                    .state
                    .record_device_error(
                        &report.device_id,
                        report.error.as_deref().unwrap_or("workflow failed"),
                    )
                    .await
                {
                    warn!(device_id = %report.device_id, error = %e, "error state write failed");
                }

                let outcome = DeviceOutcome {
                    device_id: report.device_id.clone(),
                    success: report.success,
                    duration_ms: report.duration_ms,
                    error: report.error,
                    result: report.result,
                };
                self.settle_device_outcome(&report.job_id, outcome);
            }
            NodeWorkflowEvent::Error(report) => {
                let composite = report.composite_error();
                // The device keeps the raw error; the outcome carries the
                // step-qualified composite
                if let Err(e) = self
                    .state
                    .record_device_error(&report.device_id, &report.error)
                    .await
                {
                    warn!(device_id = %report.device_id, error = %e, "error state write failed");
                }
                if let Some(entry) = self.pending.get(&report.job_id) {
                    self.bus.emit(OrchestratorEvent::WorkflowError {
                        job_id: report.job_id.clone(),
                        execution_key: entry.execution_key.clone(),
                        device_id: report.device_id.clone(),
                        step_id: report.step_id.clone(),
                        error: report.error.clone(),
                        retry_count: report.retry_count,
                    });
                }
                let outcome = DeviceOutcome::failure(&report.device_id, composite);
                self.settle_device_outcome(&report.job_id, outcome);
            }
        }
    }

    /// Insert (or overwrite - duplicates are idempotent) one device outcome;
    /// fires the job's completion when the map covers every device.
    fn settle_device_outcome(&self, job_id: &str, outcome: DeviceOutcome) {
        let Some(mut entry) = self.pending.get_mut(job_id) else {
            debug!(job_id, "terminal report for unknown job");
            return;
        };
        entry
            .outcomes
            .insert(outcome.device_id.clone(), outcome);
        if entry.outcomes.len() >= entry.total {
            if let Some(done) = entry.done.take() {
                let _ = done.send(());
            }
        }
    }

    /// Ask the node to abort a running job. Returns the node's answer.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, node_id: &str, job_id: &str) -> bool {
        if let Some(mut entry) = self.pending.get_mut(job_id) {
            entry.cancel_requested = true;
        }
        let ack = self
            .commander
            .send_command(
                node_id,
                NodeCommand::CancelWorkflow(CancelWorkflow {
                    job_id: job_id.to_string(),
                }),
                self.config.agent_response_timeout,
            )
            .await;
        match ack {
            Ok(ack) => ack.cancelled.unwrap_or(false),
            Err(e) => {
                warn!(job_id, error = %e, "cancel relay failed");
                false
            }
        }
    }

    async fn relay_cancel(&self, queue: &str, job_id: &str) {
        let node_id = match self.pending.get(job_id) {
            Some(entry) => entry.node_id.clone(),
            None => {
                debug!(queue, job_id, "cancel request for job with no pending entry");
                return;
            }
        };
        self.cancel_workflow(&node_id, job_id).await;
    }

    /// A node vanished: flag its pending jobs; their deadlines finish the job
    fn orphan_node_jobs(&self, node_id: &str) {
        for entry in self.pending.iter() {
            if entry.value().node_id == node_id {
                self.bus.emit(OrchestratorEvent::NodeJobOrphaned {
                    node_id: node_id.to_string(),
                    job_id: entry.key().clone(),
                });
            }
        }
    }

    /// Live execution row for a job entering `status`
    async fn write_live_execution(
        &self,
        job: &QueueJob,
        status: ExecutionStatus,
        aggregate: Option<&ExecutionAggregate>,
    ) {
        let now = Utc::now();
        let mut execution = match self.state.get_execution_state(&job.execution_key).await {
            Ok(Some(existing)) => existing,
            _ => WorkflowExecution {
                execution_id: uuid::Uuid::now_v7(),
                execution_key: job.execution_key.clone(),
                workflow_id: job.workflow_id.clone(),
                workflow_version: job.workflow.version,
                node_id: Some(job.node_id.clone()),
                device_ids: job.device_ids.clone(),
                params: job.params.clone(),
                status,
                current_step: None,
                progress: 0,
                total_devices: job.device_ids.len() as u32,
                completed_devices: 0,
                failed_devices: 0,
                started_at: None,
                completed_at: None,
                result: serde_json::Value::Null,
                error_message: None,
                created_at: job.created_at,
            },
        };
        execution.status = status;
        if status == ExecutionStatus::Running && execution.started_at.is_none() {
            execution.started_at = Some(now);
        }
        if status.is_terminal() {
            execution.completed_at = Some(now);
            execution.progress = 100;
        }
        if let Some(aggregate) = aggregate {
            execution.completed_devices = aggregate.completed_devices;
            execution.failed_devices = aggregate.failed_devices;
            execution.error_message = aggregate.first_error().map(String::from);
        }
        if let Err(e) = self.state.set_execution_state(&execution).await {
            warn!(execution_key = %job.execution_key, error = %e, "live execution write failed");
        }
    }

    async fn finish_execution(&self, job: &QueueJob, aggregate: &ExecutionAggregate) {
        self.write_live_execution(job, aggregate.status, Some(aggregate))
            .await;
    }
}

/// Shallow merge: step params override job params field by field
fn merge_params(job: &serde_json::Value, step: &serde_json::Value) -> serde_json::Value {
    match (job, step) {
        (serde_json::Value::Object(a), serde_json::Value::Object(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        (a, serde_json::Value::Null) => a.clone(),
        (_, b) => b.clone(),
    }
}
