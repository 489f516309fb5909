//! End-to-end coordinator scenarios against the in-memory stores and a
//! scripted node transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use droidfarm_core::device::DeviceStatus;
use droidfarm_core::events::EventBus;
use droidfarm_core::execution::generate_execution_key;
use droidfarm_core::workflow::{OnError, StepAction, Workflow, WorkflowStep};
use droidfarm_durable::{DurableStore, ExecutionRow, InMemoryDurableStore};
use droidfarm_live::InMemoryLiveStore;
use droidfarm_proto::{Ack, WorkflowCompleteReport, WorkflowErrorReport, WorkflowProgressReport};
use droidfarm_server::{
    workflow_queue, CoordinatorConfig, GatewayError, NodeCommand, NodeCommander,
    NodeWorkflowEvent, QueueJob, QueueManager, RemoteTaskExecutor, StateManager, SyncWriter,
    WorkflowCoordinator,
};
use tokio_util::sync::CancellationToken;

/// How a scripted device answers a dispatch
#[derive(Debug, Clone)]
enum DeviceScript {
    /// progress(50) then complete(success)
    Success { duration_ms: u64 },
    /// workflow:error with this step and message
    Fail { step: &'static str, error: &'static str },
    /// never answers (orphaned-job scenarios)
    Silent,
}

/// Scripted stand-in for the NodeGateway
struct FakeNode {
    node_id: String,
    connected: AtomicBool,
    scripts: HashMap<String, DeviceScript>,
    events: mpsc::UnboundedSender<NodeWorkflowEvent>,
    executes_received: Mutex<Vec<String>>,
    cancels_received: Mutex<Vec<String>>,
}

impl FakeNode {
    fn new(
        node_id: &str,
        scripts: HashMap<String, DeviceScript>,
        events: mpsc::UnboundedSender<NodeWorkflowEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.to_string(),
            connected: AtomicBool::new(true),
            scripts,
            events,
            executes_received: Mutex::new(vec![]),
            cancels_received: Mutex::new(vec![]),
        })
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn execute_count(&self) -> usize {
        self.executes_received.lock().len()
    }

    fn play_device(&self, job_id: &str, device_id: &str) {
        let script = self
            .scripts
            .get(device_id)
            .cloned()
            .unwrap_or(DeviceScript::Success { duration_ms: 5 });
        let events = self.events.clone();
        let job_id = job_id.to_string();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            match script {
                DeviceScript::Success { duration_ms } => {
                    let _ = events.send(NodeWorkflowEvent::Progress(WorkflowProgressReport {
                        job_id: job_id.clone(),
                        device_id: device_id.clone(),
                        current_step: Some("S1".into()),
                        progress: 50,
                        message: None,
                    }));
                    tokio::time::sleep(Duration::from_millis(duration_ms)).await;
                    let _ = events.send(NodeWorkflowEvent::Complete(WorkflowCompleteReport {
                        job_id,
                        device_id,
                        success: true,
                        duration_ms: Some(duration_ms.max(1)),
                        error: None,
                        result: serde_json::Value::Null,
                    }));
                }
                DeviceScript::Fail { step, error } => {
                    let _ = events.send(NodeWorkflowEvent::Error(WorkflowErrorReport {
                        job_id,
                        device_id,
                        step_id: Some(step.to_string()),
                        error: error.to_string(),
                        retry_count: 0,
                    }));
                }
                DeviceScript::Silent => {}
            }
        });
    }
}

#[async_trait::async_trait]
impl NodeCommander for FakeNode {
    fn is_connected(&self, node_id: &str) -> bool {
        node_id == self.node_id && self.connected.load(Ordering::SeqCst)
    }

    async fn send_command(
        &self,
        node_id: &str,
        command: NodeCommand,
        _timeout: Duration,
    ) -> Result<Ack, GatewayError> {
        if !self.is_connected(node_id) {
            return Err(GatewayError::NodeNotConnected(node_id.to_string()));
        }
        let frame_id = uuid::Uuid::new_v4();
        match command {
            NodeCommand::ExecuteWorkflow(body) => {
                self.executes_received.lock().push(body.job_id.clone());
                for device_id in &body.device_ids {
                    self.play_device(&body.job_id, device_id);
                }
                Ok(Ack::received(frame_id))
            }
            NodeCommand::CancelWorkflow(body) => {
                self.cancels_received.lock().push(body.job_id.clone());
                // the node aborts every scripted device with a cancel error
                for device_id in self.scripts.keys() {
                    let _ = self.events.send(NodeWorkflowEvent::Error(WorkflowErrorReport {
                        job_id: body.job_id.clone(),
                        device_id: device_id.clone(),
                        step_id: None,
                        error: "cancelled".to_string(),
                        retry_count: 0,
                    }));
                }
                Ok(Ack::cancelled(frame_id, true))
            }
        }
    }
}

struct Harness {
    state: Arc<StateManager>,
    queues: Arc<QueueManager>,
    coordinator: Arc<WorkflowCoordinator>,
    durable: Arc<InMemoryDurableStore>,
    fake: Arc<FakeNode>,
    _shutdown: CancellationToken,
}

async fn harness(
    scripts: HashMap<String, DeviceScript>,
    remote_base: &str,
    queue_attempts: u32,
) -> Harness {
    let bus = EventBus::new();
    let live = Arc::new(InMemoryLiveStore::new());
    let durable = Arc::new(InMemoryDurableStore::new());
    let state = StateManager::new(live.clone(), bus.clone());
    let queues = QueueManager::with_max_attempts(live, bus.clone(), queue_attempts);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let fake = FakeNode::new("N1", scripts, events_tx);

    let coordinator = WorkflowCoordinator::new(
        queues.clone(),
        state.clone(),
        fake.clone(),
        Arc::new(RemoteTaskExecutor::new(remote_base)),
        bus.clone(),
        CoordinatorConfig {
            job_timeout: Duration::from_secs(10),
            agent_response_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        },
    );
    coordinator.start(events_rx);

    let shutdown = CancellationToken::new();
    let writer = SyncWriter::new(durable.clone() as Arc<dyn DurableStore>, bus);
    tokio::spawn(writer.run(shutdown.clone()));

    Harness {
        state,
        queues,
        coordinator,
        durable,
        fake,
        _shutdown: shutdown,
    }
}

/// Minimal remote task service: every task lands in `state` immediately
async fn spawn_remote_stub(terminal_state: &'static str) -> String {
    let app = Router::new()
        .route(
            "/api/tasks/execute",
            post(|| async { Json(serde_json::json!({ "task_id": "t-1" })) }),
        )
        .route(
            "/api/tasks/:id/status",
            get(move || async move {
                Json(serde_json::json!({
                    "state": terminal_state,
                    "error": (terminal_state == "FAILURE").then_some("boom"),
                }))
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

fn agent_workflow() -> Workflow {
    Workflow::new(
        "wf-1",
        "demo",
        vec![WorkflowStep::new("S1", StepAction::AgentScript)],
    )
}

fn job(job_id: &str, workflow: Workflow, device_ids: &[&str]) -> QueueJob {
    QueueJob {
        job_id: job_id.to_string(),
        workflow_id: workflow.id.clone(),
        workflow,
        execution_key: generate_execution_key(),
        device_ids: device_ids.iter().map(|d| d.to_string()).collect(),
        node_id: "N1".to_string(),
        params: serde_json::Value::Null,
        priority: 0,
        created_at: Utc::now(),
        attempts_made: 0,
    }
}

async fn wait_terminal(durable: &InMemoryDurableStore, key: &str) -> ExecutionRow {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if let Some(row) = durable.get_execution(key).await.unwrap() {
            if matches!(row.status.as_str(), "completed" | "failed" | "cancelled" | "partial") {
                return row;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {key} never reached a terminal status"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// S1 - happy path, single device
#[tokio::test]
async fn single_device_happy_path() {
    let h = harness(HashMap::new(), "http://127.0.0.1:9", 3).await;
    h.state
        .register_node("N1", &["D1".to_string()])
        .await
        .unwrap();

    let job = job("J1", agent_workflow(), &["D1"]);
    let key = job.execution_key.clone();
    h.queues.add_workflow_job(job).await.unwrap();

    let row = wait_terminal(&h.durable, &key).await;
    assert_eq!(row.status, "completed");
    assert_eq!(row.total_devices, 1);
    assert_eq!(row.completed_devices, 1);
    assert_eq!(row.failed_devices, 0);
    assert!(row.completed_at.is_some());

    // COMPLETED decays to IDLE after one second
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let device = h.state.get_device_state("D1").await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Idle);

    let logs = h.durable.list_execution_logs(&key).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.status.as_deref() == Some("completed") && l.device_id.as_deref() == Some("D1")));
}

// S2 - mixed outcome across three devices
#[tokio::test]
async fn mixed_outcomes_three_devices() {
    let scripts = HashMap::from([
        ("D2".to_string(), DeviceScript::Fail { step: "S1", error: "tap failed" }),
    ]);
    let h = harness(scripts, "http://127.0.0.1:9", 3).await;
    let devices: Vec<String> = ["D1", "D2", "D3"].iter().map(|s| s.to_string()).collect();
    h.state.register_node("N1", &devices).await.unwrap();

    let job = job("J2", agent_workflow(), &["D1", "D2", "D3"]);
    let key = job.execution_key.clone();
    h.queues.add_workflow_job(job).await.unwrap();

    let row = wait_terminal(&h.durable, &key).await;
    assert_eq!(row.status, "partial");
    assert_eq!(row.completed_devices, 2);
    assert_eq!(row.failed_devices, 1);

    let d2 = h.state.get_device_state("D2").await.unwrap().unwrap();
    assert_eq!(d2.status, DeviceStatus::Error);
    assert_eq!(d2.last_error.as_deref(), Some("tap failed"));
}

// S3 - server step fails with on-error=fail: no dispatch reaches the node
#[tokio::test]
async fn failing_server_step_aborts_before_dispatch() {
    let remote = spawn_remote_stub("FAILURE").await;
    let h = harness(HashMap::new(), &remote, 3).await;
    h.state
        .register_node("N1", &["D1".to_string(), "D2".to_string()])
        .await
        .unwrap();

    let workflow = Workflow::new(
        "wf-3",
        "health-then-run",
        vec![
            WorkflowStep::new("health", StepAction::RemoteTask)
                .with_params(serde_json::json!({"task": "health"}))
                .with_on_error(OnError::Fail)
                .with_timeout_secs(5),
            WorkflowStep::new("S1", StepAction::AgentScript),
        ],
    );
    let job = job("J3", workflow, &["D1", "D2"]);
    let key = job.execution_key.clone();
    h.queues.add_workflow_job(job).await.unwrap();

    let row = wait_terminal(&h.durable, &key).await;
    assert_eq!(row.status, "failed");
    assert_eq!(row.failed_devices, 2);
    assert!(
        row.error_message.as_deref().unwrap_or_default().contains("Celery step health failed"),
        "unexpected error: {:?}",
        row.error_message
    );
    assert_eq!(h.fake.execute_count(), 0, "node must not see EXECUTE_WORKFLOW");
}

// S4 - node disconnect mid-job: deadline fires, job ends failed
#[tokio::test]
async fn node_disconnect_orphans_job() {
    let scripts = HashMap::from([("D1".to_string(), DeviceScript::Silent)]);
    let h = harness(scripts, "http://127.0.0.1:9", 1).await;
    h.state
        .register_node("N1", &["D1".to_string()])
        .await
        .unwrap();

    let mut workflow = agent_workflow();
    workflow.timeout_secs = Some(1);
    let job = job("J4", workflow, &["D1"]);
    let key = job.execution_key.clone();
    h.queues.add_workflow_job(job).await.unwrap();

    // give dispatch a moment, then drop the node
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.fake.disconnect();
    h.state.disconnect_node("N1").await.unwrap();

    let row = wait_terminal(&h.durable, &key).await;
    assert_eq!(row.status, "failed");
    let error = row.error_message.unwrap_or_default();
    assert!(error.contains("timeout"), "error was: {error}");

    let device = h.state.get_device_state("D1").await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Disconnected);
}

// S5 - concurrent error updates quarantine exactly once at the threshold
#[tokio::test]
async fn concurrent_quarantine_updates_stay_consistent() {
    let durable = Arc::new(InMemoryDurableStore::new());
    durable
        .upsert_device(droidfarm_durable::UpsertDevice {
            id: "D1".into(),
            pc_id: None,
            serial_number: Some("D1".into()),
            model: None,
            android_version: None,
            battery: None,
            ip_address: None,
            usb_port: None,
            status: DeviceStatus::Idle,
            last_heartbeat: None,
        })
        .await
        .unwrap();
    durable
        .update_device_status_with_error("D1", "e1")
        .await
        .unwrap();
    durable
        .update_device_status_with_error("D1", "e2")
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        durable.update_device_status_with_error("D1", "e3"),
        durable.update_device_status_with_error("D1", "e4"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    let crossings = [&a, &b]
        .iter()
        .filter(|row| row.error_count == 3 && row.status == "QUARANTINE")
        .count();
    assert_eq!(crossings, 1, "exactly one update crosses the threshold");

    let final_row = durable.get_device("D1").await.unwrap().unwrap();
    assert_eq!(final_row.status, "QUARANTINE");
}

// S6 - cancellation: node acks, per-device cancel errors, execution cancelled
#[tokio::test]
async fn cancellation_mid_job() {
    let scripts = HashMap::from([("D1".to_string(), DeviceScript::Silent)]);
    let h = harness(scripts, "http://127.0.0.1:9", 3).await;
    h.state
        .register_node("N1", &["D1".to_string()])
        .await
        .unwrap();

    let job = job("J6", agent_workflow(), &["D1"]);
    let key = job.execution_key.clone();
    h.queues.add_workflow_job(job).await.unwrap();

    // wait until the job is dispatched and pending
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.coordinator.active_job_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "job never dispatched");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let cancelled = h
        .queues
        .cancel_job("J6", &workflow_queue("N1"))
        .await
        .unwrap();
    assert!(cancelled);

    let row = wait_terminal(&h.durable, &key).await;
    assert_eq!(row.status, "cancelled");
    assert!(row.completed_at.is_some());
    assert_eq!(h.fake.cancels_received.lock().as_slice(), ["J6"]);

    let logs = h.durable.list_execution_logs(&key).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.message.as_deref().map_or(false, |m| m.contains("cancelled"))));
}

// Boundary: cancelling an already completed job is a no-op returning false
#[tokio::test]
async fn cancel_after_completion_is_noop() {
    let h = harness(HashMap::new(), "http://127.0.0.1:9", 3).await;
    h.state
        .register_node("N1", &["D1".to_string()])
        .await
        .unwrap();

    let job = job("J7", agent_workflow(), &["D1"]);
    let key = job.execution_key.clone();
    h.queues.add_workflow_job(job).await.unwrap();
    wait_terminal(&h.durable, &key).await;

    // let the queue bookkeeping settle
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled = h
        .queues
        .cancel_job("J7", &workflow_queue("N1"))
        .await
        .unwrap();
    assert!(!cancelled);
}
