//! Node-side workflow execution
//!
//! One task per device runs the agent steps of a dispatched job. Per-device
//! serialisation goes through the internal queue: a dispatch for a busy
//! device buffers until the device frees up, then the highest-priority,
//! earliest job runs next.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use droidfarm_core::workflow::{OnError, StepAction, Workflow, WorkflowStep};
use droidfarm_proto::{
    ExecuteWorkflow, WireMessage, WorkflowCompleteReport, WorkflowErrorReport,
    WorkflowProgressReport,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::driver::{DeviceDriver, DriverError};
use crate::internal_queue::{InternalJob, InternalQueue};

/// Fallback per-step deadline
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

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

/// Equality predicate for conditional steps: `params.field == params.equals`
fn conditional_holds(params: &serde_json::Value) -> bool {
    let Some(field) = params.get("field").and_then(|v| v.as_str()) else {
        return true;
    };
    let expected = params.get("equals").cloned().unwrap_or(serde_json::Value::Null);
    params.get(field).cloned().unwrap_or(serde_json::Value::Null) == expected
}

struct ActiveJob {
    workflow: Workflow,
    cancel: CancellationToken,
    /// Devices still owed a terminal report
    outstanding: usize,
}

pub struct JobExecutor {
    driver: Arc<dyn DeviceDriver>,
    queue: Arc<InternalQueue>,
    outbound: mpsc::Sender<WireMessage>,
    busy: Mutex<HashMap<String, String>>,
    jobs: Mutex<HashMap<String, ActiveJob>>,
}

impl JobExecutor {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        queue: Arc<InternalQueue>,
        outbound: mpsc::Sender<WireMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            queue,
            outbound,
            busy: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Accept an EXECUTE_WORKFLOW dispatch: buffer one entry per target
    /// device and start whichever devices are free.
    #[instrument(skip(self, command), fields(job_id = %command.job_id))]
    pub fn accept(self: &Arc<Self>, command: ExecuteWorkflow) {
        let devices = command.device_ids.clone();
        {
            let mut jobs = self.jobs.lock();
            jobs.insert(
                command.job_id.clone(),
                ActiveJob {
                    workflow: command.workflow.clone(),
                    cancel: CancellationToken::new(),
                    outstanding: devices.len(),
                },
            );
        }
        info!(devices = devices.len(), "job accepted");

        for device_id in devices {
            self.queue.enqueue(InternalJob {
                id: command.job_id.clone(),
                device_id: device_id.clone(),
                workflow_id: command.workflow_id.clone(),
                params: command.params.clone(),
                priority: 0,
                enqueued_at: Utc::now(),
                timeout_ms: None,
            });
            self.try_start(&device_id);
        }
    }

    /// Cancel a job: drop buffered entries, fire the token for running ones.
    /// Returns false for an unknown job id.
    pub fn cancel(self: &Arc<Self>, job_id: &str) -> bool {
        // Buffered entries never report a terminal outcome; settle them here
        // so the job entry does not outlive its last running device.
        let mut dropped = 0;
        while self.queue.remove(job_id) {
            dropped += 1;
        }
        let known = {
            let jobs = self.jobs.lock();
            match jobs.get(job_id) {
                Some(active) => {
                    active.cancel.cancel();
                    true
                }
                None => false,
            }
        };
        for _ in 0..dropped {
            self.settle_device(job_id);
        }
        known
    }

    /// Number of devices currently running a step
    pub fn busy_devices(&self) -> usize {
        self.busy.lock().len()
    }

    fn try_start(self: &Arc<Self>, device_id: &str) {
        let job = {
            let mut busy = self.busy.lock();
            if busy.contains_key(device_id) {
                return;
            }
            let Some(job) = self.queue.dequeue(device_id) else {
                return;
            };
            busy.insert(device_id.to_string(), job.id.clone());
            job
        };

        let executor = self.clone();
        let device = device_id.to_string();
        tokio::spawn(async move {
            executor.run_device_job(&device, job).await;
            executor.busy.lock().remove(&device);
            // The buffer may hold a follow-up dispatch for this device
            executor.try_start(&device);
        });
    }

    async fn run_device_job(self: &Arc<Self>, device_id: &str, job: InternalJob) {
        let (workflow, cancel) = {
            let jobs = self.jobs.lock();
            match jobs.get(&job.id) {
                Some(active) => (active.workflow.clone(), active.cancel.clone()),
                None => {
                    // Cancelled between buffering and start
                    debug!(job_id = %job.id, device_id, "job gone before start");
                    return;
                }
            }
        };

        let started = Instant::now();
        let outcome = self
            .run_steps(device_id, &job, &workflow, &cancel)
            .await;

        let report = match outcome {
            Ok(result) => WireMessage::WorkflowComplete(WorkflowCompleteReport {
                job_id: job.id.clone(),
                device_id: device_id.to_string(),
                success: true,
                duration_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
                result,
            }),
            Err(failure) => WireMessage::WorkflowError(WorkflowErrorReport {
                job_id: job.id.clone(),
                device_id: device_id.to_string(),
                step_id: failure.step_id,
                error: failure.error,
                retry_count: failure.retry_count,
            }),
        };
        if self.outbound.send(report).await.is_err() {
            warn!(job_id = %job.id, "session gone, terminal report dropped");
        }

        self.settle_device(&job.id);
    }

    fn settle_device(&self, job_id: &str) {
        let mut jobs = self.jobs.lock();
        if let Some(active) = jobs.get_mut(job_id) {
            active.outstanding = active.outstanding.saturating_sub(1);
            if active.outstanding == 0 {
                jobs.remove(job_id);
            }
        }
    }

    async fn run_steps(
        &self,
        device_id: &str,
        job: &InternalJob,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StepFailure> {
        let total = workflow.steps.len().max(1);
        let mut step_results = Vec::with_capacity(workflow.steps.len());

        for (index, step) in workflow.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StepFailure::cancelled(step));
            }

            let progress = (((index + 1) * 100) / total) as u8;
            self.emit_progress(job, device_id, step, progress.saturating_sub(1), None)
                .await;

            let merged = merge_params(&job.params, &step.params);
            match self.run_one_step(device_id, step, &merged, cancel).await {
                Ok(result) => {
                    let gate_closed = step.action == StepAction::Conditional
                        && result.get("skipped").and_then(|v| v.as_bool()).unwrap_or(false);
                    step_results.push(serde_json::json!({ "step": step.id, "result": result }));
                    self.emit_progress(job, device_id, step, progress, None).await;
                    if gate_closed {
                        // A false conditional skips the remainder of the list
                        break;
                    }
                }
                Err(failure) if failure.cancelled => return Err(failure),
                Err(failure) => match step.on_error {
                    OnError::Fail => return Err(failure),
                    OnError::Skip | OnError::Continue => {
                        step_results.push(serde_json::json!({
                            "step": step.id,
                            "error": failure.error,
                            "skipped": step.on_error == OnError::Skip,
                        }));
                        self.emit_progress(job, device_id, step, progress, Some(failure.error))
                            .await;
                    }
                },
            }
        }

        Ok(serde_json::Value::Array(step_results))
    }

    async fn run_one_step(
        &self,
        device_id: &str,
        step: &WorkflowStep,
        params: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StepFailure> {
        match step.action {
            StepAction::Wait => {
                let duration = params
                    .get("duration_ms")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1000);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(duration)) => {
                        Ok(serde_json::json!({ "waited_ms": duration }))
                    }
                    _ = cancel.cancelled() => Err(StepFailure::cancelled(step)),
                }
            }
            StepAction::Conditional => {
                let holds = conditional_holds(params);
                Ok(serde_json::json!({ "condition": holds, "skipped": !holds }))
            }
            StepAction::AgentScript => self.run_script(device_id, step, params, cancel).await,
            // Server steps never reach a node; the coordinator strips them
            StepAction::RemoteTask | StepAction::RemoteTaskAlias => {
                Err(StepFailure::new(step, "server step dispatched to node", 0))
            }
        }
    }

    async fn run_script(
        &self,
        device_id: &str,
        step: &WorkflowStep,
        params: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StepFailure> {
        let attempts = step.retry.max.max(1);
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STEP_TIMEOUT);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(StepFailure::cancelled(step));
            }
            let progress: Box<crate::driver::ProgressFn> = Box::new(|_p| {});
            let run = self.driver.run_step(device_id, step, params, &progress);

            let result = tokio::select! {
                r = tokio::time::timeout(timeout, run) => r,
                _ = cancel.cancelled() => return Err(StepFailure::cancelled(step)),
            };

            match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(DriverError::DeviceUnavailable(d))) => {
                    // Retrying cannot help a detached device
                    return Err(StepFailure::new(
                        step,
                        format!("device {d} not available"),
                        attempt - 1,
                    ));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("step {} timed out", step.id),
            }

            if attempt < attempts {
                debug!(step = %step.id, attempt, "step failed, retrying");
                tokio::time::sleep(Duration::from_millis(step.retry.delay_ms)).await;
            }
        }

        Err(StepFailure::new(step, last_error, attempts - 1))
    }

    async fn emit_progress(
        &self,
        job: &InternalJob,
        device_id: &str,
        step: &WorkflowStep,
        progress: u8,
        message: Option<String>,
    ) {
        let report = WireMessage::WorkflowProgress(WorkflowProgressReport {
            job_id: job.id.clone(),
            device_id: device_id.to_string(),
            current_step: Some(step.id.clone()),
            progress: progress.min(100),
            message,
        });
        let _ = self.outbound.send(report).await;
    }
}

struct StepFailure {
    step_id: Option<String>,
    error: String,
    retry_count: u32,
    cancelled: bool,
}

impl StepFailure {
    fn new(step: &WorkflowStep, error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            step_id: Some(step.id.clone()),
            error: error.into(),
            retry_count,
            cancelled: false,
        }
    }

    fn cancelled(step: &WorkflowStep) -> Self {
        Self {
            step_id: Some(step.id.clone()),
            error: "cancelled".to_string(),
            retry_count: 0,
            cancelled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimulatedDriver;
    use droidfarm_core::workflow::RetryPolicy;

    fn make_executor() -> (Arc<JobExecutor>, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let queue = Arc::new(InternalQueue::new());
        let executor = JobExecutor::new(Arc::new(SimulatedDriver), queue, tx);
        (executor, rx)
    }

    fn command(job_id: &str, devices: &[&str], params: serde_json::Value) -> ExecuteWorkflow {
        ExecuteWorkflow {
            job_id: job_id.into(),
            execution_key: "exec_1_test00000".into(),
            workflow_id: "wf-1".into(),
            workflow: Workflow::new(
                "wf-1",
                "demo",
                vec![WorkflowStep::new("tap", StepAction::AgentScript)],
            ),
            device_ids: devices.iter().map(|d| d.to_string()).collect(),
            params,
        }
    }

    async fn drain_terminals(
        rx: &mut mpsc::Receiver<WireMessage>,
        expected: usize,
    ) -> Vec<WireMessage> {
        let mut terminal = vec![];
        while terminal.len() < expected {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(msg)) => match msg {
                    WireMessage::WorkflowComplete(_) | WireMessage::WorkflowError(_) => {
                        terminal.push(msg)
                    }
                    _ => {}
                },
                _ => break,
            }
        }
        terminal
    }

    #[tokio::test]
    async fn successful_job_reports_complete_per_device() {
        let (executor, mut rx) = make_executor();
        executor.accept(command("job-1", &["D1", "D2"], serde_json::Value::Null));

        let terminal = drain_terminals(&mut rx, 2).await;
        assert_eq!(terminal.len(), 2);
        for msg in terminal {
            match msg {
                WireMessage::WorkflowComplete(c) => {
                    assert!(c.success);
                    assert!(c.duration_ms.is_some());
                }
                other => panic!("expected complete, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn failing_step_reports_error() {
        let (executor, mut rx) = make_executor();
        executor.accept(command(
            "job-2",
            &["D1"],
            serde_json::json!({"simulate_fail": true}),
        ));

        let terminal = drain_terminals(&mut rx, 1).await;
        match &terminal[0] {
            WireMessage::WorkflowError(e) => {
                assert_eq!(e.device_id, "D1");
                assert!(e.error.contains("simulated failure"), "{}", e.error);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_policy_counts_attempts() {
        let (tx, mut rx) = mpsc::channel(64);
        let queue = Arc::new(InternalQueue::new());
        let executor = JobExecutor::new(Arc::new(SimulatedDriver), queue, tx);

        let mut step = WorkflowStep::new("tap", StepAction::AgentScript);
        step.retry = RetryPolicy { max: 3, delay_ms: 1 };
        let mut cmd = command("job-3", &["D1"], serde_json::json!({"simulate_fail": true}));
        cmd.workflow = Workflow::new("wf-1", "demo", vec![step]);

        executor.accept(cmd);
        let terminal = drain_terminals(&mut rx, 1).await;
        match &terminal[0] {
            WireMessage::WorkflowError(e) => assert_eq!(e.retry_count, 2),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn busy_device_buffers_second_dispatch() {
        let (executor, mut rx) = make_executor();
        // Long first job, quick second; both must complete, in order
        executor.accept(command(
            "job-slow",
            &["D1"],
            serde_json::json!({"simulate_delay_ms": 100}),
        ));
        executor.accept(command("job-quick", &["D1"], serde_json::Value::Null));

        let terminal = drain_terminals(&mut rx, 2).await;
        let ids: Vec<String> = terminal
            .iter()
            .map(|m| match m {
                WireMessage::WorkflowComplete(c) => c.job_id.clone(),
                WireMessage::WorkflowError(e) => e.job_id.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, ["job-slow", "job-quick"]);
    }

    #[tokio::test]
    async fn conditional_false_skips_remainder() {
        let (tx, mut rx) = mpsc::channel(64);
        let queue = Arc::new(InternalQueue::new());
        let executor = JobExecutor::new(Arc::new(SimulatedDriver), queue, tx);

        let conditional = WorkflowStep::new("gate", StepAction::Conditional)
            .with_params(serde_json::json!({"field": "mode", "equals": "warmup"}));
        let mut cmd = command("job-4", &["D1"], serde_json::json!({"mode": "publish"}));
        cmd.workflow = Workflow::new("wf-1", "demo", vec![conditional]);

        executor.accept(cmd);
        let terminal = drain_terminals(&mut rx, 1).await;
        match &terminal[0] {
            WireMessage::WorkflowComplete(c) => {
                assert!(c.success);
                let results = c.result.as_array().unwrap();
                assert_eq!(results[0]["result"]["skipped"], true);
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }
}
