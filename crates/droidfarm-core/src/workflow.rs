//! Workflows: versioned, ordered step sequences
//!
//! A workflow is immutable after publication; edits produce a new version via
//! an atomic increment in the durable store. Steps split into server steps
//! (remote tasks run by the orchestrator) and agent steps (run on the node).

use serde::{Deserialize, Serialize};

/// What a step does and where it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepAction {
    /// Executed by the orchestrator through the remote task service
    RemoteTask,
    /// Legacy spelling kept on the wire for workflows published before the
    /// task service rename
    #[serde(rename = "celery-task")]
    RemoteTaskAlias,
    /// Executed by the node's device driver
    AgentScript,
    /// Node-side sleep for `params.duration_ms`
    Wait,
    /// Node-side equality predicate over params; skips the rest when false
    Conditional,
}

impl StepAction {
    /// Server steps run sequentially on the orchestrator before any agent
    /// dispatch; everything else ships to the node.
    pub fn is_server_side(self) -> bool {
        matches!(self, Self::RemoteTask | Self::RemoteTaskAlias)
    }
}

/// Per-step failure policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Record the failure, keep going
    Continue,
    /// Abort the job; every device is marked failed
    #[default]
    Fail,
    /// Record the failure as skipped, keep going
    Skip,
}

/// Retry policy for one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts (including the first)
    #[serde(default = "RetryPolicy::default_max")]
    pub max: u32,
    /// Delay between attempts, milliseconds
    #[serde(default = "RetryPolicy::default_delay_ms")]
    pub delay_ms: u64,
}

impl RetryPolicy {
    fn default_max() -> u32 {
        1
    }

    fn default_delay_ms() -> u64 {
        1000
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: Self::default_max(),
            delay_ms: Self::default_delay_ms(),
        }
    }
}

/// One step of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub action: StepAction,

    /// Step parameters, merged with the job's params at execution time
    #[serde(default)]
    pub params: serde_json::Value,

    /// Per-step timeout in seconds; the coordinator default applies when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub on_error: OnError,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            action,
            params: serde_json::Value::Null,
            timeout_secs: None,
            retry: RetryPolicy::default(),
            on_error: OnError::default(),
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// A versioned, ordered sequence of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Strictly increasing; bumped atomically on every edit
    pub version: u32,

    pub steps: Vec<WorkflowStep>,

    /// Whole-job deadline in seconds; the coordinator falls back to its
    /// configured job timeout when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default = "Workflow::default_active")]
    pub is_active: bool,
}

impl Workflow {
    fn default_active() -> bool {
        true
    }

    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            category: None,
            version: 1,
            steps,
            timeout_secs: None,
            tags: vec![],
            is_active: true,
        }
    }

    /// Split steps into (server steps, agent steps), preserving order
    pub fn partition_steps(&self) -> (Vec<&WorkflowStep>, Vec<&WorkflowStep>) {
        self.steps.iter().partition(|s| s.action.is_server_side())
    }

    /// Copy of this workflow with server steps stripped, as shipped to a node
    pub fn agent_view(&self) -> Workflow {
        let mut wf = self.clone();
        wf.steps.retain(|s| !s.action.is_server_side());
        wf
    }

    pub fn has_agent_steps(&self) -> bool {
        self.steps.iter().any(|s| !s.action.is_server_side())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Workflow {
        Workflow::new(
            "wf-1",
            "warmup",
            vec![
                WorkflowStep::new("health", StepAction::RemoteTask),
                WorkflowStep::new("open-app", StepAction::AgentScript),
                WorkflowStep::new("settle", StepAction::Wait),
            ],
        )
    }

    #[test]
    fn partition_preserves_order() {
        let wf = sample();
        let (server, agent) = wf.partition_steps();
        assert_eq!(server.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), ["health"]);
        assert_eq!(
            agent.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            ["open-app", "settle"]
        );
    }

    #[test]
    fn agent_view_strips_server_steps() {
        let wf = sample().agent_view();
        assert_eq!(wf.steps.len(), 2);
        assert!(wf.steps.iter().all(|s| !s.action.is_server_side()));
    }

    #[test]
    fn legacy_action_spelling_round_trips() {
        let step: WorkflowStep =
            serde_json::from_value(serde_json::json!({"id": "s", "action": "celery-task"}))
                .unwrap();
        assert_eq!(step.action, StepAction::RemoteTaskAlias);
        assert!(step.action.is_server_side());
        assert_eq!(step.on_error, OnError::Fail);
    }
}
