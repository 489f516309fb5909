//! Frame envelope and text codec

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messages::*;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Every frame that can cross the node channel, in either direction
///
/// Commands (server -> node) carry a `frame_id` when the sender wants an ACK;
/// events (node -> server) never do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    // Server -> node
    #[serde(rename = "EXECUTE_WORKFLOW")]
    ExecuteWorkflow {
        frame_id: Uuid,
        #[serde(flatten)]
        body: ExecuteWorkflow,
    },
    #[serde(rename = "CANCEL_WORKFLOW")]
    CancelWorkflow {
        frame_id: Uuid,
        #[serde(flatten)]
        body: CancelWorkflow,
    },
    #[serde(rename = "PING")]
    Ping,

    // Node -> server
    #[serde(rename = "REGISTER")]
    Register(Register),
    #[serde(rename = "DEVICE_STATUS")]
    DeviceStatus {
        node_id: String,
        devices: Vec<DeviceReport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        system: Option<ReportedSystem>,
    },
    #[serde(rename = "WORKFLOW_PROGRESS")]
    WorkflowProgress(WorkflowProgressReport),
    #[serde(rename = "WORKFLOW_COMPLETE")]
    WorkflowComplete(WorkflowCompleteReport),
    #[serde(rename = "WORKFLOW_ERROR")]
    WorkflowError(WorkflowErrorReport),
    #[serde(rename = "PONG")]
    Pong,

    // Either direction
    #[serde(rename = "ACK")]
    Ack(Ack),
}

impl WireMessage {
    /// The frame id a peer should acknowledge, if this frame wants one
    pub fn ack_id(&self) -> Option<Uuid> {
        match self {
            Self::ExecuteWorkflow { frame_id, .. } | Self::CancelWorkflow { frame_id, .. } => {
                Some(*frame_id)
            }
            _ => None,
        }
    }
}

/// Serialise a frame to its wire text
pub fn encode(message: &WireMessage) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(message)?)
}

/// Parse one wire text frame
pub fn decode(text: &str) -> Result<WireMessage, ProtoError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidfarm_core::workflow::{StepAction, Workflow, WorkflowStep};

    #[test]
    fn execute_workflow_frame_shape() {
        let frame_id = Uuid::new_v4();
        let msg = WireMessage::ExecuteWorkflow {
            frame_id,
            body: ExecuteWorkflow {
                job_id: "job-1".into(),
                execution_key: "exec_1712000000000_ab12cd34e".into(),
                workflow_id: "wf-1".into(),
                workflow: Workflow::new(
                    "wf-1",
                    "demo",
                    vec![WorkflowStep::new("tap", StepAction::AgentScript)],
                ),
                device_ids: vec!["D1".into()],
                params: serde_json::json!({"count": 3}),
            },
        };

        let value: serde_json::Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], "EXECUTE_WORKFLOW");
        assert_eq!(value["job_id"], "job-1");
        assert_eq!(value["device_ids"][0], "D1");

        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.ack_id(), Some(frame_id));
    }

    #[test]
    fn events_carry_no_ack_id() {
        let msg = WireMessage::WorkflowProgress(WorkflowProgressReport {
            job_id: "job-1".into(),
            device_id: "D1".into(),
            current_step: Some("tap".into()),
            progress: 50,
            message: None,
        });
        assert_eq!(msg.ack_id(), None);

        let value: serde_json::Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], "WORKFLOW_PROGRESS");
        assert_eq!(value["progress"], 50);
    }

    #[test]
    fn ack_round_trip() {
        let frame_id = Uuid::new_v4();
        let msg = WireMessage::Ack(Ack::cancelled(frame_id, true));
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        match decoded {
            WireMessage::Ack(ack) => {
                assert_eq!(ack.frame_id, frame_id);
                assert!(ack.received);
                assert_eq!(ack.cancelled, Some(true));
            }
            other => panic!("expected ACK, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = decode(r#"{"type":"SELF_DESTRUCT"}"#).unwrap_err();
        assert!(matches!(err, ProtoError::Malformed(_)));
    }

    #[test]
    fn ping_pong_are_bare_frames() {
        assert_eq!(encode(&WireMessage::Ping).unwrap(), r#"{"type":"PING"}"#);
        assert_eq!(encode(&WireMessage::Pong).unwrap(), r#"{"type":"PONG"}"#);
    }
}
