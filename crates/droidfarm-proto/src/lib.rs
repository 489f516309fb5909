// Droidfarm wire protocol
//
// JSON frames over a persistent full-duplex channel, one session per node.
// Server -> node commands carry a frame id and expect an ACK frame back;
// node -> server events are fire-and-forget.
//
// The `type` discriminator uses the SCREAMING_SNAKE message names both sides
// log and grep for: EXECUTE_WORKFLOW, CANCEL_WORKFLOW, PING, REGISTER,
// DEVICE_STATUS, WORKFLOW_PROGRESS, WORKFLOW_COMPLETE, WORKFLOW_ERROR, PONG,
// ACK.

pub mod messages;
pub mod wire;

pub use messages::{
    Ack, CancelWorkflow, DeviceReport, ExecuteWorkflow, Register, ReportedSystem,
    WorkflowCompleteReport, WorkflowErrorReport, WorkflowProgressReport,
};
pub use wire::{decode, encode, ProtoError, WireMessage};
