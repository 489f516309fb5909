//! NodeGateway: one WebSocket session per connected node
//!
//! A socket is tagged with its node id only after REGISTER. The session map
//! is last-writer-wins: a new REGISTER for the same id closes the prior
//! session (its pending pings are discarded; pending jobs stay with the
//! coordinator). Keepalive pings go out every 10 s; a node silent for 30 s
//! is terminated.
//!
//! Workflow events stream to the coordinator through a channel; the gateway
//! never calls back into it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use dashmap::DashMap;
use droidfarm_core::node::SystemGauges;
use droidfarm_proto::{
    decode, encode, Ack, CancelWorkflow, ExecuteWorkflow, WireMessage, WorkflowCompleteReport,
    WorkflowErrorReport, WorkflowProgressReport,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::state::StateManager;

const PING_INTERVAL: Duration = Duration::from_secs(10);
const PONG_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a fresh socket may wait before sending REGISTER
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("node not connected: {0}")]
    NodeNotConnected(String),

    #[error("ack timeout from node {0}")]
    AckTimeout(String),

    #[error("session to node {0} closed")]
    SessionClosed(String),

    #[error("frame encode failed: {0}")]
    Encode(#[from] droidfarm_proto::ProtoError),
}

/// Commands the coordinator can address to a node
#[derive(Debug, Clone)]
pub enum NodeCommand {
    ExecuteWorkflow(ExecuteWorkflow),
    CancelWorkflow(CancelWorkflow),
}

/// Transport seam between the coordinator and connected nodes
///
/// The gateway is the production implementation; scenario tests substitute a
/// fake that scripts node behaviour.
#[async_trait]
pub trait NodeCommander: Send + Sync {
    fn is_connected(&self, node_id: &str) -> bool;

    /// Send a command and await its ack within `timeout`
    async fn send_command(
        &self,
        node_id: &str,
        command: NodeCommand,
        timeout: Duration,
    ) -> Result<Ack, GatewayError>;
}

/// Workflow events a node reports, forwarded to the coordinator
#[derive(Debug, Clone)]
pub enum NodeWorkflowEvent {
    Progress(WorkflowProgressReport),
    Complete(WorkflowCompleteReport),
    Error(WorkflowErrorReport),
}

struct SessionHandle {
    seq: u64,
    outbound: mpsc::Sender<String>,
    pending_acks: Arc<DashMap<Uuid, oneshot::Sender<Ack>>>,
    close: CancellationToken,
}

pub struct NodeGateway {
    state: Arc<StateManager>,
    sessions: DashMap<String, SessionHandle>,
    workflow_events: mpsc::UnboundedSender<NodeWorkflowEvent>,
    session_seq: AtomicU64,
}

impl NodeGateway {
    pub fn new(
        state: Arc<StateManager>,
        workflow_events: mpsc::UnboundedSender<NodeWorkflowEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            sessions: DashMap::new(),
            workflow_events,
            session_seq: AtomicU64::new(0),
        })
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Close every session (shutdown path)
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().close.cancel();
        }
    }

    /// axum handler for `GET /ws`
    pub async fn ws_handler(
        State(gateway): State<Arc<NodeGateway>>,
        upgrade: WebSocketUpgrade,
    ) -> impl IntoResponse {
        upgrade.on_upgrade(move |socket| async move {
            gateway.run_session(socket).await;
        })
    }

    /// Drive one socket from upgrade to close
    async fn run_session(self: Arc<Self>, socket: WebSocket) {
        let (mut writer, mut reader) = socket.split();

        // The socket earns a node id only via REGISTER
        let register = tokio::time::timeout(REGISTER_TIMEOUT, reader.next()).await;
        let register = match register {
            Ok(Some(Ok(Message::Text(text)))) => match decode(&text) {
                Ok(WireMessage::Register(r)) => r,
                Ok(other) => {
                    warn!(kind = ?other, "first frame was not REGISTER, closing");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "malformed REGISTER frame, closing");
                    return;
                }
            },
            _ => {
                debug!("socket closed before REGISTER");
                return;
            }
        };
        let node_id = register.node_id.clone();
        let seq = self.session_seq.fetch_add(1, Ordering::Relaxed);

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let pending_acks: Arc<DashMap<Uuid, oneshot::Sender<Ack>>> = Arc::new(DashMap::new());
        let close = CancellationToken::new();

        // Last-writer-wins: replace any prior session for this node id
        if let Some(prior) = self.sessions.insert(
            node_id.clone(),
            SessionHandle {
                seq,
                outbound: outbound_tx,
                pending_acks: pending_acks.clone(),
                close: close.clone(),
            },
        ) {
            info!(%node_id, "REGISTER replaces existing session");
            prior.close.cancel();
        }

        if let Err(e) = self.state.register_node(&node_id, &[]).await {
            warn!(%node_id, error = %e, "register_node failed");
        }
        info!(%node_id, version = ?register.version, "node session open");

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                _ = close.cancelled() => {
                    debug!(%node_id, "session closed (replaced or shutdown)");
                    break;
                }
                outgoing = outbound_rx.recv() => {
                    let Some(text) = outgoing else { break };
                    if writer.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if last_pong.elapsed() > PONG_TIMEOUT {
                        warn!(%node_id, "pong overdue, terminating session");
                        break;
                    }
                    let Ok(frame) = encode(&WireMessage::Ping) else { break };
                    if writer.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                incoming = reader.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&node_id, &text, &pending_acks, &mut last_pong)
                                .await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(%node_id, error = %e, "socket error");
                            break;
                        }
                    }
                }
            }
        }

        // Only the current owner of the map entry tears down node state;
        // a replaced session must not mark the new one offline.
        let owns_entry = self
            .sessions
            .remove_if(&node_id, |_, handle| handle.seq == seq)
            .is_some();
        if owns_entry {
            info!(%node_id, "node session closed");
            if let Err(e) = self.state.disconnect_node(&node_id).await {
                warn!(%node_id, error = %e, "disconnect_node failed");
            }
        }
    }

    async fn handle_frame(
        &self,
        node_id: &str,
        text: &str,
        pending_acks: &DashMap<Uuid, oneshot::Sender<Ack>>,
        last_pong: &mut Instant,
    ) {
        let frame = match decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node_id, error = %e, "malformed frame dropped");
                return;
            }
        };
        match frame {
            WireMessage::Pong => {
                *last_pong = Instant::now();
            }
            WireMessage::Ack(ack) => {
                if let Some((_, tx)) = pending_acks.remove(&ack.frame_id) {
                    let _ = tx.send(ack);
                } else {
                    debug!(node_id, frame_id = %ack.frame_id, "ack for unknown frame");
                }
            }
            WireMessage::DeviceStatus { node_id: reported, devices, system } => {
                if reported != node_id {
                    warn!(node_id, %reported, "DEVICE_STATUS for foreign node dropped");
                    return;
                }
                let gauges = system.map(|s| SystemGauges { cpu: s.cpu, memory: s.memory });
                if let Err(e) = self
                    .state
                    .heartbeat_devices(node_id, &devices, gauges)
                    .await
                {
                    warn!(node_id, error = %e, "heartbeat ingest failed");
                }
            }
            WireMessage::Register(r) => {
                // Re-REGISTER on a live socket refreshes liveness only
                debug!(node_id = %r.node_id, "repeat REGISTER on open session");
                if let Err(e) = self.state.heartbeat(node_id).await {
                    warn!(node_id, error = %e, "heartbeat failed");
                }
            }
            WireMessage::WorkflowProgress(report) => {
                let _ = self
                    .workflow_events
                    .send(NodeWorkflowEvent::Progress(report));
            }
            WireMessage::WorkflowComplete(report) => {
                let _ = self
                    .workflow_events
                    .send(NodeWorkflowEvent::Complete(report));
            }
            WireMessage::WorkflowError(report) => {
                let _ = self.workflow_events.send(NodeWorkflowEvent::Error(report));
            }
            other => {
                debug!(node_id, kind = ?other, "unexpected node frame ignored");
            }
        }
    }
}

#[async_trait]
impl NodeCommander for NodeGateway {
    fn is_connected(&self, node_id: &str) -> bool {
        self.sessions.contains_key(node_id)
    }

    #[instrument(skip(self, command))]
    async fn send_command(
        &self,
        node_id: &str,
        command: NodeCommand,
        timeout: Duration,
    ) -> Result<Ack, GatewayError> {
        let frame_id = Uuid::new_v4();
        let message = match command {
            NodeCommand::ExecuteWorkflow(body) => WireMessage::ExecuteWorkflow { frame_id, body },
            NodeCommand::CancelWorkflow(body) => WireMessage::CancelWorkflow { frame_id, body },
        };
        let frame = encode(&message)?;

        // Clone what the await needs, then release the map guard
        let (outbound, pending_acks) = {
            let session = self
                .sessions
                .get(node_id)
                .ok_or_else(|| GatewayError::NodeNotConnected(node_id.to_string()))?;
            (session.outbound.clone(), session.pending_acks.clone())
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        pending_acks.insert(frame_id, ack_tx);

        if outbound.send(frame).await.is_err() {
            pending_acks.remove(&frame_id);
            return Err(GatewayError::SessionClosed(node_id.to_string()));
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => {
                pending_acks.remove(&frame_id);
                Err(GatewayError::SessionClosed(node_id.to_string()))
            }
            Err(_) => {
                pending_acks.remove(&frame_id);
                Err(GatewayError::AckTimeout(node_id.to_string()))
            }
        }
    }
}
