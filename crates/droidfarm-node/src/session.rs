//! WebSocket session against the orchestrator
//!
//! One long-lived connection: REGISTER on open, DEVICE_STATUS heartbeats on
//! an interval, command handling (EXECUTE_WORKFLOW, CANCEL_WORKFLOW, PING)
//! with immediate acks, and executor reports flowing back upstream. The
//! session reconnects with a fixed delay; executor reports produced while the
//! link is down queue in the outbound channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use droidfarm_proto::{decode, encode, Ack, DeviceReport, Register, WireMessage};

use crate::config::NodeConfig;
use crate::executor::JobExecutor;

pub struct NodeSession {
    config: NodeConfig,
    executor: Arc<JobExecutor>,
    outbound: mpsc::Receiver<WireMessage>,
}

impl NodeSession {
    pub fn new(
        config: NodeConfig,
        executor: Arc<JobExecutor>,
        outbound: mpsc::Receiver<WireMessage>,
    ) -> Self {
        Self {
            config,
            executor,
            outbound,
        }
    }

    /// Run until shutdown, reconnecting after dropped links
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.connect_once().await {
                Ok(()) => {
                    info!("session closed by server");
                }
                Err(e) => {
                    warn!(error = %e, "session error");
                }
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
            debug!("reconnecting");
        }
    }

    fn device_reports(&self) -> Vec<DeviceReport> {
        self.config
            .device_ids
            .iter()
            .map(|id| DeviceReport {
                device_id: id.clone(),
                model: None,
                android_version: None,
                battery: None,
                ip_address: None,
                usb_port: None,
            })
            .collect()
    }

    async fn connect_once(&mut self) -> Result<()> {
        let (stream, _) = connect_async(&self.config.server_url)
            .await
            .context("websocket connect failed")?;
        let (mut write, mut read) = stream.split();
        info!(url = %self.config.server_url, node_id = %self.config.node_id, "connected");

        let register = WireMessage::Register(Register {
            node_id: self.config.node_id.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            device_count: Some(self.config.device_ids.len() as u32),
            metadata: serde_json::Value::Null,
        });
        write
            .send(Message::text(encode(&register)?))
            .await
            .context("register send failed")?;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_frame(text.as_str()) {
                                write.send(Message::text(encode(&reply)?)).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                report = self.outbound.recv() => {
                    match report {
                        Some(msg) => write.send(Message::text(encode(&msg)?)).await?,
                        None => return Ok(()),
                    }
                }
                _ = heartbeat.tick() => {
                    let status = WireMessage::DeviceStatus {
                        node_id: self.config.node_id.clone(),
                        devices: self.device_reports(),
                        system: None,
                    };
                    write.send(Message::text(encode(&status)?)).await?;
                }
            }
        }
    }

    /// Process one server frame; returns the immediate reply, if any
    fn handle_frame(&self, text: &str) -> Option<WireMessage> {
        let frame = match decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return None;
            }
        };
        match frame {
            WireMessage::Ping => Some(WireMessage::Pong),
            WireMessage::ExecuteWorkflow { frame_id, body } => {
                debug!(job_id = %body.job_id, "EXECUTE_WORKFLOW received");
                self.executor.accept(body);
                Some(WireMessage::Ack(Ack::received(frame_id)))
            }
            WireMessage::CancelWorkflow { frame_id, body } => {
                let cancelled = self.executor.cancel(&body.job_id);
                debug!(job_id = %body.job_id, cancelled, "CANCEL_WORKFLOW received");
                Some(WireMessage::Ack(Ack::cancelled(frame_id, cancelled)))
            }
            other => {
                debug!(kind = ?other, "unexpected server frame ignored");
                None
            }
        }
    }
}
