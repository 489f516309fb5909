//! LivenessMonitor: periodic staleness sweep
//!
//! Every interval (default 30 s) nodes whose heartbeat score lags the cutoff
//! (default 60 s) are disconnected. An optional durable sweep marks running
//! executions with no recent progress as failed; it is disabled unless the
//! `liveness.stale_execution_minutes` setting holds a number.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use droidfarm_core::execution::ExecutionStatus;
use droidfarm_durable::{DurableStore, UpdateExecution};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::state::StateManager;

pub const STALE_EXECUTION_SETTING: &str = "liveness.stale_execution_minutes";

pub struct LivenessMonitor {
    state: Arc<StateManager>,
    durable: Arc<dyn DurableStore>,
    interval: Duration,
    heartbeat_timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(
        state: Arc<StateManager>,
        durable: Arc<dyn DurableStore>,
        interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            state,
            durable,
            interval,
            heartbeat_timeout,
        }
    }

    /// Run until the token fires
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.sweep().await;
                }
            }
        }
        debug!("liveness monitor stopped");
    }

    #[instrument(skip(self))]
    pub async fn sweep(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        match self.state.stale_nodes(cutoff).await {
            Ok(stale) => {
                for node_id in stale {
                    info!(%node_id, "heartbeat stale, disconnecting node");
                    if let Err(e) = self.state.disconnect_node(&node_id).await {
                        warn!(%node_id, error = %e, "stale disconnect failed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "stale node query failed"),
        }

        self.sweep_stale_executions().await;
    }

    /// Operator-gated: fail running executions with no progress for N minutes
    async fn sweep_stale_executions(&self) {
        let minutes = match self.durable.get_setting(STALE_EXECUTION_SETTING).await {
            Ok(Some(value)) => match value.as_u64() {
                Some(minutes) if minutes > 0 => minutes,
                _ => return,
            },
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "stale execution setting read failed");
                return;
            }
        };

        let cutoff = Utc::now() - chrono::Duration::minutes(minutes as i64);
        let running = match self.durable.list_running_executions().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "running execution query failed");
                return;
            }
        };
        for row in running {
            if row.updated_at >= cutoff {
                continue;
            }
            info!(execution_key = %row.execution_id, "execution stale, failing");
            let update = UpdateExecution {
                status: Some(ExecutionStatus::Failed),
                error_message: Some(format!(
                    "stale: no progress for {minutes} minutes"
                )),
                completed_at: Some(Utc::now()),
                ..Default::default()
            };
            if let Err(e) = self.durable.update_execution(&row.execution_id, update).await {
                warn!(execution_key = %row.execution_id, error = %e, "stale fail write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidfarm_core::events::EventBus;
    use droidfarm_durable::InMemoryDurableStore;
    use droidfarm_live::InMemoryLiveStore;

    #[tokio::test]
    async fn sweep_disconnects_only_stale_nodes() {
        let state = StateManager::new(Arc::new(InMemoryLiveStore::new()), EventBus::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        state.register_node("fresh", &[]).await.unwrap();
        state.register_node("stale", &[]).await.unwrap();

        // Age the stale node's heartbeat by rewriting last_seen
        state
            .update_node_state(
                "stale",
                droidfarm_core::node::NodeStateUpdate {
                    last_seen: Some(Utc::now() - chrono::Duration::seconds(120)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let monitor = LivenessMonitor::new(
            state.clone(),
            durable,
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        monitor.sweep().await;

        let online = state.get_online_nodes().await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].node_id, "fresh");
    }
}
