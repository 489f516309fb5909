//! MetricsCollector: periodic fleet snapshots
//!
//! Samples {online nodes, devices by state, queue depths, active jobs,
//! process gauges}, publishes each sample on the bus and the metrics
//! channel, and keeps a bounded in-memory history for the text export.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use droidfarm_core::events::{EventBus, OrchestratorEvent};
use droidfarm_core::metrics::MetricsSnapshot;
use droidfarm_live::{keys, LiveStore};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::WorkflowCoordinator;
use crate::queue::QueueManager;
use crate::state::StateManager;

/// One day of minute samples
const HISTORY_LIMIT: usize = 1440;

pub struct MetricsCollector {
    state: Arc<StateManager>,
    queues: Arc<QueueManager>,
    coordinator: Arc<WorkflowCoordinator>,
    live: Arc<dyn LiveStore>,
    bus: EventBus,
    interval: Duration,
    history: Mutex<VecDeque<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new(
        state: Arc<StateManager>,
        queues: Arc<QueueManager>,
        coordinator: Arc<WorkflowCoordinator>,
        live: Arc<dyn LiveStore>,
        bus: EventBus,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            queues,
            coordinator,
            live,
            bus,
            interval,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match self.sample().await {
                        Ok(snapshot) => self.record(snapshot).await,
                        Err(e) => warn!(error = %e, "metrics sample failed"),
                    }
                }
            }
        }
        debug!("metrics collector stopped");
    }

    /// Take one snapshot of the fleet
    pub async fn sample(&self) -> anyhow::Result<MetricsSnapshot> {
        let mut snapshot = MetricsSnapshot::empty(Utc::now());

        snapshot.online_nodes = self.state.get_online_nodes().await?.len() as u32;
        for (status, count) in self.state.device_state_counts().await? {
            snapshot
                .devices_by_state
                .insert(status.to_string(), count);
            snapshot.total_devices += count;
        }
        snapshot.queue_depths = self
            .queues
            .all_queue_depths()
            .await?
            .into_iter()
            .collect();
        snapshot.active_jobs = self.coordinator.active_job_count() as u32;

        let (cpu, memory) = process_gauges();
        snapshot.cpu_percent = cpu;
        snapshot.memory_percent = memory;
        Ok(snapshot)
    }

    async fn record(&self, snapshot: MetricsSnapshot) {
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }

        if let Ok(payload) = serde_json::to_string(&snapshot) {
            if let Err(e) = self.live.publish(keys::CHANNEL_METRICS, &payload).await {
                debug!(error = %e, "metrics channel publish failed");
            }
        }
        self.bus
            .emit(OrchestratorEvent::MetricsSampled { snapshot });
    }

    pub fn history(&self) -> Vec<MetricsSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.history.lock().back().cloned()
    }

    /// Prometheus text exposition of the latest sample
    pub fn prometheus_export(&self) -> String {
        let Some(snapshot) = self.latest() else {
            return String::new();
        };
        let mut out = String::new();
        out.push_str(&format!(
            "droidfarm_online_nodes {}\n",
            snapshot.online_nodes
        ));
        out.push_str(&format!(
            "droidfarm_total_devices {}\n",
            snapshot.total_devices
        ));
        for (state, count) in &snapshot.devices_by_state {
            out.push_str(&format!(
                "droidfarm_devices{{state=\"{state}\"}} {count}\n"
            ));
        }
        for (queue, depth) in &snapshot.queue_depths {
            out.push_str(&format!(
                "droidfarm_queue_depth{{queue=\"{queue}\"}} {depth}\n"
            ));
        }
        out.push_str(&format!("droidfarm_active_jobs {}\n", snapshot.active_jobs));
        out.push_str(&format!(
            "droidfarm_cpu_percent {}\n",
            snapshot.cpu_percent
        ));
        out.push_str(&format!(
            "droidfarm_memory_percent {}\n",
            snapshot.memory_percent
        ));
        out
    }
}

/// Best-effort process gauges; zero where the platform offers no cheap read
#[cfg(target_os = "linux")]
fn process_gauges() -> (f64, f64) {
    let memory = std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| {
            let pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
            let total_kb: f64 = std::fs::read_to_string("/proc/meminfo")
                .ok()?
                .lines()
                .find(|l| l.starts_with("MemTotal:"))?
                .split_whitespace()
                .nth(1)?
                .parse()
                .ok()?;
            Some((pages * 4.0) / total_kb * 100.0)
        })
        .unwrap_or(0.0);
    (0.0, memory)
}

#[cfg(not(target_os = "linux"))]
fn process_gauges() -> (f64, f64) {
    (0.0, 0.0)
}
