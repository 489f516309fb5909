//! Fleet metrics snapshot
//!
//! One sample of the gauges the collector scrapes from the engine. Samples
//! are published on `channel:metrics` and retained in a bounded history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sampled_at: DateTime<Utc>,

    pub online_nodes: u32,
    pub total_devices: u32,
    /// Device counts bucketed by state name (stable ordering for export)
    pub devices_by_state: BTreeMap<String, u32>,

    /// Waiting + delayed entries per queue
    pub queue_depths: BTreeMap<String, u64>,
    pub active_jobs: u32,

    /// Orchestrator process gauges, 0.0 - 100.0
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl MetricsSnapshot {
    pub fn empty(now: DateTime<Utc>) -> Self {
        let mut devices_by_state = BTreeMap::new();
        for state in DeviceStatus::ALL {
            devices_by_state.insert(state.to_string(), 0);
        }
        Self {
            sampled_at: now,
            online_nodes: 0,
            total_devices: 0,
            devices_by_state,
            queue_depths: BTreeMap::new(),
            active_jobs: 0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
        }
    }

    /// Look up one gauge by name, for threshold rule evaluation
    ///
    /// Gauge names: `online_nodes`, `total_devices`, `active_jobs`,
    /// `cpu_percent`, `memory_percent`, `devices_<STATE>`, `queue_<name>`.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        match name {
            "online_nodes" => Some(self.online_nodes as f64),
            "total_devices" => Some(self.total_devices as f64),
            "active_jobs" => Some(self.active_jobs as f64),
            "cpu_percent" => Some(self.cpu_percent),
            "memory_percent" => Some(self.memory_percent),
            _ => {
                if let Some(state) = name.strip_prefix("devices_") {
                    self.devices_by_state.get(state).map(|v| *v as f64)
                } else if let Some(queue) = name.strip_prefix("queue_") {
                    self.queue_depths.get(queue).map(|v| *v as f64)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_lookup_covers_buckets() {
        let mut snap = MetricsSnapshot::empty(Utc::now());
        snap.devices_by_state.insert("QUARANTINE".into(), 2);
        snap.queue_depths.insert("workflow:node-1".into(), 7);
        snap.online_nodes = 3;

        assert_eq!(snap.gauge("online_nodes"), Some(3.0));
        assert_eq!(snap.gauge("devices_QUARANTINE"), Some(2.0));
        assert_eq!(snap.gauge("queue_workflow:node-1"), Some(7.0));
        assert_eq!(snap.gauge("nonsense"), None);
    }
}
