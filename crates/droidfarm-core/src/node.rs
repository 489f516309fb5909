//! Node entities
//!
//! A node is one worker host process attached to a set of devices. Nodes are
//! created on first register and never physically deleted by the core; status
//! transitions are driven by heartbeats and the liveness sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Error,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// CPU / memory gauges reported by a node with its heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemGauges {
    /// CPU utilisation, 0.0 - 100.0
    pub cpu: f64,
    /// Memory utilisation, 0.0 - 100.0
    pub memory: f64,
}

/// Live view of one worker host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Opaque identifier chosen by the node itself
    pub node_id: String,

    /// Human-readable label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    pub status: NodeStatus,

    /// Network address the node connected from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_addr: Option<String>,

    #[serde(default)]
    pub system: SystemGauges,

    /// Number of devices the node currently reports
    pub connected_devices: u32,

    /// Executions in status running targeting this node
    pub active_jobs: u32,

    pub last_seen: DateTime<Utc>,

    /// Free-form metadata supplied at registration
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl NodeState {
    /// A freshly registered node: online, no devices, no jobs
    pub fn registered(node_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            label: None,
            status: NodeStatus::Online,
            network_addr: None,
            system: SystemGauges::default(),
            connected_devices: 0,
            active_jobs: 0,
            last_seen: now,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }
}

/// Partial update applied to a live node entry
///
/// `None` fields are left untouched. `last_seen` defaults to the write
/// instant when unspecified.
#[derive(Debug, Clone, Default)]
pub struct NodeStateUpdate {
    pub label: Option<String>,
    pub status: Option<NodeStatus>,
    pub network_addr: Option<String>,
    pub system: Option<SystemGauges>,
    pub connected_devices: Option<u32>,
    pub active_jobs: Option<u32>,
    pub last_seen: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl NodeStateUpdate {
    pub fn apply(self, state: &mut NodeState, now: DateTime<Utc>) {
        if let Some(label) = self.label {
            state.label = Some(label);
        }
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(addr) = self.network_addr {
            state.network_addr = Some(addr);
        }
        if let Some(system) = self.system {
            state.system = system;
        }
        if let Some(n) = self.connected_devices {
            state.connected_devices = n;
        }
        if let Some(n) = self.active_jobs {
            state.active_jobs = n;
        }
        state.last_seen = self.last_seen.unwrap_or(now);
        if let Some(metadata) = self.metadata {
            state.metadata = metadata;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_defaults_last_seen_to_now() {
        let t0 = Utc::now();
        let mut state = NodeState::registered("node-1", t0);
        let later = t0 + chrono::Duration::seconds(30);

        NodeStateUpdate {
            connected_devices: Some(4),
            ..Default::default()
        }
        .apply(&mut state, later);

        assert_eq!(state.connected_devices, 4);
        assert_eq!(state.last_seen, later);
        assert_eq!(state.status, NodeStatus::Online);
    }

    #[test]
    fn explicit_last_seen_wins() {
        let t0 = Utc::now();
        let mut state = NodeState::registered("node-1", t0);
        let explicit = t0 + chrono::Duration::seconds(5);

        NodeStateUpdate {
            last_seen: Some(explicit),
            ..Default::default()
        }
        .apply(&mut state, t0 + chrono::Duration::seconds(60));

        assert_eq!(state.last_seen, explicit);
    }
}
