//! Device entities and the device state machine
//!
//! A device is one Android handset under a node's control. State is driven by
//! node-reported events and workflow execution:
//!
//! ```text
//! DISCONNECTED --(node heartbeat lists it)--> IDLE
//! IDLE --(dispatch)--> QUEUED | RUNNING
//! RUNNING --(progress)--> RUNNING
//! RUNNING --(success)--> COMPLETED --(1s decay)--> IDLE
//! RUNNING --(failure)--> ERROR
//! ERROR --(reset to IDLE/RUNNING)--> IDLE   (error count cleared)
//! ERROR --(error count >= 3)--> QUARANTINE  (terminal, manual reset only)
//! any --(node disconnect)--> DISCONNECTED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive errors that move a device to QUARANTINE
pub const QUARANTINE_THRESHOLD: u32 = 3;

/// Device state vocabulary
///
/// QUARANTINE is terminal until an operator resets the device; COMPLETED is a
/// transient state that decays to IDLE after one second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Disconnected,
    Idle,
    Queued,
    Running,
    Completed,
    Error,
    Quarantine,
}

impl DeviceStatus {
    /// All states, in a stable order (metrics bucketing)
    pub const ALL: [DeviceStatus; 7] = [
        Self::Disconnected,
        Self::Idle,
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Error,
        Self::Quarantine,
    ];

    /// Whether a device in this state can be handed new work
    pub fn is_dispatchable(self) -> bool {
        self == Self::Idle
    }

    /// Whether the requested transition is allowed by the state machine
    ///
    /// Node disconnect (`-> Disconnected`) is allowed from anywhere; everything
    /// else follows the diagram above. Quarantine only admits a manual reset to
    /// IDLE.
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        if next == Disconnected {
            return true;
        }
        match self {
            Disconnected => matches!(next, Idle),
            Idle => matches!(next, Queued | Running),
            Queued => matches!(next, Running | Idle),
            Running => matches!(next, Running | Completed | Error),
            Completed => matches!(next, Idle | Running),
            Error => matches!(next, Idle | Running | Quarantine),
            Quarantine => matches!(next, Idle),
        }
    }

    /// Whether moving into `next` clears the device's error accounting
    pub fn clears_error_count(next: DeviceStatus) -> bool {
        matches!(next, DeviceStatus::Idle | DeviceStatus::Running)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Idle => write!(f, "IDLE"),
            Self::Queued => write!(f, "QUEUED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Error => write!(f, "ERROR"),
            Self::Quarantine => write!(f, "QUARANTINE"),
        }
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCONNECTED" => Ok(Self::Disconnected),
            "IDLE" => Ok(Self::Idle),
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            "QUARANTINE" => Ok(Self::Quarantine),
            other => Err(format!("unknown device state: {other}")),
        }
    }
}

/// Live view of one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    /// Typically the ADB serial
    pub device_id: String,

    /// Owning node; `None` while unassigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    pub status: DeviceStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub android_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usb_port: Option<String>,

    /// Workflow currently running on the device, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Progress of the current execution, 0-100
    pub progress: u8,

    /// Monotonically non-decreasing until an IDLE/RUNNING transition resets it
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,

    pub last_heartbeat: DateTime<Utc>,
}

impl DeviceState {
    /// A device first reported by a node heartbeat: idle, clean error slate
    pub fn discovered(
        device_id: impl Into<String>,
        node_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            node_id: Some(node_id.into()),
            status: DeviceStatus::Idle,
            model: None,
            android_version: None,
            battery: None,
            ip_address: None,
            usb_port: None,
            workflow_id: None,
            current_step: None,
            progress: 0,
            error_count: 0,
            last_error: None,
            last_error_at: None,
            last_heartbeat: now,
        }
    }
}

/// Partial update applied to a live device entry
#[derive(Debug, Clone, Default)]
pub struct DeviceStateUpdate {
    pub node_id: Option<Option<String>>,
    pub status: Option<DeviceStatus>,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub battery: Option<u8>,
    pub ip_address: Option<String>,
    pub usb_port: Option<String>,
    pub workflow_id: Option<Option<String>>,
    pub current_step: Option<Option<String>>,
    pub progress: Option<u8>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl DeviceStateUpdate {
    pub fn status(status: DeviceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Apply onto an existing state. Transitions into IDLE or RUNNING clear
    /// the error accounting per the state machine.
    pub fn apply(self, state: &mut DeviceState, now: DateTime<Utc>) {
        if let Some(node_id) = self.node_id {
            state.node_id = node_id;
        }
        if let Some(status) = self.status {
            if DeviceStatus::clears_error_count(status) && state.status == DeviceStatus::Error {
                state.error_count = 0;
                state.last_error = None;
                state.last_error_at = None;
            }
            state.status = status;
        }
        if let Some(model) = self.model {
            state.model = Some(model);
        }
        if let Some(v) = self.android_version {
            state.android_version = Some(v);
        }
        if let Some(b) = self.battery {
            state.battery = Some(b);
        }
        if let Some(ip) = self.ip_address {
            state.ip_address = Some(ip);
        }
        if let Some(port) = self.usb_port {
            state.usb_port = Some(port);
        }
        if let Some(w) = self.workflow_id {
            state.workflow_id = w;
        }
        if let Some(s) = self.current_step {
            state.current_step = s;
        }
        if let Some(p) = self.progress {
            state.progress = p.min(100);
        }
        state.last_heartbeat = self.last_heartbeat.unwrap_or(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarantine_is_terminal_except_manual_reset() {
        assert!(!DeviceStatus::Quarantine.can_transition_to(DeviceStatus::Running));
        assert!(!DeviceStatus::Quarantine.can_transition_to(DeviceStatus::Queued));
        assert!(DeviceStatus::Quarantine.can_transition_to(DeviceStatus::Idle));
        // node disconnect overrides everything
        assert!(DeviceStatus::Quarantine.can_transition_to(DeviceStatus::Disconnected));
    }

    #[test]
    fn running_device_outcomes() {
        assert!(DeviceStatus::Running.can_transition_to(DeviceStatus::Completed));
        assert!(DeviceStatus::Running.can_transition_to(DeviceStatus::Error));
        assert!(DeviceStatus::Running.can_transition_to(DeviceStatus::Running));
        assert!(!DeviceStatus::Running.can_transition_to(DeviceStatus::Idle));
    }

    #[test]
    fn idle_transition_resets_error_accounting() {
        let now = Utc::now();
        let mut state = DeviceState::discovered("D1", "N1", now);
        state.status = DeviceStatus::Error;
        state.error_count = 2;
        state.last_error = Some("tap failed".into());

        DeviceStateUpdate::status(DeviceStatus::Idle).apply(&mut state, now);

        assert_eq!(state.status, DeviceStatus::Idle);
        assert_eq!(state.error_count, 0);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn partial_update_is_idempotent() {
        let now = Utc::now();
        let mut a = DeviceState::discovered("D1", "N1", now);
        let update = DeviceStateUpdate {
            battery: Some(87),
            progress: Some(40),
            last_heartbeat: Some(now),
            ..Default::default()
        };
        update.clone().apply(&mut a, now);
        let snapshot = a.clone();
        update.apply(&mut a, now);
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&snapshot).unwrap()
        );
    }

    #[test]
    fn wire_spelling_is_screaming_snake() {
        assert_eq!(DeviceStatus::Disconnected.to_string(), "DISCONNECTED");
        assert_eq!(DeviceStatus::Quarantine.to_string(), "QUARANTINE");
    }
}
