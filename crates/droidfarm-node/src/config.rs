//! Node configuration, environment-driven

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Orchestrator WebSocket endpoint, e.g. `ws://127.0.0.1:8080/ws`
    pub server_url: String,
    /// Identity this node registers under; stable across reconnects
    pub node_id: String,
    /// Devices this node manages (real deployments enumerate ADB instead)
    pub device_ids: Vec<String>,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    /// Snapshot path for the internal queue; `None` disables persistence
    pub queue_state_path: Option<PathBuf>,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let server_url = std::env::var("SERVER_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string());
        let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| {
            let suffix: u32 = rand::thread_rng().gen_range(1000..9999);
            format!("node-{suffix}")
        });
        let device_ids = std::env::var("DEVICE_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let heartbeat_interval = env_secs("HEARTBEAT_INTERVAL_SECS", 5);
        let reconnect_delay = env_secs("RECONNECT_DELAY_SECS", 3);
        let queue_state_path = std::env::var("QUEUE_STATE_PATH").ok().map(PathBuf::from);

        Self {
            server_url,
            node_id,
            device_ids,
            heartbeat_interval,
            reconnect_delay,
            queue_state_path,
        }
    }

    pub fn with_devices(mut self, device_ids: Vec<String>) -> Self {
        self.device_ids = device_ids;
        self
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}
