//! Key and channel layout

pub const HEARTBEAT: &str = "live:heartbeat";

/// Index of every device id with a live entry (lets queries avoid SCAN)
pub const DEVICES_INDEX: &str = "live:devices";

pub const CHANNEL_STATE: &str = "channel:state";
pub const CHANNEL_METRICS: &str = "channel:metrics";
pub const CHANNEL_ALERTS: &str = "channel:alerts";

pub fn node(node_id: &str) -> String {
    format!("live:node:{node_id}")
}

pub fn node_devices(node_id: &str) -> String {
    format!("live:node:{node_id}:devices")
}

pub fn device(device_id: &str) -> String {
    format!("live:device:{device_id}")
}

pub fn execution(execution_key: &str) -> String {
    format!("live:execution:{execution_key}")
}

/// Queue structures are namespaced per logical queue name
pub mod queue {
    pub fn job(queue: &str, job_id: &str) -> String {
        format!("queue:{queue}:job:{job_id}")
    }

    pub fn waiting(queue: &str) -> String {
        format!("queue:{queue}:waiting")
    }

    pub fn delayed(queue: &str) -> String {
        format!("queue:{queue}:delayed")
    }

    pub fn active(queue: &str) -> String {
        format!("queue:{queue}:active")
    }

    pub fn completed(queue: &str) -> String {
        format!("queue:{queue}:completed")
    }

    pub fn failed(queue: &str) -> String {
        format!("queue:{queue}:failed")
    }

    pub fn paused(queue: &str) -> String {
        format!("queue:{queue}:paused")
    }
}
