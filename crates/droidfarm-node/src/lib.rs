// Droidfarm node worker
//
// The node-side half of the orchestrator: keeps one WebSocket session to the
// server, buffers per-device dispatches in an internal priority queue, and
// runs agent steps against devices through a driver trait. Real device
// drivers (ADB, screen capture, input) plug in behind `DeviceDriver`; the
// simulated driver ships so the whole dispatch path runs without hardware.

pub mod config;
pub mod driver;
pub mod executor;
pub mod internal_queue;
pub mod session;

pub use config::NodeConfig;
pub use driver::{DeviceDriver, DriverError, SimulatedDriver};
pub use executor::JobExecutor;
pub use internal_queue::{
    FileQueuePersistence, InternalJob, InternalQueue, QueueEvent, QueuePersistence, QueueSnapshot,
};
pub use session::NodeSession;
