//! DurableStore adapter
//!
//! Typed operations over the store of record: nodes, devices, device states,
//! workflows, executions, logs, alerts, settings. Two backends:
//!
//! - [`PostgresDurableStore`] for production (sqlx), with the atomic counter
//!   functions installed by the embedded migration and a compare-and-set
//!   fallback when a deployment lacks them
//! - [`InMemoryDurableStore`] for hermetic tests

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryDurableStore;
pub use models::*;
pub use postgres::PostgresDurableStore;
pub use store::{DurableStore, DurableStoreError, ExecutionCounts};
