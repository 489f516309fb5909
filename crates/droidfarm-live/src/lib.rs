//! LiveStore adapter
//!
//! Volatile fleet state over Redis-like semantics: string values, hashes,
//! sorted sets, sets, pub/sub, and an atomic pipeline commit. Key layout:
//!
//! ```text
//! live:node:{id}           hash    node state
//! live:device:{id}         hash    device state
//! live:node:{id}:devices   set     device ids owned by the node
//! live:execution:{id}      hash    execution state (TTL 30 min on terminal)
//! live:heartbeat           zset    node id -> last seen (ms)
//! ```
//!
//! Channels: `channel:state`, `channel:metrics`, `channel:alerts`.
//!
//! All write methods are idempotent given identical arguments; subscribe
//! delivers at-least-once; the Redis backend reconnects transparently via
//! `ConnectionManager`.

pub mod hash;
pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use memory::InMemoryLiveStore;
pub use redis_store::RedisLiveStore;
pub use store::{LiveStore, LiveStoreError, LiveSubscription, PipelineOp};
