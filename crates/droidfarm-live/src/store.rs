//! LiveStore trait definition

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Error type for live-store operations
#[derive(Debug, thiserror::Error)]
pub enum LiveStoreError {
    /// The backing store cannot be reached (the Redis backend retries
    /// transparently; this surfaces once retries are exhausted)
    #[error("live store unavailable: {0}")]
    Unavailable(String),

    /// A key holds a different structure than the operation expects
    #[error("wrong type for key {key}: expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
    },

    /// Stored payload failed to decode
    #[error("corrupt entry at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// One operation inside an atomic pipeline commit
#[derive(Debug, Clone)]
pub enum PipelineOp {
    Set { key: String, value: String },
    SetEx { key: String, value: String, ttl: Duration },
    Delete { key: String },
    HSet { key: String, fields: Vec<(String, String)> },
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    Expire { key: String, ttl: Duration },
    Publish { channel: String, payload: String },
}

/// An active pub/sub subscription
///
/// Delivery is at-least-once; a lagging subscriber may lose messages on the
/// Redis backend exactly as it would against a real Redis server.
pub struct LiveSubscription {
    rx: mpsc::Receiver<(String, String)>,
}

impl LiveSubscription {
    pub fn new(rx: mpsc::Receiver<(String, String)>) -> Self {
        Self { rx }
    }

    /// Next (channel, payload) message; `None` once the backend closes the
    /// subscription
    pub async fn next(&mut self) -> Option<(String, String)> {
        self.rx.recv().await
    }
}

/// Volatile state store with Redis semantics
///
/// All write methods are idempotent given identical arguments. Keys are
/// partitioned by entity id; there are no cross-key transactions beyond
/// [`LiveStore::pipeline`].
#[async_trait]
pub trait LiveStore: Send + Sync {
    // String values
    async fn get(&self, key: &str) -> Result<Option<String>, LiveStoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), LiveStoreError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LiveStoreError>;
    async fn delete(&self, key: &str) -> Result<(), LiveStoreError>;

    // Hashes
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), LiveStoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, LiveStoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, LiveStoreError>;

    // Sorted sets
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), LiveStoreError>;
    /// Members with `min <= score <= max`, ascending
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, LiveStoreError>;
    /// First `count` members by ascending (score, member) order
    async fn zrange_head(&self, key: &str, count: usize) -> Result<Vec<String>, LiveStoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<(), LiveStoreError>;
    async fn zcard(&self, key: &str) -> Result<u64, LiveStoreError>;

    // Sets
    async fn sadd(&self, key: &str, member: &str) -> Result<(), LiveStoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, LiveStoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), LiveStoreError>;
    async fn scard(&self, key: &str) -> Result<u64, LiveStoreError>;

    // Expiry
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), LiveStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, LiveStoreError>;

    // Pub/sub
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), LiveStoreError>;
    async fn subscribe(&self, channels: &[String]) -> Result<LiveSubscription, LiveStoreError>;

    /// Apply every op atomically (all-or-nothing as seen by readers)
    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), LiveStoreError>;

    /// Connectivity probe; the server fails fast on startup when this errors
    async fn ping(&self) -> Result<(), LiveStoreError>;
}
