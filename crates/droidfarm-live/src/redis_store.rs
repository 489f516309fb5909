//! Redis implementation of LiveStore
//!
//! Uses `ConnectionManager`, which multiplexes one connection and reconnects
//! transparently with backoff. Pub/sub needs its own connection; the
//! subscription task re-subscribes after a dropped link, so delivery stays
//! at-least-once for a live subscriber (messages sent while the link is down
//! are lost, same as a real Redis client).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::{LiveStore, LiveStoreError, LiveSubscription, PipelineOp};

/// Delay before a dropped pub/sub connection is re-established
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub struct RedisLiveStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisLiveStore {
    /// Connect to Redis; fails when the server is unreachable so startup can
    /// fail fast.
    pub async fn connect(url: &str) -> Result<Self, LiveStoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        debug!(url, "live store connected");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn unavailable(e: redis::RedisError) -> LiveStoreError {
    LiveStoreError::Unavailable(e.to_string())
}

fn push_op(pipe: &mut redis::Pipeline, op: PipelineOp) {
    match op {
        PipelineOp::Set { key, value } => {
            pipe.set(key, value).ignore();
        }
        PipelineOp::SetEx { key, value, ttl } => {
            pipe.set_ex(key, value, ttl.as_secs()).ignore();
        }
        PipelineOp::Delete { key } => {
            pipe.del(key).ignore();
        }
        PipelineOp::HSet { key, fields } => {
            pipe.hset_multiple(key, &fields).ignore();
        }
        PipelineOp::ZAdd { key, member, score } => {
            pipe.zadd(key, member, score).ignore();
        }
        PipelineOp::ZRem { key, member } => {
            pipe.zrem(key, member).ignore();
        }
        PipelineOp::SAdd { key, member } => {
            pipe.sadd(key, member).ignore();
        }
        PipelineOp::SRem { key, member } => {
            pipe.srem(key, member).ignore();
        }
        PipelineOp::Expire { key, ttl } => {
            pipe.expire(key, ttl.as_secs() as i64).ignore();
        }
        PipelineOp::Publish { channel, payload } => {
            pipe.publish(channel, payload).ignore();
        }
    }
}

#[async_trait]
impl LiveStore for RedisLiveStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LiveStoreError> {
        self.conn().get(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), LiveStoreError> {
        self.conn().set(key, value).await.map_err(unavailable)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LiveStoreError> {
        self.conn()
            .set_ex(key, value, ttl.as_secs())
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> Result<(), LiveStoreError> {
        self.conn().del(key).await.map_err(unavailable)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), LiveStoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.conn()
            .hset_multiple(key, fields)
            .await
            .map_err(unavailable)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, LiveStoreError> {
        self.conn().hget(key, field).await.map_err(unavailable)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, LiveStoreError> {
        self.conn().hgetall(key).await.map_err(unavailable)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), LiveStoreError> {
        self.conn()
            .zadd(key, member, score)
            .await
            .map_err(unavailable)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, LiveStoreError> {
        self.conn()
            .zrangebyscore(key, min, max)
            .await
            .map_err(unavailable)
    }

    async fn zrange_head(&self, key: &str, count: usize) -> Result<Vec<String>, LiveStoreError> {
        if count == 0 {
            return Ok(vec![]);
        }
        self.conn()
            .zrange(key, 0, count as isize - 1)
            .await
            .map_err(unavailable)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), LiveStoreError> {
        self.conn().zrem(key, member).await.map_err(unavailable)
    }

    async fn zcard(&self, key: &str) -> Result<u64, LiveStoreError> {
        self.conn().zcard(key).await.map_err(unavailable)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), LiveStoreError> {
        self.conn().sadd(key, member).await.map_err(unavailable)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, LiveStoreError> {
        self.conn().smembers(key).await.map_err(unavailable)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), LiveStoreError> {
        self.conn().srem(key, member).await.map_err(unavailable)
    }

    async fn scard(&self, key: &str) -> Result<u64, LiveStoreError> {
        self.conn().scard(key).await.map_err(unavailable)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), LiveStoreError> {
        self.conn()
            .expire(key, ttl.as_secs() as i64)
            .await
            .map_err(unavailable)
    }

    async fn exists(&self, key: &str) -> Result<bool, LiveStoreError> {
        self.conn().exists(key).await.map_err(unavailable)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), LiveStoreError> {
        self.conn()
            .publish(channel, payload)
            .await
            .map_err(unavailable)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<LiveSubscription, LiveStoreError> {
        let client = self.client.clone();
        let channels = channels.to_vec();
        let (tx, rx) = mpsc::channel(4096);

        // First subscription happens before we return so a connect error is
        // visible to the caller; later reconnects are handled in the task.
        let mut pubsub = client.get_async_pubsub().await.map_err(unavailable)?;
        for channel in &channels {
            pubsub.subscribe(channel).await.map_err(unavailable)?;
        }

        tokio::spawn(async move {
            loop {
                {
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        let channel = msg.get_channel_name().to_string();
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(%channel, error = %e, "non-text pub/sub payload dropped");
                                continue;
                            }
                        };
                        if tx.send((channel, payload)).await.is_err() {
                            return;
                        }
                    }
                }
                // Stream ended: the connection dropped. Re-subscribe.
                if tx.is_closed() {
                    return;
                }
                warn!("pub/sub connection lost, re-subscribing");
                loop {
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    match client.get_async_pubsub().await {
                        Ok(mut fresh) => {
                            let mut ok = true;
                            for channel in &channels {
                                if fresh.subscribe(channel).await.is_err() {
                                    ok = false;
                                    break;
                                }
                            }
                            if ok {
                                pubsub = fresh;
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "pub/sub reconnect failed, retrying");
                        }
                    }
                }
            }
        });

        Ok(LiveSubscription::new(rx))
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), LiveStoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            push_op(&mut pipe, op);
        }
        pipe.query_async(&mut self.conn())
            .await
            .map_err(unavailable)
    }

    async fn ping(&self) -> Result<(), LiveStoreError> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn())
            .await
            .map(|_| ())
            .map_err(unavailable)
    }
}
