//! In-memory implementation of LiveStore for testing
//!
//! Mirrors the Redis backend's semantics: lazy TTL expiry, (score, member)
//! ordering for sorted sets, at-least-once pub/sub, and pipeline atomicity
//! (one lock held across the batch).

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::store::{LiveStore, LiveStoreError, LiveSubscription, PipelineOp};

#[derive(Debug, Clone)]
enum Structure {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
    Set(HashSet<String>),
}

impl Structure {
    fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Hash(_) => "hash",
            Self::ZSet(_) => "zset",
            Self::Set(_) => "set",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Structure,
    expires_at: Option<Instant>,
}

/// Pub/sub fan-out capacity; matches the bus sizing
const PUBSUB_CAPACITY: usize = 4096;

pub struct InMemoryLiveStore {
    entries: Mutex<HashMap<String, Entry>>,
    pubsub: broadcast::Sender<(String, String)>,
}

impl InMemoryLiveStore {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            pubsub,
        }
    }

    /// Number of live (unexpired) keys, for test assertions
    pub fn key_count(&self) -> usize {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.len()
    }

    fn sweep(entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at.map_or(true, |at| at > now));
    }

    fn live_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'a mut Entry> {
        let expired = entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn wrong_type(key: &str, expected: &'static str) -> LiveStoreError {
        LiveStoreError::WrongType {
            key: key.to_string(),
            expected,
        }
    }

    fn apply_op(
        entries: &mut HashMap<String, Entry>,
        pubsub: &broadcast::Sender<(String, String)>,
        op: PipelineOp,
    ) -> Result<(), LiveStoreError> {
        match op {
            PipelineOp::Set { key, value } => {
                entries.insert(
                    key,
                    Entry {
                        value: Structure::Str(value),
                        expires_at: None,
                    },
                );
            }
            PipelineOp::SetEx { key, value, ttl } => {
                entries.insert(
                    key,
                    Entry {
                        value: Structure::Str(value),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
            }
            PipelineOp::Delete { key } => {
                entries.remove(&key);
            }
            PipelineOp::HSet { key, fields } => {
                let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Structure::Hash(HashMap::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    Structure::Hash(map) => {
                        map.extend(fields);
                    }
                    _ => return Err(Self::wrong_type(&key, "hash")),
                }
            }
            PipelineOp::ZAdd { key, member, score } => {
                let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Structure::ZSet(HashMap::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    Structure::ZSet(map) => {
                        map.insert(member, score);
                    }
                    _ => return Err(Self::wrong_type(&key, "zset")),
                }
            }
            PipelineOp::ZRem { key, member } => {
                if let Some(entry) = entries.get_mut(&key) {
                    match &mut entry.value {
                        Structure::ZSet(map) => {
                            map.remove(&member);
                        }
                        _ => return Err(Self::wrong_type(&key, "zset")),
                    }
                }
            }
            PipelineOp::SAdd { key, member } => {
                let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Structure::Set(HashSet::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    Structure::Set(set) => {
                        set.insert(member);
                    }
                    _ => return Err(Self::wrong_type(&key, "set")),
                }
            }
            PipelineOp::SRem { key, member } => {
                if let Some(entry) = entries.get_mut(&key) {
                    match &mut entry.value {
                        Structure::Set(set) => {
                            set.remove(&member);
                        }
                        _ => return Err(Self::wrong_type(&key, "set")),
                    }
                }
            }
            PipelineOp::Expire { key, ttl } => {
                if let Some(entry) = entries.get_mut(&key) {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
            }
            PipelineOp::Publish { channel, payload } => {
                let _ = pubsub.send((channel, payload));
            }
        }
        Ok(())
    }
}

impl Default for InMemoryLiveStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveStore for InMemoryLiveStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LiveStoreError> {
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(e) => match &e.value {
                Structure::Str(s) => Ok(Some(s.clone())),
                _ => Err(Self::wrong_type(key, "string")),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), LiveStoreError> {
        self.pipeline(vec![PipelineOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        }])
        .await
    }

    async fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), LiveStoreError> {
        self.pipeline(vec![PipelineOp::SetEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        }])
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), LiveStoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), LiveStoreError> {
        self.pipeline(vec![PipelineOp::HSet {
            key: key.to_string(),
            fields: fields.to_vec(),
        }])
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, LiveStoreError> {
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(e) => match &e.value {
                Structure::Hash(map) => Ok(map.get(field).cloned()),
                _ => Err(Self::wrong_type(key, "hash")),
            },
            None => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, LiveStoreError> {
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(e) => match &e.value {
                Structure::Hash(map) => Ok(map.clone()),
                _ => Err(Self::wrong_type(key, "hash")),
            },
            None => Ok(HashMap::new()),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), LiveStoreError> {
        self.pipeline(vec![PipelineOp::ZAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        }])
        .await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, LiveStoreError> {
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(e) => match &e.value {
                Structure::ZSet(map) => {
                    let mut members: Vec<(&String, f64)> = map
                        .iter()
                        .filter(|(_, s)| **s >= min && **s <= max)
                        .map(|(m, s)| (m, *s))
                        .collect();
                    members.sort_by(|a, b| {
                        a.1.partial_cmp(&b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(b.0))
                    });
                    Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
                }
                _ => Err(Self::wrong_type(key, "zset")),
            },
            None => Ok(vec![]),
        }
    }

    async fn zrange_head(&self, key: &str, count: usize) -> Result<Vec<String>, LiveStoreError> {
        let mut all = self.zrange_by_score(key, f64::NEG_INFINITY, f64::INFINITY).await?;
        all.truncate(count);
        Ok(all)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), LiveStoreError> {
        self.pipeline(vec![PipelineOp::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        }])
        .await
    }

    async fn zcard(&self, key: &str) -> Result<u64, LiveStoreError> {
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(e) => match &e.value {
                Structure::ZSet(map) => Ok(map.len() as u64),
                _ => Err(Self::wrong_type(key, "zset")),
            },
            None => Ok(0),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), LiveStoreError> {
        self.pipeline(vec![PipelineOp::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        }])
        .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, LiveStoreError> {
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(e) => match &e.value {
                Structure::Set(set) => {
                    let mut members: Vec<String> = set.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                _ => Err(Self::wrong_type(key, "set")),
            },
            None => Ok(vec![]),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), LiveStoreError> {
        self.pipeline(vec![PipelineOp::SRem {
            key: key.to_string(),
            member: member.to_string(),
        }])
        .await
    }

    async fn scard(&self, key: &str) -> Result<u64, LiveStoreError> {
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key) {
            Some(e) => match &e.value {
                Structure::Set(set) => Ok(set.len() as u64),
                _ => Err(Self::wrong_type(key, "set")),
            },
            None => Ok(0),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), LiveStoreError> {
        self.pipeline(vec![PipelineOp::Expire {
            key: key.to_string(),
            ttl,
        }])
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, LiveStoreError> {
        let mut entries = self.entries.lock();
        Ok(Self::live_entry(&mut entries, key).is_some())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), LiveStoreError> {
        let _ = self.pubsub.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<LiveSubscription, LiveStoreError> {
        let mut rx = self.pubsub.subscribe();
        let (tx, out) = mpsc::channel(PUBSUB_CAPACITY);
        let wanted: HashSet<String> = channels.iter().cloned().collect();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((channel, payload)) => {
                        if wanted.contains(&channel)
                            && tx.send((channel, payload)).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(LiveSubscription::new(out))
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> Result<(), LiveStoreError> {
        let mut entries = self.entries.lock();
        for op in ops {
            Self::apply_op(&mut entries, &self.pubsub, op)?;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), LiveStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_ttl_expires_lazily() {
        let store = InMemoryLiveStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zset_orders_by_score_then_member() {
        let store = InMemoryLiveStore::new();
        store.zadd("z", "b", 2.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "c", 1.0).await.unwrap();

        let members = store
            .zrange_by_score("z", f64::NEG_INFINITY, f64::INFINITY)
            .await
            .unwrap();
        assert_eq!(members, ["a", "c", "b"]);

        let head = store.zrange_head("z", 2).await.unwrap();
        assert_eq!(head, ["a", "c"]);
    }

    #[tokio::test]
    async fn zadd_overwrites_score() {
        let store = InMemoryLiveStore::new();
        store.zadd("z", "n1", 100.0).await.unwrap();
        store.zadd("z", "n1", 200.0).await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 1);
        assert!(store
            .zrange_by_score("z", 150.0, 250.0)
            .await
            .unwrap()
            .contains(&"n1".to_string()));
    }

    #[tokio::test]
    async fn pubsub_filters_by_channel() {
        let store = InMemoryLiveStore::new();
        let mut sub = store
            .subscribe(&["channel:state".to_string()])
            .await
            .unwrap();

        store.publish("channel:metrics", "ignored").await.unwrap();
        store.publish("channel:state", "seen").await.unwrap();

        let (channel, payload) = sub.next().await.unwrap();
        assert_eq!(channel, "channel:state");
        assert_eq!(payload, "seen");
    }

    #[tokio::test]
    async fn pipeline_applies_all_ops() {
        let store = InMemoryLiveStore::new();
        store
            .pipeline(vec![
                PipelineOp::HSet {
                    key: "live:node:n1".into(),
                    fields: vec![("status".into(), "online".into())],
                },
                PipelineOp::ZAdd {
                    key: "live:heartbeat".into(),
                    member: "n1".into(),
                    score: 123.0,
                },
                PipelineOp::SAdd {
                    key: "live:node:n1:devices".into(),
                    member: "D1".into(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            store.hget("live:node:n1", "status").await.unwrap().as_deref(),
            Some("online")
        );
        assert_eq!(store.zcard("live:heartbeat").await.unwrap(), 1);
        assert_eq!(store.smembers("live:node:n1:devices").await.unwrap(), ["D1"]);
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let store = InMemoryLiveStore::new();
        store.set("k", "v").await.unwrap();
        let err = store.hgetall("k").await.unwrap_err();
        assert!(matches!(err, LiveStoreError::WrongType { .. }));
    }
}
