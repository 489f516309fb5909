//! Per-device job buffer
//!
//! When a device is busy, additional dispatches for it queue here. Ordering
//! is strictly priority DESC then enqueued_at ASC. Persistence is optional:
//! a pluggable adapter receives debounced snapshots (default 1 s) and
//! `persist_now` flushes synchronously before shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

/// One locally buffered dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalJob {
    pub id: String,
    pub device_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Queue change notifications
#[derive(Debug, Clone)]
pub enum QueueEvent {
    JobEnqueued { job_id: String, device_id: String },
    JobDequeued { job_id: String, device_id: String },
    JobRemoved { job_id: String, device_id: String },
    /// Last job left the device's buffer
    QueueEmpty { device_id: String },
}

/// Serialisable snapshot of every device buffer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub buffers: HashMap<String, Vec<InternalJob>>,
}

/// Storage backend for queue snapshots
#[async_trait]
pub trait QueuePersistence: Send + Sync {
    async fn save(&self, snapshot: &QueueSnapshot) -> std::io::Result<()>;
    async fn load(&self) -> std::io::Result<Option<QueueSnapshot>>;
}

/// JSON-file persistence, written atomically via a temp file rename
pub struct FileQueuePersistence {
    path: PathBuf,
}

impl FileQueuePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl QueuePersistence for FileQueuePersistence {
    async fn save(&self, snapshot: &QueueSnapshot) -> std::io::Result<()> {
        let payload = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }

    async fn load(&self) -> std::io::Result<Option<QueueSnapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

const EVENT_CAPACITY: usize = 256;
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

pub struct InternalQueue {
    buffers: Mutex<HashMap<String, Vec<InternalJob>>>,
    events: broadcast::Sender<QueueEvent>,
    persistence: Option<Arc<dyn QueuePersistence>>,
    dirty: Arc<Notify>,
}

impl InternalQueue {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            buffers: Mutex::new(HashMap::new()),
            events,
            persistence: None,
            dirty: Arc::new(Notify::new()),
        }
    }

    /// Attach a persistence adapter. Spawns the debounced flush task; call
    /// [`InternalQueue::restore`] first when resuming from a snapshot.
    pub fn with_persistence(
        mut self,
        adapter: Arc<dyn QueuePersistence>,
        debounce: Duration,
    ) -> Arc<Self> {
        self.persistence = Some(adapter.clone());
        let queue = Arc::new(self);
        let flush_queue = queue.clone();
        let dirty = queue.dirty.clone();
        tokio::spawn(async move {
            loop {
                dirty.notified().await;
                tokio::time::sleep(debounce).await;
                if let Err(e) = flush_queue.persist_now().await {
                    warn!(error = %e, "queue snapshot flush failed");
                }
            }
        });
        queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Load a snapshot into the buffers, replacing current contents
    pub fn restore(&self, snapshot: QueueSnapshot) {
        let mut buffers = self.buffers.lock();
        *buffers = snapshot.buffers;
        for jobs in buffers.values_mut() {
            Self::sort_buffer(jobs);
        }
        debug!(
            devices = buffers.len(),
            "internal queue restored from snapshot"
        );
    }

    /// Write the current snapshot through the adapter immediately
    pub async fn persist_now(&self) -> std::io::Result<()> {
        let Some(adapter) = &self.persistence else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        adapter.save(&snapshot).await
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            buffers: self.buffers.lock().clone(),
        }
    }

    fn sort_buffer(jobs: &mut [InternalJob]) {
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
        });
    }

    /// Buffer a job. Enqueueing an id that is already buffered for the device
    /// is a no-op (idempotent re-dispatch).
    pub fn enqueue(&self, job: InternalJob) -> bool {
        let (job_id, device_id) = (job.id.clone(), job.device_id.clone());
        {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.entry(job.device_id.clone()).or_default();
            if buffer.iter().any(|j| j.id == job.id) {
                return false;
            }
            buffer.push(job);
            Self::sort_buffer(buffer);
        }
        let _ = self.events.send(QueueEvent::JobEnqueued { job_id, device_id });
        self.dirty.notify_one();
        true
    }

    /// Pop the highest-priority, earliest job for a device
    pub fn dequeue(&self, device_id: &str) -> Option<InternalJob> {
        let (job, emptied) = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.get_mut(device_id)?;
            if buffer.is_empty() {
                return None;
            }
            let job = buffer.remove(0);
            let emptied = buffer.is_empty();
            if emptied {
                buffers.remove(device_id);
            }
            (job, emptied)
        };
        let _ = self.events.send(QueueEvent::JobDequeued {
            job_id: job.id.clone(),
            device_id: device_id.to_string(),
        });
        if emptied {
            let _ = self.events.send(QueueEvent::QueueEmpty {
                device_id: device_id.to_string(),
            });
        }
        self.dirty.notify_one();
        Some(job)
    }

    /// Drop a buffered job wherever it sits. Returns false when unknown.
    pub fn remove(&self, job_id: &str) -> bool {
        let removed = {
            let mut buffers = self.buffers.lock();
            let mut found: Option<(String, bool)> = None;
            for (device_id, buffer) in buffers.iter_mut() {
                if let Some(pos) = buffer.iter().position(|j| j.id == job_id) {
                    buffer.remove(pos);
                    found = Some((device_id.clone(), buffer.is_empty()));
                    break;
                }
            }
            if let Some((device_id, emptied)) = &found {
                if *emptied {
                    buffers.remove(device_id);
                }
            }
            found
        };
        match removed {
            Some((device_id, emptied)) => {
                let _ = self.events.send(QueueEvent::JobRemoved {
                    job_id: job_id.to_string(),
                    device_id: device_id.clone(),
                });
                if emptied {
                    let _ = self.events.send(QueueEvent::QueueEmpty { device_id });
                }
                self.dirty.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn depth(&self, device_id: &str) -> usize {
        self.buffers
            .lock()
            .get(device_id)
            .map_or(0, |b| b.len())
    }

    pub fn total_depth(&self) -> usize {
        self.buffers.lock().values().map(|b| b.len()).sum()
    }
}

impl Default for InternalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, device: &str, priority: i32, at_ms: i64) -> InternalJob {
        InternalJob {
            id: id.into(),
            device_id: device.into(),
            workflow_id: "wf".into(),
            params: serde_json::Value::Null,
            priority,
            enqueued_at: DateTime::from_timestamp_millis(at_ms).unwrap(),
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn pops_priority_desc_then_fifo() {
        let queue = InternalQueue::new();
        queue.enqueue(job("low-early", "D1", 0, 100));
        queue.enqueue(job("high-late", "D1", 5, 300));
        queue.enqueue(job("high-early", "D1", 5, 200));

        assert_eq!(queue.dequeue("D1").unwrap().id, "high-early");
        assert_eq!(queue.dequeue("D1").unwrap().id, "high-late");
        assert_eq!(queue.dequeue("D1").unwrap().id, "low-early");
        assert!(queue.dequeue("D1").is_none());
    }

    #[tokio::test]
    async fn devices_are_isolated() {
        let queue = InternalQueue::new();
        queue.enqueue(job("a", "D1", 0, 100));
        queue.enqueue(job("b", "D2", 9, 100));

        assert_eq!(queue.dequeue("D1").unwrap().id, "a");
        assert_eq!(queue.depth("D2"), 1);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_noop() {
        let queue = InternalQueue::new();
        assert!(queue.enqueue(job("a", "D1", 0, 100)));
        assert!(!queue.enqueue(job("a", "D1", 3, 200)));
        assert_eq!(queue.depth("D1"), 1);
    }

    #[tokio::test]
    async fn empty_event_fires_when_last_job_leaves() {
        let queue = InternalQueue::new();
        let mut events = queue.subscribe();
        queue.enqueue(job("a", "D1", 0, 100));
        queue.dequeue("D1");

        let mut saw_empty = false;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::QueueEmpty { device_id } = event {
                assert_eq!(device_id, "D1");
                saw_empty = true;
            }
        }
        assert!(saw_empty);
    }

    #[tokio::test]
    async fn file_persistence_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let adapter = FileQueuePersistence::new(&path);

        let queue = InternalQueue::new();
        queue.enqueue(job("a", "D1", 2, 100));
        queue.enqueue(job("b", "D2", 0, 200));
        adapter.save(&queue.snapshot()).await.unwrap();

        let restored = InternalQueue::new();
        restored.restore(adapter.load().await.unwrap().unwrap());
        assert_eq!(restored.depth("D1"), 1);
        assert_eq!(restored.depth("D2"), 1);
        assert_eq!(restored.dequeue("D1").unwrap().id, "a");
    }

    #[tokio::test]
    async fn remove_unknown_job_returns_false() {
        let queue = InternalQueue::new();
        assert!(!queue.remove("ghost"));
        queue.enqueue(job("a", "D1", 0, 100));
        assert!(queue.remove("a"));
        assert_eq!(queue.total_depth(), 0);
    }
}
