//! QueueManager: durable FIFO+priority job queues
//!
//! One logical queue per node (`workflow:{node_id}`) plus a small set of
//! singleton queues. Queue structures live in the LiveStore so they survive
//! restarts:
//!
//! ```text
//! queue:{q}:job:{id}   hash   payload + state + attempt accounting
//! queue:{q}:waiting    zset   score = -priority, member = {created_ms:020}:{id}
//! queue:{q}:delayed    zset   score = ready-at ms, member = {id}
//! queue:{q}:active     set    ids being processed
//! queue:{q}:completed  zset   score = finished-at ms (grace cleaning)
//! queue:{q}:failed     zset   score = finished-at ms
//! queue:{q}:paused     string flag
//! ```
//!
//! Waiting order is priority DESC then FIFO: lower score pops first, and
//! equal scores tie-break lexically on the zero-padded creation timestamp.
//! QueueManager is the only writer of queue structures; mutating paths
//! serialise per queue name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use droidfarm_core::events::{EventBus, OrchestratorEvent};
use droidfarm_core::workflow::Workflow;
use droidfarm_live::{keys::queue as qkeys, LiveStore, LiveStoreError, PipelineOp};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Singleton queues that exist besides the per-node workflow queues
pub const SINGLETON_QUEUES: [&str; 4] =
    ["video-execution", "device-command", "scheduled-task", "cleanup"];

pub fn workflow_queue(node_id: &str) -> String {
    format!("workflow:{node_id}")
}

/// Retry and retention defaults
const DEFAULT_ATTEMPTS: u32 = 3;
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const REMOVE_ON_COMPLETE_COUNT: u64 = 1_000;
const REMOVE_ON_COMPLETE_AGE: Duration = Duration::from_secs(24 * 3600);
const REMOVE_ON_FAIL_COUNT: u64 = 5_000;
const REMOVE_ON_FAIL_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] LiveStoreError),

    #[error("corrupt job payload for {job_id}: {reason}")]
    CorruptJob { job_id: String, reason: String },
}

/// Where a job currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
    Missing,
}

/// One queued dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub job_id: String,
    pub workflow_id: String,
    /// Snapshot taken at enqueue time; later workflow edits do not affect
    /// in-flight jobs
    pub workflow: Workflow,
    pub execution_key: String,
    pub device_ids: Vec<String>,
    pub node_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts_made: u32,
}

/// Per-queue counters for stats and metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
}

impl QueueStats {
    pub fn depth(&self) -> u64 {
        self.waiting + self.delayed
    }
}

pub struct QueueManager {
    live: Arc<dyn LiveStore>,
    bus: EventBus,
    /// Serialises mutations per queue name
    queue_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Every queue this manager has touched (metrics iterate this)
    known_queues: DashMap<String, ()>,
    max_attempts: u32,
}

impl QueueManager {
    pub fn new(live: Arc<dyn LiveStore>, bus: EventBus) -> Arc<Self> {
        Self::with_max_attempts(live, bus, DEFAULT_ATTEMPTS)
    }

    pub fn with_max_attempts(
        live: Arc<dyn LiveStore>,
        bus: EventBus,
        max_attempts: u32,
    ) -> Arc<Self> {
        let manager = Self {
            live,
            bus,
            queue_locks: DashMap::new(),
            known_queues: DashMap::new(),
            max_attempts: max_attempts.max(1),
        };
        for queue in SINGLETON_QUEUES {
            manager.known_queues.insert(queue.to_string(), ());
        }
        Arc::new(manager)
    }

    fn lock_for(&self, queue: &str) -> Arc<Mutex<()>> {
        self.queue_locks
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn touch_queue(&self, queue: &str) {
        self.known_queues.insert(queue.to_string(), ());
    }

    pub fn known_queues(&self) -> Vec<String> {
        self.known_queues.iter().map(|e| e.key().clone()).collect()
    }

    fn waiting_member(job: &QueueJob) -> String {
        format!("{:020}:{}", job.created_at.timestamp_millis(), job.job_id)
    }

    fn backoff_delay(attempts_made: u32) -> Duration {
        // exponential 5s, 10s, 20s ... with 10% jitter against thundering herd
        let base = BACKOFF_INITIAL * 2u32.saturating_pow(attempts_made.saturating_sub(1));
        let jitter = 1.0 + rand::thread_rng().gen_range(-0.1..0.1);
        base.mul_f64(jitter)
    }

    async fn read_job(&self, queue: &str, job_id: &str) -> Result<Option<QueueJob>, QueueError> {
        let raw = self.live.hget(&qkeys::job(queue, job_id), "data").await?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                QueueError::CorruptJob {
                    job_id: job_id.to_string(),
                    reason: e.to_string(),
                }
            }),
            None => Ok(None),
        }
    }

    fn job_fields(job: &QueueJob, state: JobState) -> Result<Vec<(String, String)>, QueueError> {
        let data = serde_json::to_string(job).map_err(|e| QueueError::CorruptJob {
            job_id: job.job_id.clone(),
            reason: e.to_string(),
        })?;
        Ok(vec![
            ("data".to_string(), data),
            ("state".to_string(), state_str(state).to_string()),
            ("attempts_made".to_string(), job.attempts_made.to_string()),
        ])
    }

    // ------------------------------------------------------------------
    // Enqueue / consume
    // ------------------------------------------------------------------

    /// Enqueue onto the node's workflow queue. Idempotent by job id: a
    /// duplicate returns false and leaves the existing job untouched.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, node_id = %job.node_id))]
    pub async fn add_workflow_job(&self, job: QueueJob) -> Result<bool, QueueError> {
        let queue = workflow_queue(&job.node_id);
        self.add_job(&queue, job).await
    }

    pub async fn add_job(&self, queue: &str, job: QueueJob) -> Result<bool, QueueError> {
        self.touch_queue(queue);
        let lock = self.lock_for(queue);
        let _guard = lock.lock().await;

        if self.read_job(queue, &job.job_id).await?.is_some() {
            debug!(job_id = %job.job_id, queue, "duplicate enqueue ignored");
            return Ok(false);
        }

        self.live
            .pipeline(vec![
                PipelineOp::HSet {
                    key: qkeys::job(queue, &job.job_id),
                    fields: Self::job_fields(&job, JobState::Waiting)?,
                },
                PipelineOp::ZAdd {
                    key: qkeys::waiting(queue),
                    member: Self::waiting_member(&job),
                    score: -(job.priority as f64),
                },
            ])
            .await?;

        info!(job_id = %job.job_id, queue, priority = job.priority, "job added");
        self.bus.emit(OrchestratorEvent::JobAdded {
            queue: queue.to_string(),
            job_id: job.job_id.clone(),
        });
        Ok(true)
    }

    /// Pop the next runnable job: promotes due delayed entries first, skips
    /// paused queues, claims the head of the waiting order.
    pub async fn next_job(&self, queue: &str) -> Result<Option<QueueJob>, QueueError> {
        self.touch_queue(queue);
        let lock = self.lock_for(queue);
        let _guard = lock.lock().await;

        self.promote_due_locked(queue).await?;

        if self.live.exists(&qkeys::paused(queue)).await? {
            return Ok(None);
        }

        let head = self.live.zrange_head(&qkeys::waiting(queue), 1).await?;
        let Some(member) = head.first() else {
            return Ok(None);
        };
        let Some((_, job_id)) = member.split_once(':') else {
            warn!(queue, %member, "malformed waiting member dropped");
            self.live.zrem(&qkeys::waiting(queue), member).await?;
            return Ok(None);
        };
        let Some(mut job) = self.read_job(queue, job_id).await? else {
            // Hash gone (cleaned); drop the dangling member
            self.live.zrem(&qkeys::waiting(queue), member).await?;
            return Ok(None);
        };
        job.attempts_made += 1;

        self.live
            .pipeline(vec![
                PipelineOp::ZRem {
                    key: qkeys::waiting(queue),
                    member: member.clone(),
                },
                PipelineOp::SAdd {
                    key: qkeys::active(queue),
                    member: job.job_id.clone(),
                },
                PipelineOp::HSet {
                    key: qkeys::job(queue, &job.job_id),
                    fields: Self::job_fields(&job, JobState::Active)?,
                },
            ])
            .await?;
        Ok(Some(job))
    }

    /// Move due delayed jobs back to waiting. Called under the queue lock.
    async fn promote_due_locked(&self, queue: &str) -> Result<usize, QueueError> {
        let now = Utc::now().timestamp_millis() as f64;
        let due = self
            .live
            .zrange_by_score(&qkeys::delayed(queue), f64::NEG_INFINITY, now)
            .await?;
        for job_id in &due {
            let Some(job) = self.read_job(queue, job_id).await? else {
                self.live.zrem(&qkeys::delayed(queue), job_id).await?;
                continue;
            };
            self.live
                .pipeline(vec![
                    PipelineOp::ZRem {
                        key: qkeys::delayed(queue),
                        member: job_id.clone(),
                    },
                    PipelineOp::ZAdd {
                        key: qkeys::waiting(queue),
                        member: Self::waiting_member(&job),
                        score: -(job.priority as f64),
                    },
                    PipelineOp::HSet {
                        key: qkeys::job(queue, job_id),
                        fields: Self::job_fields(&job, JobState::Waiting)?,
                    },
                ])
                .await?;
        }
        Ok(due.len())
    }

    // ------------------------------------------------------------------
    // Completion / failure
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn complete_job(&self, queue: &str, job_id: &str) -> Result<(), QueueError> {
        let lock = self.lock_for(queue);
        let _guard = lock.lock().await;

        let Some(job) = self.read_job(queue, job_id).await? else {
            return Ok(());
        };
        let now = Utc::now().timestamp_millis() as f64;
        self.live
            .pipeline(vec![
                PipelineOp::SRem {
                    key: qkeys::active(queue),
                    member: job_id.to_string(),
                },
                PipelineOp::ZAdd {
                    key: qkeys::completed(queue),
                    member: job_id.to_string(),
                    score: now,
                },
                PipelineOp::HSet {
                    key: qkeys::job(queue, job_id),
                    fields: Self::job_fields(&job, JobState::Completed)?,
                },
            ])
            .await?;

        self.trim_finished(queue, FinishedSet::Completed).await?;
        self.bus.emit(OrchestratorEvent::JobCompleted {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
        });
        Ok(())
    }

    /// Record a failed attempt: schedules a retry with exponential backoff
    /// while attempts remain, otherwise parks the job in the failed set.
    #[instrument(skip(self, error))]
    pub async fn fail_job(&self, queue: &str, job_id: &str, error: &str) -> Result<(), QueueError> {
        let lock = self.lock_for(queue);
        let _guard = lock.lock().await;

        let Some(mut job) = self.read_job(queue, job_id).await? else {
            return Ok(());
        };
        let will_retry = job.attempts_made < self.max_attempts;

        if will_retry {
            let ready_at = Utc::now()
                + chrono::Duration::from_std(Self::backoff_delay(job.attempts_made))
                    .unwrap_or_else(|_| chrono::Duration::seconds(5));
            self.live
                .pipeline(vec![
                    PipelineOp::SRem {
                        key: qkeys::active(queue),
                        member: job_id.to_string(),
                    },
                    PipelineOp::ZAdd {
                        key: qkeys::delayed(queue),
                        member: job_id.to_string(),
                        score: ready_at.timestamp_millis() as f64,
                    },
                    PipelineOp::HSet {
                        key: qkeys::job(queue, job_id),
                        fields: Self::job_fields(&job, JobState::Delayed)?,
                    },
                ])
                .await?;
            info!(job_id, queue, attempt = job.attempts_made, "job failed, retry scheduled");
        } else {
            job.attempts_made = job.attempts_made.max(self.max_attempts);
            let now = Utc::now().timestamp_millis() as f64;
            let mut fields = Self::job_fields(&job, JobState::Failed)?;
            fields.push(("failed_reason".to_string(), error.to_string()));
            self.live
                .pipeline(vec![
                    PipelineOp::SRem {
                        key: qkeys::active(queue),
                        member: job_id.to_string(),
                    },
                    PipelineOp::ZAdd {
                        key: qkeys::failed(queue),
                        member: job_id.to_string(),
                        score: now,
                    },
                    PipelineOp::HSet {
                        key: qkeys::job(queue, job_id),
                        fields,
                    },
                ])
                .await?;
            warn!(job_id, queue, error, "job failed permanently");
            self.trim_finished(queue, FinishedSet::Failed).await?;
        }

        self.bus.emit(OrchestratorEvent::JobFailed {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
            execution_key: job.execution_key.clone(),
            error: error.to_string(),
            will_retry,
        });
        Ok(())
    }

    pub async fn report_progress(
        &self,
        queue: &str,
        job_id: &str,
        progress: u8,
    ) -> Result<(), QueueError> {
        self.bus.emit(OrchestratorEvent::JobProgress {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
            progress,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inspection / control
    // ------------------------------------------------------------------

    pub async fn get_job_status(
        &self,
        job_id: &str,
        queue: &str,
    ) -> Result<JobState, QueueError> {
        let state = self.live.hget(&qkeys::job(queue, job_id), "state").await?;
        let Some(state) = state else {
            return Ok(JobState::Missing);
        };
        let state = parse_state(&state);
        if state == JobState::Waiting && self.live.exists(&qkeys::paused(queue)).await? {
            return Ok(JobState::Paused);
        }
        Ok(state)
    }

    /// Status lookup without a queue hint: scans every known queue
    pub async fn find_job_status(&self, job_id: &str) -> Result<JobState, QueueError> {
        for queue in self.known_queues() {
            let state = self.get_job_status(job_id, &queue).await?;
            if state != JobState::Missing {
                return Ok(state);
            }
        }
        Ok(JobState::Missing)
    }

    /// Cancel a job. Waiting/delayed entries are removed outright; an active
    /// job gets a cancel request on the bus and returns true (the running
    /// side honors the abort). Finished or unknown jobs return false.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: &str, queue: &str) -> Result<bool, QueueError> {
        let lock = self.lock_for(queue);
        let _guard = lock.lock().await;

        let Some(job) = self.read_job(queue, job_id).await? else {
            return Ok(false);
        };
        let state = self
            .live
            .hget(&qkeys::job(queue, job_id), "state")
            .await?
            .map(|s| parse_state(&s))
            .unwrap_or(JobState::Missing);

        match state {
            JobState::Waiting | JobState::Delayed | JobState::Paused => {
                self.live
                    .pipeline(vec![
                        PipelineOp::ZRem {
                            key: qkeys::waiting(queue),
                            member: Self::waiting_member(&job),
                        },
                        PipelineOp::ZRem {
                            key: qkeys::delayed(queue),
                            member: job_id.to_string(),
                        },
                        PipelineOp::Delete {
                            key: qkeys::job(queue, job_id),
                        },
                    ])
                    .await?;
                info!(job_id, queue, "queued job cancelled");
                Ok(true)
            }
            JobState::Active => {
                self.bus.emit(OrchestratorEvent::JobCancelRequest {
                    queue: queue.to_string(),
                    job_id: job_id.to_string(),
                });
                Ok(true)
            }
            JobState::Completed | JobState::Failed | JobState::Missing => Ok(false),
        }
    }

    /// Re-enqueue up to `limit` failed jobs; returns how many moved
    pub async fn retry_failed_jobs(&self, queue: &str, limit: usize) -> Result<usize, QueueError> {
        let lock = self.lock_for(queue);
        let _guard = lock.lock().await;

        let failed = self.live.zrange_head(&qkeys::failed(queue), limit).await?;
        let mut moved = 0;
        for job_id in failed {
            let Some(mut job) = self.read_job(queue, &job_id).await? else {
                self.live.zrem(&qkeys::failed(queue), &job_id).await?;
                continue;
            };
            job.attempts_made = 0;
            self.live
                .pipeline(vec![
                    PipelineOp::ZRem {
                        key: qkeys::failed(queue),
                        member: job_id.clone(),
                    },
                    PipelineOp::ZAdd {
                        key: qkeys::waiting(queue),
                        member: Self::waiting_member(&job),
                        score: -(job.priority as f64),
                    },
                    PipelineOp::HSet {
                        key: qkeys::job(queue, &job_id),
                        fields: Self::job_fields(&job, JobState::Waiting)?,
                    },
                ])
                .await?;
            moved += 1;
        }
        if moved > 0 {
            info!(queue, moved, "failed jobs re-enqueued");
        }
        Ok(moved)
    }

    /// Delete completed and failed jobs older than `grace`, up to `limit`
    pub async fn clean_queue(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
    ) -> Result<usize, QueueError> {
        let lock = self.lock_for(queue);
        let _guard = lock.lock().await;

        let cutoff = (Utc::now()
            - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero()))
        .timestamp_millis() as f64;
        let mut removed = 0;

        for set_key in [qkeys::completed(queue), qkeys::failed(queue)] {
            if removed >= limit {
                break;
            }
            let old = self
                .live
                .zrange_by_score(&set_key, f64::NEG_INFINITY, cutoff)
                .await?;
            for job_id in old.into_iter().take(limit - removed) {
                self.live
                    .pipeline(vec![
                        PipelineOp::ZRem {
                            key: set_key.clone(),
                            member: job_id.clone(),
                        },
                        PipelineOp::Delete {
                            key: qkeys::job(queue, &job_id),
                        },
                    ])
                    .await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(queue, removed, "queue cleaned");
        }
        Ok(removed)
    }

    pub async fn pause_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.live.set(&qkeys::paused(queue), "1").await?;
        info!(queue, "queue paused");
        Ok(())
    }

    pub async fn resume_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.live.delete(&qkeys::paused(queue)).await?;
        info!(queue, "queue resumed");
        Ok(())
    }

    pub async fn get_queue_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            waiting: self.live.zcard(&qkeys::waiting(queue)).await?,
            delayed: self.live.zcard(&qkeys::delayed(queue)).await?,
            active: self.live.scard(&qkeys::active(queue)).await?,
            completed: self.live.zcard(&qkeys::completed(queue)).await?,
            failed: self.live.zcard(&qkeys::failed(queue)).await?,
            paused: self.live.exists(&qkeys::paused(queue)).await?,
        })
    }

    /// Depths of every known queue, for the metrics snapshot
    pub async fn all_queue_depths(&self) -> Result<HashMap<String, u64>, QueueError> {
        let mut depths = HashMap::new();
        for queue in self.known_queues() {
            let stats = self.get_queue_stats(&queue).await?;
            depths.insert(queue, stats.depth());
        }
        Ok(depths)
    }

    /// Retention: cap finished sets by count and age
    async fn trim_finished(&self, queue: &str, set: FinishedSet) -> Result<(), QueueError> {
        let (set_key, max_count, max_age) = match set {
            FinishedSet::Completed => (
                qkeys::completed(queue),
                REMOVE_ON_COMPLETE_COUNT,
                REMOVE_ON_COMPLETE_AGE,
            ),
            FinishedSet::Failed => {
                (qkeys::failed(queue), REMOVE_ON_FAIL_COUNT, REMOVE_ON_FAIL_AGE)
            }
        };

        let cutoff = (Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero()))
        .timestamp_millis() as f64;
        for job_id in self
            .live
            .zrange_by_score(&set_key, f64::NEG_INFINITY, cutoff)
            .await?
        {
            self.live
                .pipeline(vec![
                    PipelineOp::ZRem {
                        key: set_key.clone(),
                        member: job_id.clone(),
                    },
                    PipelineOp::Delete {
                        key: qkeys::job(queue, &job_id),
                    },
                ])
                .await?;
        }

        let count = self.live.zcard(&set_key).await?;
        if count > max_count {
            let excess = (count - max_count) as usize;
            for job_id in self.live.zrange_head(&set_key, excess).await? {
                self.live
                    .pipeline(vec![
                        PipelineOp::ZRem {
                            key: set_key.clone(),
                            member: job_id.clone(),
                        },
                        PipelineOp::Delete {
                            key: qkeys::job(queue, &job_id),
                        },
                    ])
                    .await?;
            }
        }
        Ok(())
    }
}

enum FinishedSet {
    Completed,
    Failed,
}

fn state_str(state: JobState) -> &'static str {
    match state {
        JobState::Waiting => "waiting",
        JobState::Active => "active",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Delayed => "delayed",
        JobState::Paused => "paused",
        JobState::Missing => "missing",
    }
}

fn parse_state(raw: &str) -> JobState {
    match raw {
        "waiting" => JobState::Waiting,
        "active" => JobState::Active,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        "delayed" => JobState::Delayed,
        _ => JobState::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidfarm_core::workflow::{StepAction, WorkflowStep};
    use droidfarm_live::InMemoryLiveStore;

    fn manager() -> Arc<QueueManager> {
        QueueManager::new(Arc::new(InMemoryLiveStore::new()), EventBus::new())
    }

    fn job(id: &str, priority: i32, created_ms: i64) -> QueueJob {
        QueueJob {
            job_id: id.to_string(),
            workflow_id: "wf-1".to_string(),
            workflow: Workflow::new(
                "wf-1",
                "demo",
                vec![WorkflowStep::new("tap", StepAction::AgentScript)],
            ),
            execution_key: format!("exec_{created_ms}_testsuite"),
            device_ids: vec!["D1".to_string()],
            node_id: "N1".to_string(),
            params: serde_json::Value::Null,
            priority,
            created_at: DateTime::from_timestamp_millis(created_ms).unwrap(),
            attempts_made: 0,
        }
    }

    const Q: &str = "workflow:N1";

    #[tokio::test]
    async fn pops_priority_desc_then_fifo() {
        let queues = manager();
        queues.add_job(Q, job("low-early", 0, 1_000)).await.unwrap();
        queues.add_job(Q, job("high-late", 5, 3_000)).await.unwrap();
        queues.add_job(Q, job("high-early", 5, 2_000)).await.unwrap();

        let order: Vec<String> = {
            let mut order = vec![];
            while let Some(j) = queues.next_job(Q).await.unwrap() {
                order.push(j.job_id);
            }
            order
        };
        assert_eq!(order, ["high-early", "high-late", "low-early"]);
    }

    #[tokio::test]
    async fn duplicate_job_id_is_rejected() {
        let queues = manager();
        assert!(queues.add_job(Q, job("j1", 0, 1_000)).await.unwrap());
        assert!(!queues.add_job(Q, job("j1", 9, 2_000)).await.unwrap());

        let stats = queues.get_queue_stats(Q).await.unwrap();
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn paused_queue_holds_jobs_until_resume() {
        let queues = manager();
        queues.pause_queue(Q).await.unwrap();
        queues.add_job(Q, job("j1", 0, 1_000)).await.unwrap();
        queues.add_job(Q, job("j2", 3, 2_000)).await.unwrap();

        assert!(queues.next_job(Q).await.unwrap().is_none());
        assert_eq!(queues.get_job_status("j1", Q).await.unwrap(), JobState::Paused);

        queues.resume_queue(Q).await.unwrap();
        // drains in priority+FIFO order
        assert_eq!(queues.next_job(Q).await.unwrap().unwrap().job_id, "j2");
        assert_eq!(queues.next_job(Q).await.unwrap().unwrap().job_id, "j1");
    }

    #[tokio::test]
    async fn failed_job_retries_with_delay_then_parks() {
        let queues = manager();
        queues.add_job(Q, job("j1", 0, 1_000)).await.unwrap();

        // attempt 1
        let j = queues.next_job(Q).await.unwrap().unwrap();
        assert_eq!(j.attempts_made, 1);
        queues.fail_job(Q, "j1", "boom").await.unwrap();
        assert_eq!(queues.get_job_status("j1", Q).await.unwrap(), JobState::Delayed);

        // not due yet
        assert!(queues.next_job(Q).await.unwrap().is_none());

        // force the delayed entry due, then exhaust the remaining attempts
        for attempt in 2..=3 {
            queues
                .live
                .zadd(&qkeys::delayed(Q), "j1", 0.0)
                .await
                .unwrap();
            let j = queues.next_job(Q).await.unwrap().unwrap();
            assert_eq!(j.attempts_made, attempt);
            queues.fail_job(Q, "j1", "boom").await.unwrap();
        }

        assert_eq!(queues.get_job_status("j1", Q).await.unwrap(), JobState::Failed);
        let stats = queues.get_queue_stats(Q).await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn cancel_semantics_by_state() {
        let queues = manager();
        queues.add_job(Q, job("waiting", 0, 1_000)).await.unwrap();
        queues.add_job(Q, job("active", 5, 2_000)).await.unwrap();

        let popped = queues.next_job(Q).await.unwrap().unwrap();
        assert_eq!(popped.job_id, "active");

        // waiting: removed outright
        assert!(queues.cancel_job("waiting", Q).await.unwrap());
        assert_eq!(
            queues.get_job_status("waiting", Q).await.unwrap(),
            JobState::Missing
        );

        // active: cancel request emitted, job stays active
        let mut events = queues.bus.subscribe();
        assert!(queues.cancel_job("active", Q).await.unwrap());
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), "job:cancel-request");

        // completed: no-op
        queues.complete_job(Q, "active").await.unwrap();
        assert!(!queues.cancel_job("active", Q).await.unwrap());
    }

    #[tokio::test]
    async fn retry_failed_jobs_re_enqueues() {
        let queues = manager();
        queues.add_job(Q, job("j1", 0, 1_000)).await.unwrap();
        for _ in 0..3 {
            queues.live.zadd(&qkeys::delayed(Q), "j1", 0.0).await.unwrap();
            queues.next_job(Q).await.unwrap();
            queues.fail_job(Q, "j1", "boom").await.unwrap();
        }
        assert_eq!(queues.get_job_status("j1", Q).await.unwrap(), JobState::Failed);

        assert_eq!(queues.retry_failed_jobs(Q, 10).await.unwrap(), 1);
        assert_eq!(queues.get_job_status("j1", Q).await.unwrap(), JobState::Waiting);
        let j = queues.next_job(Q).await.unwrap().unwrap();
        assert_eq!(j.attempts_made, 1);
    }

    #[tokio::test]
    async fn clean_queue_respects_grace() {
        let queues = manager();
        queues.add_job(Q, job("old", 0, 1_000)).await.unwrap();
        queues.next_job(Q).await.unwrap();
        queues.complete_job(Q, "old").await.unwrap();

        // grace of one hour keeps the fresh completion
        assert_eq!(
            queues
                .clean_queue(Q, Duration::from_secs(3600), 100)
                .await
                .unwrap(),
            0
        );
        // zero grace removes it
        assert_eq!(
            queues.clean_queue(Q, Duration::ZERO, 100).await.unwrap(),
            1
        );
        assert_eq!(
            queues.get_job_status("old", Q).await.unwrap(),
            JobState::Missing
        );
    }
}
