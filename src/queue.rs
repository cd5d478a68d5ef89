//! Persistent job queue for inbound messages.
//!
//! One logical queue `whatsapp-messages` plus a parallel DLQ
//! `whatsapp-messages-dlq`. The job id IS the gateway `messageId`, so
//! duplicate deliveries collapse into one logical processing. Reservations
//! are tracked with their timestamp; a stalled scan re-queues reservations
//! older than the lock and writes them off to the DLQ after too many stalls.
//! DLQ entries are never auto-removed; `retry_from_dlq` is the only way out.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::CoreResult;
use crate::types::ParsedMessage;

// ─── Keys ───────────────────────────────────────────────────────────────────

pub const QUEUE_NAME: &str = "whatsapp-messages";
pub const DLQ_NAME: &str = "whatsapp-messages-dlq";

const WAITING_KEY: &str = "queue:whatsapp-messages";
const ACTIVE_KEY: &str = "queue:whatsapp-messages:active";
const IDS_KEY: &str = "queue:whatsapp-messages:ids";
const FAILED_KEY: &str = "queue:whatsapp-messages:failed";
const DLQ_KEY: &str = "queue:whatsapp-messages-dlq";

// ─── Job model ──────────────────────────────────────────────────────────────

/// A queued unit of work: one inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Equal to `message.message_id`: the idempotence key.
    pub id: String,
    /// Times this job was recovered from a stalled reservation.
    #[serde(default)]
    pub stalls: u32,
    /// Epoch milliseconds at enqueue.
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub message: ParsedMessage,
    /// Exact stored representation, kept so Redis set-removals match.
    #[serde(skip)]
    pub raw: String,
}

impl Job {
    fn from_message(message: &ParsedMessage) -> Self {
        Job {
            id: message.message_id.clone(),
            stalls: 0,
            enqueued_at: Utc::now().timestamp_millis(),
            last_error: None,
            message: message.clone(),
            raw: String::new(),
        }
    }
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

// ─── Capability ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue; returns `false` when the message id was already seen
    /// (duplicate collapsed).
    async fn enqueue(&self, message: &ParsedMessage) -> CoreResult<bool>;

    /// Pop the next job and mark it reserved. `None` when the queue is empty.
    async fn reserve(&self) -> CoreResult<Option<Job>>;

    /// Acknowledge a finished job.
    async fn complete(&self, job: &Job) -> CoreResult<()>;

    /// Move a job to the DLQ after exhausted retries.
    async fn fail_to_dlq(&self, job: &Job, error: &str) -> CoreResult<()>;

    /// Admin operation: re-enqueue one DLQ entry onto the main queue.
    async fn retry_from_dlq(&self, job_id: &str) -> CoreResult<bool>;

    /// Re-queue reservations older than `lock`; jobs past `max_stalls` go to
    /// the DLQ instead. Returns how many reservations were recovered.
    async fn recover_stalled(&self, lock: Duration, max_stalls: u32) -> CoreResult<usize>;

    async fn stats(&self) -> CoreResult<QueueStats>;
}

// ─── Redis implementation ───────────────────────────────────────────────────

/// Redis-backed queue: waiting list + reservation zset scored by timestamp.
#[derive(Clone)]
pub struct RedisJobQueue {
    manager: redis::aio::ConnectionManager,
}

impl RedisJobQueue {
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(RedisJobQueue { manager })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, message: &ParsedMessage) -> CoreResult<bool> {
        let mut con = self.manager.clone();
        let added: i64 = con.sadd(IDS_KEY, &message.message_id).await?;
        if added == 0 {
            tracing::debug!(message_id = %message.message_id, "duplicate message collapsed");
            return Ok(false);
        }
        let job = Job::from_message(message);
        let raw = serde_json::to_string(&job)?;
        let _: () = con.lpush(WAITING_KEY, raw).await?;
        Ok(true)
    }

    async fn reserve(&self) -> CoreResult<Option<Job>> {
        let mut con = self.manager.clone();
        let raw: Option<String> = con.rpop(WAITING_KEY, None).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let now = Utc::now().timestamp_millis() as f64;
        let _: () = con.zadd(ACTIVE_KEY, &raw, now).await?;
        let mut job: Job = serde_json::from_str(&raw)?;
        job.raw = raw;
        Ok(Some(job))
    }

    async fn complete(&self, job: &Job) -> CoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.zrem(ACTIVE_KEY, &job.raw).await?;
        Ok(())
    }

    async fn fail_to_dlq(&self, job: &Job, error: &str) -> CoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.zrem(ACTIVE_KEY, &job.raw).await?;

        let mut dead = job.clone();
        dead.last_error = Some(error.to_string());
        let raw = serde_json::to_string(&dead)?;
        let _: () = con.lpush(DLQ_KEY, raw).await?;
        let _: i64 = con.incr(FAILED_KEY, 1).await?;
        Ok(())
    }

    async fn retry_from_dlq(&self, job_id: &str) -> CoreResult<bool> {
        let mut con = self.manager.clone();
        let entries: Vec<String> = con.lrange(DLQ_KEY, 0, -1).await?;
        for raw in entries {
            let Ok(mut job) = serde_json::from_str::<Job>(&raw) else {
                continue;
            };
            if job.id != job_id {
                continue;
            }
            let _: i64 = con.lrem(DLQ_KEY, 1, &raw).await?;
            job.stalls = 0;
            job.last_error = None;
            let fresh = serde_json::to_string(&job)?;
            let _: () = con.lpush(WAITING_KEY, fresh).await?;
            tracing::info!(job_id, "job re-enqueued from DLQ");
            return Ok(true);
        }
        Ok(false)
    }

    async fn recover_stalled(&self, lock: Duration, max_stalls: u32) -> CoreResult<usize> {
        let mut con = self.manager.clone();
        let cutoff = (Utc::now().timestamp_millis() - lock.as_millis() as i64) as f64;
        let stalled: Vec<String> = con.zrangebyscore(ACTIVE_KEY, "-inf", cutoff).await?;

        let mut recovered = 0usize;
        for raw in stalled {
            let _: () = con.zrem(ACTIVE_KEY, &raw).await?;
            let Ok(mut job) = serde_json::from_str::<Job>(&raw) else {
                continue;
            };
            job.stalls += 1;
            if job.stalls > max_stalls {
                tracing::warn!(job_id = %job.id, stalls = job.stalls, "stalled job written off to DLQ");
                job.last_error = Some("stalled too many times".to_string());
                let dead = serde_json::to_string(&job)?;
                let _: () = con.lpush(DLQ_KEY, dead).await?;
                let _: i64 = con.incr(FAILED_KEY, 1).await?;
            } else {
                tracing::info!(job_id = %job.id, stalls = job.stalls, "stalled job re-queued");
                let fresh = serde_json::to_string(&job)?;
                let _: () = con.lpush(WAITING_KEY, fresh).await?;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn stats(&self) -> CoreResult<QueueStats> {
        let mut con = self.manager.clone();
        let waiting: u64 = con.llen(WAITING_KEY).await?;
        let active: u64 = con.zcard(ACTIVE_KEY).await?;
        let failed: Option<u64> = con.get(FAILED_KEY).await?;
        let dead_lettered: u64 = con.llen(DLQ_KEY).await?;
        Ok(QueueStats {
            waiting,
            active,
            failed: failed.unwrap_or(0),
            dead_lettered,
        })
    }
}

// ─── In-memory implementation ───────────────────────────────────────────────

struct MemoryQueueInner {
    waiting: VecDeque<Job>,
    active: Vec<(Job, Instant)>,
    dlq: Vec<Job>,
    seen_ids: HashSet<String>,
    failed: u64,
}

/// In-memory queue for tests and single-process development.
pub struct MemoryJobQueue {
    inner: Mutex<MemoryQueueInner>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        MemoryJobQueue {
            inner: Mutex::new(MemoryQueueInner {
                waiting: VecDeque::new(),
                active: Vec::new(),
                dlq: Vec::new(),
                seen_ids: HashSet::new(),
                failed: 0,
            }),
        }
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, message: &ParsedMessage) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.seen_ids.insert(message.message_id.clone()) {
            return Ok(false);
        }
        inner.waiting.push_back(Job::from_message(message));
        Ok(true)
    }

    async fn reserve(&self) -> CoreResult<Option<Job>> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.waiting.pop_front() else {
            return Ok(None);
        };
        inner.active.push((job.clone(), Instant::now()));
        Ok(Some(job))
    }

    async fn complete(&self, job: &Job) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.active.retain(|(j, _)| j.id != job.id);
        Ok(())
    }

    async fn fail_to_dlq(&self, job: &Job, error: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.active.retain(|(j, _)| j.id != job.id);
        let mut dead = job.clone();
        dead.last_error = Some(error.to_string());
        inner.dlq.push(dead);
        inner.failed += 1;
        Ok(())
    }

    async fn retry_from_dlq(&self, job_id: &str) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(position) = inner.dlq.iter().position(|j| j.id == job_id) else {
            return Ok(false);
        };
        let mut job = inner.dlq.remove(position);
        job.stalls = 0;
        job.last_error = None;
        inner.waiting.push_back(job);
        Ok(true)
    }

    async fn recover_stalled(&self, lock: Duration, max_stalls: u32) -> CoreResult<usize> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let stalled: Vec<Job> = {
            let (stalled, kept): (Vec<_>, Vec<_>) = inner
                .active
                .drain(..)
                .partition(|(_, reserved)| now.duration_since(*reserved) >= lock);
            inner.active = kept;
            stalled.into_iter().map(|(job, _)| job).collect()
        };

        let recovered = stalled.len();
        for mut job in stalled {
            job.stalls += 1;
            if job.stalls > max_stalls {
                job.last_error = Some("stalled too many times".to_string());
                inner.dlq.push(job);
                inner.failed += 1;
            } else {
                inner.waiting.push_back(job);
            }
        }
        Ok(recovered)
    }

    async fn stats(&self) -> CoreResult<QueueStats> {
        let inner = self.inner.lock().await;
        Ok(QueueStats {
            waiting: inner.waiting.len() as u64,
            active: inner.active.len() as u64,
            failed: inner.failed,
            dead_lettered: inner.dlq.len() as u64,
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageContent;

    fn message(id: &str) -> ParsedMessage {
        ParsedMessage {
            message_id: id.to_string(),
            from: "+201001234567".to_string(),
            from_name: None,
            timestamp: "2026-01-05T10:00:00Z".to_string(),
            content: MessageContent::Text {
                body: "hello".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_duplicate_message_ids_collapse() {
        let queue = MemoryJobQueue::new();
        assert!(queue.enqueue(&message("wamid.1")).await.unwrap());
        assert!(!queue.enqueue(&message("wamid.1")).await.unwrap());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn test_reserve_complete_lifecycle() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&message("wamid.1")).await.unwrap();

        let job = queue.reserve().await.unwrap().unwrap();
        assert_eq!(job.id, "wamid.1");
        assert_eq!(queue.stats().await.unwrap().active, 1);

        queue.complete(&job).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&message("wamid.1")).await.unwrap();
        queue.enqueue(&message("wamid.2")).await.unwrap();

        assert_eq!(queue.reserve().await.unwrap().unwrap().id, "wamid.1");
        assert_eq!(queue.reserve().await.unwrap().unwrap().id, "wamid.2");
        assert!(queue.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dlq_and_retry() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&message("wamid.1")).await.unwrap();
        let job = queue.reserve().await.unwrap().unwrap();

        queue.fail_to_dlq(&job, "gateway down").await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.failed, 1);

        // DLQ entries persist until the admin retry.
        assert!(!queue.retry_from_dlq("missing").await.unwrap());
        assert!(queue.retry_from_dlq("wamid.1").await.unwrap());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(stats.waiting, 1);

        let retried = queue.reserve().await.unwrap().unwrap();
        assert_eq!(retried.id, "wamid.1");
        assert_eq!(retried.last_error, None);
    }

    #[tokio::test]
    async fn test_stalled_recovery_requeues_then_dead_letters() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&message("wamid.1")).await.unwrap();

        // Zero lock: every reservation counts as stalled immediately.
        for expected_stalls in 1..=2u32 {
            let _job = queue.reserve().await.unwrap().unwrap();
            let recovered = queue.recover_stalled(Duration::ZERO, 2).await.unwrap();
            assert_eq!(recovered, 1);
            let stats = queue.stats().await.unwrap();
            assert_eq!(stats.waiting, 1, "stall {expected_stalls} should re-queue");
        }

        // Third stall exceeds max_stalls = 2.
        let _job = queue.reserve().await.unwrap().unwrap();
        queue.recover_stalled(Duration::ZERO, 2).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_fresh_reservation_not_stalled() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&message("wamid.1")).await.unwrap();
        let _job = queue.reserve().await.unwrap().unwrap();

        let recovered = queue
            .recover_stalled(Duration::from_secs(120), 2)
            .await
            .unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(queue.stats().await.unwrap().active, 1);
    }
}
