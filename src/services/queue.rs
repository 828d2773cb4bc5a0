use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::backoff_delay;

/// Completed entries kept for inspection before pruning.
const COMPLETED_RETENTION: usize = 1_000;
/// Failed entries are retained under a longer audit window.
const FAILED_RETENTION: usize = 5_000;
/// How many due delayed entries are promoted per dequeue pass.
const PROMOTE_BATCH: isize = 100;

/// Priorities are 1-10; each priority gets its own score band so a higher
/// priority always sorts ahead of a lower one, FIFO within the band.
const PRIORITY_BAND: f64 = 1e13;

/// Outcome bucket of a queue entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Delay-growth policy between retry attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn exponential(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms,
        }
    }

    pub fn fixed(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms,
        }
    }

    /// Delay before the next run after `attempts` failed deliveries.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        match self.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => backoff_delay(base, attempts),
        }
    }
}

/// Minimal context a worker needs to process a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePayload {
    pub job_id: Uuid,
    pub user_id: String,
}

/// The queue's envelope around a job invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub job_type: String,
    pub payload: QueuePayload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub priority: u8,
    pub state: EntryState,
    pub enqueued_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
}

/// Options recognized at enqueue time.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub priority: u8,
    pub delay: Option<Duration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::exponential(30_000),
            priority: 5,
            delay: None,
        }
    }
}

/// What happened to an entry reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Rescheduled into the delayed set for another attempt.
    Rescheduled,
    /// Attempt budget exhausted or failure non-retryable; parked in the
    /// failed bucket.
    Exhausted,
}

/// Counts per outcome bucket.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueMetrics {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}

/// Redis-backed job queue with priority ordering, delayed scheduling, and
/// lease-based delivery.
///
/// The queue is transport only: the job row in Postgres is authoritative for
/// whether a job actually finished. Entries move between buckets
/// (waiting/delayed zsets, an active zset scored by lease deadline, and
/// capped completed/failed retention lists) with the serialized envelope
/// held in a hash.
pub struct JobQueue {
    client: redis::Client,
    prefix: String,
}

impl JobQueue {
    pub fn new(redis_url: &str, job_type: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::from_redis)?;
        Ok(Self {
            client,
            prefix: format!("composegen:{job_type}"),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::from_redis)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    async fn save_entry(
        &self,
        conn: &mut MultiplexedConnection,
        entry: &QueueEntry,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(entry).map_err(QueueError::Serialize)?;
        conn.hset::<_, _, _, ()>(self.key("entries"), entry.id.to_string(), payload)
            .await
            .map_err(QueueError::from_redis)?;
        Ok(())
    }

    async fn load_entry(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let raw: Option<String> = conn
            .hget(self.key("entries"), id)
            .await
            .map_err(QueueError::from_redis)?;
        match raw {
            Some(json) => {
                let entry = serde_json::from_str(&json).map_err(QueueError::Serialize)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Accept a job for eventual execution. Never runs the payload inline;
    /// returns as soon as the envelope is durably queued.
    ///
    /// Transport failures surface as [`QueueError::Unavailable`]; callers
    /// must treat that as a retryable infrastructure error, not a job-logic
    /// error.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: QueuePayload,
        options: EnqueueOptions,
    ) -> Result<QueueEntry, QueueError> {
        let now = Utc::now();
        let delay = options.delay.unwrap_or(Duration::ZERO);
        let run_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let delayed = delay > Duration::ZERO;

        let entry = QueueEntry {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            attempts: 0,
            max_attempts: options.max_attempts,
            backoff: options.backoff,
            priority: options.priority.clamp(1, 10),
            state: if delayed {
                EntryState::Delayed
            } else {
                EntryState::Waiting
            },
            enqueued_at: now,
            run_at,
        };

        let mut conn = self.conn().await?;
        self.save_entry(&mut conn, &entry).await?;

        if delayed {
            conn.zadd::<_, _, _, ()>(
                self.key("delayed"),
                entry.id.to_string(),
                run_at.timestamp_millis() as f64,
            )
            .await
            .map_err(QueueError::from_redis)?;
        } else {
            conn.zadd::<_, _, _, ()>(
                self.key("waiting"),
                entry.id.to_string(),
                waiting_score(entry.priority, now.timestamp_millis()),
            )
            .await
            .map_err(QueueError::from_redis)?;
        }

        Ok(entry)
    }

    /// Move due delayed entries into the waiting set.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.key("delayed"), "-inf", now_ms as f64, 0, PROMOTE_BATCH)
            .await
            .map_err(QueueError::from_redis)?;

        for id in due {
            let removed: u64 = conn
                .zrem(self.key("delayed"), &id)
                .await
                .map_err(QueueError::from_redis)?;
            // Another worker promoted it first.
            if removed == 0 {
                continue;
            }
            if let Some(mut entry) = self.load_entry(conn, &id).await? {
                entry.state = EntryState::Waiting;
                self.save_entry(conn, &entry).await?;
                conn.zadd::<_, _, _, ()>(
                    self.key("waiting"),
                    &id,
                    waiting_score(entry.priority, now_ms),
                )
                .await
                .map_err(QueueError::from_redis)?;
            }
        }
        Ok(())
    }

    /// Pull the next deliverable entry, moving it into the active set under
    /// a lease. Returns None when the queue is paused or empty.
    ///
    /// The lease guarantees at-most-one concurrent execution per entry;
    /// [`JobQueue::requeue_stalled`] restores delivery if the holder dies.
    pub async fn dequeue(&self, lease: Duration) -> Result<Option<QueueEntry>, QueueError> {
        let mut conn = self.conn().await?;

        let paused: bool = conn
            .exists(self.key("paused"))
            .await
            .map_err(QueueError::from_redis)?;
        if paused {
            return Ok(None);
        }

        self.promote_due(&mut conn).await?;

        let popped: Vec<(String, f64)> = conn
            .zpopmin(self.key("waiting"), 1)
            .await
            .map_err(QueueError::from_redis)?;
        let Some((id, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let Some(mut entry) = self.load_entry(&mut conn, &id).await? else {
            tracing::warn!(entry_id = %id, "queue entry vanished between pop and load");
            return Ok(None);
        };

        entry.attempts += 1;
        entry.state = EntryState::Active;
        self.save_entry(&mut conn, &entry).await?;

        let deadline = Utc::now().timestamp_millis() + lease.as_millis() as i64;
        conn.zadd::<_, _, _, ()>(self.key("active"), &id, deadline as f64)
            .await
            .map_err(QueueError::from_redis)?;

        Ok(Some(entry))
    }

    /// Extend the lease of an active entry while its handler is running.
    pub async fn heartbeat(&self, entry_id: Uuid, lease: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let deadline = Utc::now().timestamp_millis() + lease.as_millis() as i64;
        // XX: only refresh entries that are still active.
        redis::cmd("ZADD")
            .arg(self.key("active"))
            .arg("XX")
            .arg(deadline as f64)
            .arg(entry_id.to_string())
            .query_async::<i64>(&mut conn)
            .await
            .map_err(QueueError::from_redis)?;
        Ok(())
    }

    /// Mark an entry completed and prune the retention window.
    pub async fn complete(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let id = entry.id.to_string();

        conn.zrem::<_, _, u64>(self.key("active"), &id)
            .await
            .map_err(QueueError::from_redis)?;

        let mut done = entry.clone();
        done.state = EntryState::Completed;
        self.save_entry(&mut conn, &done).await?;

        conn.lpush::<_, _, ()>(self.key("completed"), &id)
            .await
            .map_err(QueueError::from_redis)?;
        self.prune(&mut conn, "completed", COMPLETED_RETENTION).await?;

        Ok(())
    }

    /// Report a failed delivery. Reschedules per the entry's backoff policy
    /// unless attempts are exhausted or the failure is non-retryable.
    pub async fn fail(
        &self,
        entry: &QueueEntry,
        retryable: bool,
    ) -> Result<FailDisposition, QueueError> {
        let mut conn = self.conn().await?;
        let id = entry.id.to_string();

        conn.zrem::<_, _, u64>(self.key("active"), &id)
            .await
            .map_err(QueueError::from_redis)?;

        let mut failed = entry.clone();

        if retryable && failed.attempts < failed.max_attempts {
            let delay = failed.backoff.delay_after(failed.attempts);
            failed.run_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(0));
            failed.state = EntryState::Delayed;
            self.save_entry(&mut conn, &failed).await?;
            conn.zadd::<_, _, _, ()>(
                self.key("delayed"),
                &id,
                failed.run_at.timestamp_millis() as f64,
            )
            .await
            .map_err(QueueError::from_redis)?;
            Ok(FailDisposition::Rescheduled)
        } else {
            failed.state = EntryState::Failed;
            self.save_entry(&mut conn, &failed).await?;
            conn.lpush::<_, _, ()>(self.key("failed"), &id)
                .await
                .map_err(QueueError::from_redis)?;
            self.prune(&mut conn, "failed", FAILED_RETENTION).await?;
            Ok(FailDisposition::Exhausted)
        }
    }

    /// Return entries whose lease expired to the waiting set.
    ///
    /// A stalled entry means its worker crashed or lost connectivity
    /// mid-processing; redelivery is what makes the queue at-least-once.
    pub async fn requeue_stalled(&self) -> Result<Vec<Uuid>, QueueError> {
        let mut conn = self.conn().await?;
        let now_ms = Utc::now().timestamp_millis();

        let expired: Vec<String> = conn
            .zrangebyscore_limit(self.key("active"), "-inf", now_ms as f64, 0, PROMOTE_BATCH)
            .await
            .map_err(QueueError::from_redis)?;

        let mut stalled = Vec::new();
        for id in expired {
            let removed: u64 = conn
                .zrem(self.key("active"), &id)
                .await
                .map_err(QueueError::from_redis)?;
            // Lost the race with a heartbeat or completion.
            if removed == 0 {
                continue;
            }
            if let Some(mut entry) = self.load_entry(&mut conn, &id).await? {
                entry.state = EntryState::Waiting;
                self.save_entry(&mut conn, &entry).await?;
                conn.zadd::<_, _, _, ()>(
                    self.key("waiting"),
                    &id,
                    waiting_score(entry.priority, now_ms),
                )
                .await
                .map_err(QueueError::from_redis)?;
                stalled.push(entry.id);
            }
        }
        Ok(stalled)
    }

    /// Current envelope state of an entry, or None if pruned/unknown.
    pub async fn retrieve(&self, entry_id: Uuid) -> Result<Option<QueueEntry>, QueueError> {
        let mut conn = self.conn().await?;
        self.load_entry(&mut conn, &entry_id.to_string()).await
    }

    /// Counts per outcome bucket. While paused, deliverable entries are
    /// reported under `paused` rather than `waiting`.
    pub async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        let mut conn = self.conn().await?;

        let waiting: u64 = conn
            .zcard(self.key("waiting"))
            .await
            .map_err(QueueError::from_redis)?;
        let delayed: u64 = conn
            .zcard(self.key("delayed"))
            .await
            .map_err(QueueError::from_redis)?;
        let active: u64 = conn
            .zcard(self.key("active"))
            .await
            .map_err(QueueError::from_redis)?;
        let completed: u64 = conn
            .llen(self.key("completed"))
            .await
            .map_err(QueueError::from_redis)?;
        let failed: u64 = conn
            .llen(self.key("failed"))
            .await
            .map_err(QueueError::from_redis)?;
        let paused: bool = conn
            .exists(self.key("paused"))
            .await
            .map_err(QueueError::from_redis)?;

        Ok(QueueMetrics {
            waiting: if paused { 0 } else { waiting },
            active,
            completed,
            failed,
            delayed,
            paused: if paused { waiting } else { 0 },
        })
    }

    /// Stop delivering entries. Queued work is retained.
    pub async fn pause(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(self.key("paused"), "1")
            .await
            .map_err(QueueError::from_redis)?;
        Ok(())
    }

    /// Resume delivery after a pause.
    pub async fn resume(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.key("paused"))
            .await
            .map_err(QueueError::from_redis)?;
        Ok(())
    }

    /// Block until the waiting and delayed buckets are empty. Entries are
    /// never discarded; this is a shutdown aid, not a purge.
    pub async fn drain(&self) -> Result<(), QueueError> {
        loop {
            let m = self.metrics().await?;
            if m.waiting + m.delayed + m.paused == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Acquire a short-lived completion lock (SET NX PX). Out-of-band
    /// finalizers (webhook handler, stuck-job sweep) serialize per job id
    /// through this before touching the job row.
    pub async fn try_lock(&self, name: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.key(&format!("lock:{name}")))
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from_redis)?;
        Ok(acquired.is_some())
    }

    pub async fn unlock(&self, name: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.key(&format!("lock:{name}")))
            .await
            .map_err(QueueError::from_redis)?;
        Ok(())
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::from_redis)?;
        Ok(())
    }

    async fn prune(
        &self,
        conn: &mut MultiplexedConnection,
        bucket: &str,
        cap: usize,
    ) -> Result<(), QueueError> {
        let len: u64 = conn
            .llen(self.key(bucket))
            .await
            .map_err(QueueError::from_redis)?;
        let excess = (len as usize).saturating_sub(cap);
        if excess == 0 {
            return Ok(());
        }

        let Some(count) = NonZeroUsize::new(excess) else {
            return Ok(());
        };
        let evicted: Vec<String> = conn
            .rpop(self.key(bucket), Some(count))
            .await
            .map_err(QueueError::from_redis)?;
        for id in evicted {
            conn.hdel::<_, _, ()>(self.key("entries"), id)
                .await
                .map_err(QueueError::from_redis)?;
        }
        Ok(())
    }
}

/// Score for the waiting zset: higher priority sorts into an earlier band,
/// FIFO by timestamp within a band.
fn waiting_score(priority: u8, enqueued_at_ms: i64) -> f64 {
    let band = 10u8.saturating_sub(priority.clamp(1, 10)) as f64;
    band * PRIORITY_BAND + enqueued_at_ms as f64
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue transport is unreachable. Callers must fail fast and treat
    /// this as a retryable infrastructure error, never degrade to a no-op.
    #[error("queue transport unavailable: {0}")]
    Unavailable(redis::RedisError),

    #[error("Redis error: {0}")]
    Redis(redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl QueueError {
    fn from_redis(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
            Self::Unavailable(e)
        } else {
            Self::Redis(e)
        }
    }

    /// True when the error indicates the transport itself is down.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_sorts_first() {
        let now = 1_700_000_000_000;
        let high = waiting_score(10, now);
        let low = waiting_score(1, now);
        assert!(high < low);
    }

    #[test]
    fn fifo_within_same_priority() {
        let earlier = waiting_score(5, 1_700_000_000_000);
        let later = waiting_score(5, 1_700_000_000_500);
        assert!(earlier < later);
    }

    #[test]
    fn priority_beats_arrival_order() {
        // A later high-priority entry must still sort before an earlier
        // low-priority one.
        let late_high = waiting_score(9, 1_700_000_600_000);
        let early_low = waiting_score(3, 1_700_000_000_000);
        assert!(late_high < early_low);
    }

    #[test]
    fn out_of_range_priorities_clamp() {
        assert_eq!(waiting_score(0, 1000), waiting_score(1, 1000));
        assert_eq!(waiting_score(12, 1000), waiting_score(10, 1000));
    }

    #[test]
    fn exponential_backoff_grows_per_attempt() {
        let policy = BackoffPolicy::exponential(30_000);
        assert_eq!(policy.delay_after(1), Duration::from_millis(60_000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(120_000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(240_000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::fixed(5_000);
        assert_eq!(policy.delay_after(1), Duration::from_millis(5_000));
        assert_eq!(policy.delay_after(4), Duration::from_millis(5_000));
    }
}
