use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant, MissedTickBehavior};

use crate::services::queue::{FailDisposition, JobQueue, QueueEntry};

/// Failure reported by a job handler.
///
/// The pool retries `Retryable` failures under the entry's backoff policy
/// until attempts run out; `Terminal` failures park the entry immediately.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Terminal(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Business logic invoked for each dequeued entry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &str;

    async fn handle(&self, entry: &QueueEntry) -> Result<(), JobError>;
}

/// Rolling-window rate limiter shared across the whole pool.
///
/// At most `max` admissions inside any `window`; excess callers sleep until
/// the oldest admission ages out.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    admissions: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut admissions = self.admissions.lock().await;
                let now = Instant::now();
                while let Some(front) = admissions.front() {
                    if now.duration_since(*front) >= self.window {
                        admissions.pop_front();
                    } else {
                        break;
                    }
                }

                if admissions.len() < self.max {
                    admissions.push_back(now);
                    return;
                }

                // Sleep until the oldest admission leaves the window.
                match admissions.front() {
                    Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max: usize,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Simultaneous handler invocations.
    pub concurrency: usize,
    /// Pool-wide admission limit, applied before each provider dispatch.
    pub rate_limit: Option<RateLimitConfig>,
    /// Processing lease per entry; extended by heartbeats while the handler
    /// runs.
    pub lease: Duration,
    /// Idle sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// How often expired leases are swept back into the waiting set.
    pub stall_sweep_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rate_limit: None,
            lease: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            stall_sweep_interval: Duration::from_secs(30),
        }
    }
}

/// A pool of concurrent executors pulling from one queue.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    options: WorkerOptions,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, options: WorkerOptions) -> Self {
        Self { queue, options }
    }

    /// Run executors and the stall sweeper until `shutdown` resolves.
    pub async fn run(
        &self,
        handler: Arc<dyn JobHandler>,
        shutdown: impl std::future::Future<Output = ()>,
    ) {
        let limiter = self
            .options
            .rate_limit
            .map(|rl| Arc::new(RateLimiter::new(rl.max, rl.window)));

        let mut tasks = Vec::new();

        for worker_id in 0..self.options.concurrency.max(1) {
            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&handler);
            let limiter = limiter.clone();
            let options = self.options.clone();
            tasks.push(tokio::spawn(async move {
                executor_loop(worker_id, queue, handler, limiter, options).await;
            }));
        }

        {
            let queue = Arc::clone(&self.queue);
            let interval = self.options.stall_sweep_interval;
            tasks.push(tokio::spawn(async move {
                stall_sweep_loop(queue, interval).await;
            }));
        }

        shutdown.await;
        tracing::info!("worker pool shutting down");
        for task in &tasks {
            task.abort();
        }
    }
}

async fn executor_loop(
    worker_id: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    limiter: Option<Arc<RateLimiter>>,
    options: WorkerOptions,
) {
    loop {
        match queue.dequeue(options.lease).await {
            Ok(Some(entry)) => {
                process_entry(
                    worker_id,
                    &queue,
                    handler.as_ref(),
                    limiter.as_deref(),
                    &entry,
                    &options,
                )
                .await;
            }
            Ok(None) => sleep(options.poll_interval).await,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "dequeue failed, backing off");
                sleep(options.poll_interval).await;
            }
        }
    }
}

async fn process_entry(
    worker_id: usize,
    queue: &JobQueue,
    handler: &dyn JobHandler,
    limiter: Option<&RateLimiter>,
    entry: &QueueEntry,
    options: &WorkerOptions,
) {
    tracing::info!(
        worker_id,
        entry_id = %entry.id,
        job_id = %entry.payload.job_id,
        attempt = entry.attempts,
        "job started"
    );
    metrics::counter!("composegen_jobs_started").increment(1);
    let started = std::time::Instant::now();

    // Keep the lease alive for as long as the handler (and any admission
    // wait) runs; a silent worker is indistinguishable from a dead one.
    let outcome = {
        let work = async {
            if let Some(limiter) = limiter {
                limiter.acquire().await;
            }
            handler.handle(entry).await
        };
        tokio::pin!(work);

        let mut heartbeat = tokio::time::interval(options.lease / 3);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut work => break result,
                _ = heartbeat.tick() => {
                    if let Err(e) = queue.heartbeat(entry.id, options.lease).await {
                        tracing::warn!(entry_id = %entry.id, error = %e, "lease heartbeat failed");
                    }
                }
            }
        }
    };

    let elapsed = started.elapsed();

    match outcome {
        Ok(()) => {
            if let Err(e) = queue.complete(entry).await {
                tracing::error!(entry_id = %entry.id, error = %e, "failed to mark entry completed");
                return;
            }
            metrics::counter!("composegen_jobs_completed").increment(1);
            metrics::histogram!("composegen_job_processing_seconds").record(elapsed.as_secs_f64());
            tracing::info!(
                worker_id,
                entry_id = %entry.id,
                job_id = %entry.payload.job_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "job completed"
            );
        }
        Err(err) => {
            let retryable = err.is_retryable();
            match queue.fail(entry, retryable).await {
                Ok(FailDisposition::Rescheduled) => {
                    tracing::warn!(
                        worker_id,
                        entry_id = %entry.id,
                        job_id = %entry.payload.job_id,
                        attempt = entry.attempts,
                        max_attempts = entry.max_attempts,
                        error = %err,
                        "job failed, rescheduled with backoff"
                    );
                }
                Ok(FailDisposition::Exhausted) => {
                    metrics::counter!("composegen_jobs_failed").increment(1);
                    tracing::error!(
                        worker_id,
                        entry_id = %entry.id,
                        job_id = %entry.payload.job_id,
                        attempt = entry.attempts,
                        error = %err,
                        "job failed permanently"
                    );
                }
                Err(e) => {
                    tracing::error!(entry_id = %entry.id, error = %e, "failed to record job failure");
                }
            }
        }
    }
}

async fn stall_sweep_loop(queue: Arc<JobQueue>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match queue.requeue_stalled().await {
            Ok(stalled) => {
                for entry_id in stalled {
                    metrics::counter!("composegen_jobs_stalled").increment(1);
                    tracing::warn!(entry_id = %entry_id, "entry exceeded its lease, requeued");
                }
            }
            Err(e) => tracing::error!(error = %e, "stall sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_variant() {
        assert!(JobError::Retryable("timeout".into()).is_retryable());
        assert!(!JobError::Terminal("safety rejection".into()).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_admits_up_to_max_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_defers_excess_past_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_is_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_secs(30)));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        futures::future::join_all(handles).await;

        // 4 admissions at 2 per 30s: the last pair lands a window later.
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
