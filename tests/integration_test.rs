use compose_gen::{
    config::AppConfig,
    db::{self, artifact_queries, queries},
    models::job::{backoff_delay, JobStatus},
    services::queue::{BackoffPolicy, EnqueueOptions, JobQueue, QueuePayload},
    services::storage::make_storage_key,
};
use std::time::Duration;
use uuid::Uuid;

fn test_queue(config: &AppConfig) -> JobQueue {
    // A per-run job type keeps queue keys isolated between test runs.
    let job_type = format!("itest.{}", Uuid::new_v4());
    JobQueue::new(&config.redis_url, &job_type).expect("Failed to initialize queue")
}

/// Integration test: job lifecycle through the store and queue.
///
/// Covers:
/// 1. Job creation and retrieval
/// 2. Queue enqueue/dequeue with lease bookkeeping
/// 3. Guarded status transitions (processing → succeeded)
/// 4. Terminal idempotency (duplicate completions are no-ops)
///
/// Note: requires running PostgreSQL and Redis instances configured via
/// environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_job_lifecycle() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let queue = test_queue(&config);

    // 1. Create a job
    let job = queries::create_job(
        &db_pool,
        queries::NewJob {
            user_id: "test-user",
            prompt: "blend the two rooms into one interior",
            primary_image_key: "inputs/test-user/room_a.png",
            secondary_image_key: Some("inputs/test-user/room_b.png"),
            options: serde_json::json!({"strength": 0.6}),
            priority: 5,
            max_attempts: 3,
        },
    )
    .await
    .expect("Failed to create job");

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 0);
    assert!(job.retry_at.is_none());

    // 2. Enqueue and dequeue through the transport
    let entry = queue
        .enqueue(
            "itest",
            QueuePayload {
                job_id: job.id,
                user_id: "test-user".into(),
            },
            EnqueueOptions::default(),
        )
        .await
        .expect("Failed to enqueue");

    let delivered = queue
        .dequeue(Duration::from_secs(60))
        .await
        .expect("Failed to dequeue")
        .expect("No entry delivered");

    assert_eq!(delivered.id, entry.id);
    assert_eq!(delivered.payload.job_id, job.id);
    assert_eq!(delivered.attempts, 1);

    // 3. Transition to processing, then succeed with an artifact
    let processing = queries::mark_processing(&db_pool, job.id)
        .await
        .expect("Failed to mark processing")
        .expect("Guard rejected first delivery");

    assert_eq!(processing.status, JobStatus::Processing);
    assert_eq!(processing.attempts, 1);
    assert!(processing.queue_time_ms.is_some());

    let content = b"fake image bytes";
    let artifact = artifact_queries::create_artifact(
        &db_pool,
        artifact_queries::NewArtifact {
            job_id: job.id,
            parent_id: None,
            storage_key: &make_storage_key("outputs", "composition.png", "test-user"),
            mime_type: "image/png",
            size_bytes: content.len() as i64,
            width: Some(640),
            height: Some(480),
        },
    )
    .await
    .expect("Failed to create artifact");

    let won = queries::mark_succeeded(&db_pool, job.id, artifact.id, 1234)
        .await
        .expect("Failed to mark succeeded");
    assert!(won);

    queue.complete(&delivered).await.expect("Failed to complete entry");

    let done = queries::find_job(&db_pool, job.id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");

    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.output_image_id, Some(artifact.id));
    assert_eq!(done.processing_time_ms, Some(1234));
    assert!(done.completed_at.is_some());
    assert!(done.error.is_none());

    let stored = artifact_queries::find_artifact(&db_pool, artifact.id)
        .await
        .expect("Failed to get artifact")
        .expect("Artifact not found");
    assert_eq!(stored.size_bytes, content.len() as i64);

    // 4. Duplicate completions are no-ops
    let completed_at = done.completed_at;
    let dup_success = queries::mark_succeeded(&db_pool, job.id, Uuid::new_v4(), 1)
        .await
        .expect("Duplicate success errored");
    assert!(!dup_success);

    let dup_failure = queries::mark_failed(&db_pool, job.id, "late failure", None, true, 30.0)
        .await
        .expect("Duplicate failure errored");
    assert!(dup_failure.is_none());

    let after = queries::find_job(&db_pool, job.id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(after.status, JobStatus::Succeeded);
    assert_eq!(after.output_image_id, Some(artifact.id));
    assert_eq!(after.completed_at, completed_at);
    assert!(after.error.is_none());
}

/// Integration test: retry bookkeeping and the attempt budget.
#[tokio::test]
#[ignore]
async fn test_retry_budget_and_backoff() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let job = queries::create_job(
        &db_pool,
        queries::NewJob {
            user_id: "test-user",
            prompt: "retry me",
            primary_image_key: "inputs/test-user/a.png",
            secondary_image_key: None,
            options: serde_json::json!({}),
            priority: 5,
            max_attempts: 2,
        },
    )
    .await
    .expect("Failed to create job");

    // Attempt 1 fails with attempts remaining: retry_at must be set.
    queries::mark_processing(&db_pool, job.id)
        .await
        .unwrap()
        .expect("first delivery rejected");
    let failed = queries::mark_failed(&db_pool, job.id, "provider timeout", None, true, 30.0)
        .await
        .unwrap()
        .expect("failure rejected");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
    let retry_at = failed.retry_at.expect("retry_at should be set");
    let delta_ms = (retry_at - failed.completed_at.unwrap()).num_milliseconds();
    // base 30s at attempts=1 → ~60s
    assert!((55_000..=65_000).contains(&delta_ms), "got {delta_ms}ms");

    // Attempt 2 (the retry edge failed → processing) exhausts the budget.
    let retried = queries::mark_processing(&db_pool, job.id)
        .await
        .unwrap()
        .expect("retry delivery rejected");
    assert_eq!(retried.status, JobStatus::Processing);
    assert_eq!(retried.attempts, 2);
    assert!(retried.retry_at.is_none());

    let exhausted = queries::mark_failed(&db_pool, job.id, "provider timeout", None, true, 30.0)
        .await
        .unwrap()
        .expect("failure rejected");
    assert_eq!(exhausted.attempts, 2);
    assert!(exhausted.retry_at.is_none(), "budget spent, no retry_at");
    assert_eq!(exhausted.error.as_deref(), Some("provider timeout"));

    // The guard refuses a delivery past the budget.
    let over = queries::mark_processing(&db_pool, job.id).await.unwrap();
    assert!(over.is_none());
}

/// Integration test: the webhook/stall race has exactly one winner.
#[tokio::test]
#[ignore]
async fn test_completion_race_single_winner() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let job = queries::create_job(
        &db_pool,
        queries::NewJob {
            user_id: "test-user",
            prompt: "race me",
            primary_image_key: "inputs/test-user/a.png",
            secondary_image_key: None,
            options: serde_json::json!({}),
            priority: 5,
            max_attempts: 1,
        },
    )
    .await
    .expect("Failed to create job");

    queries::mark_processing(&db_pool, job.id)
        .await
        .unwrap()
        .expect("delivery rejected");
    let task_id = format!("task-{}", Uuid::new_v4());
    assert!(queries::set_provider_task(&db_pool, job.id, &task_id)
        .await
        .unwrap());

    let artifact = artifact_queries::create_artifact(
        &db_pool,
        artifact_queries::NewArtifact {
            job_id: job.id,
            parent_id: None,
            storage_key: "outputs/test-user/race.png",
            mime_type: "image/png",
            size_bytes: 10,
            width: None,
            height: None,
        },
    )
    .await
    .expect("Failed to create artifact");

    // Provider success callback and local stall failure land together.
    let (success, failure) = tokio::join!(
        queries::mark_succeeded(&db_pool, job.id, artifact.id, 5000),
        queries::mark_failed(&db_pool, job.id, "stall timeout", None, true, 30.0),
    );
    let success_won = success.expect("success path errored");
    let failure_won = failure.expect("failure path errored").is_some();
    assert!(success_won ^ failure_won, "exactly one side must win");

    let settled = queries::find_job(&db_pool, job.id)
        .await
        .unwrap()
        .expect("Job not found");
    if success_won {
        assert_eq!(settled.status, JobStatus::Succeeded);
        assert_eq!(settled.output_image_id, Some(artifact.id));
        assert!(settled.error.is_none());
    } else {
        assert_eq!(settled.status, JobStatus::Failed);
        assert!(settled.output_image_id.is_none());
        assert!(settled.error.is_some());
    }
}

/// Integration test: queue scheduling (priority, delay, pause, stall).
#[tokio::test]
#[ignore]
async fn test_queue_scheduling() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let queue = test_queue(&config);

    let payload = |user: &str| QueuePayload {
        job_id: Uuid::new_v4(),
        user_id: user.into(),
    };

    // Low priority first in, high priority should still come out first.
    let low = queue
        .enqueue(
            "itest",
            payload("low"),
            EnqueueOptions {
                priority: 2,
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();
    let high = queue
        .enqueue(
            "itest",
            payload("high"),
            EnqueueOptions {
                priority: 9,
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    let first = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(first.id, high.id, "higher priority delivered first");
    let second = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(second.id, low.id);

    // Delayed entries are invisible until due.
    let delayed = queue
        .enqueue(
            "itest",
            payload("later"),
            EnqueueOptions {
                delay: Some(Duration::from_secs(60)),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_none());
    let snapshot = queue.retrieve(delayed.id).await.unwrap().unwrap();
    assert_eq!(snapshot.payload.user_id, "later");

    let m = queue.metrics().await.unwrap();
    assert_eq!(m.delayed, 1);
    assert_eq!(m.active, 2);

    // Paused queues deliver nothing but lose nothing.
    queue.pause().await.unwrap();
    queue
        .enqueue("itest", payload("held"), EnqueueOptions::default())
        .await
        .unwrap();
    assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_none());
    let m = queue.metrics().await.unwrap();
    assert_eq!(m.paused, 1);
    assert_eq!(m.waiting, 0);
    queue.resume().await.unwrap();
    assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_some());

    // An expired lease is swept back to waiting.
    let stale = queue
        .enqueue("itest", payload("stall"), EnqueueOptions::default())
        .await
        .unwrap();
    let delivered = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
    assert_eq!(delivered.id, stale.id);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stalled = queue.requeue_stalled().await.unwrap();
    assert!(stalled.contains(&stale.id));
    let redelivered = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(redelivered.id, stale.id);
    assert_eq!(redelivered.attempts, 2, "redelivery counts as a new attempt");
}

/// Backoff law: base 30s doubles per consecutive attempt.
#[test]
fn test_backoff_law() {
    let base = Duration::from_millis(30_000);
    assert_eq!(backoff_delay(base, 1), Duration::from_millis(60_000));
    assert_eq!(backoff_delay(base, 2), Duration::from_millis(120_000));
    assert_eq!(backoff_delay(base, 3), Duration::from_millis(240_000));

    let policy = BackoffPolicy::exponential(30_000);
    assert_eq!(policy.delay_after(2), Duration::from_millis(120_000));
}

/// Storage keys are collision-resistant for identical inputs.
#[test]
fn test_storage_key_uniqueness() {
    let a = make_storage_key("outputs", "composition.png", "user-1");
    let b = make_storage_key("outputs", "composition.png", "user-1");
    assert_ne!(a, b);
}
