use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::generation::UserStatsResponse;
use crate::models::job::{Job, JobStatus};

const JOB_COLUMNS: &str = "id, user_id, status, prompt, primary_image_key, secondary_image_key, \
     options, priority, attempts, max_attempts, retry_at, provider_task_id, output_image_id, \
     error, error_detail, queue_time_ms, processing_time_ms, created_at, updated_at, \
     started_at, completed_at";

fn map_job(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<JobStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    let options_value: serde_json::Value = row.try_get("options")?;
    let options = serde_json::from_value(options_value).unwrap_or_default();

    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        status,
        prompt: row.try_get("prompt")?,
        primary_image_key: row.try_get("primary_image_key")?,
        secondary_image_key: row.try_get("secondary_image_key")?,
        options,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        retry_at: row.try_get("retry_at")?,
        provider_task_id: row.try_get("provider_task_id")?,
        output_image_id: row.try_get("output_image_id")?,
        error: row.try_get("error")?,
        error_detail: row.try_get("error_detail")?,
        queue_time_ms: row.try_get("queue_time_ms")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// Fields required to insert a new job.
#[derive(Debug)]
pub struct NewJob<'a> {
    pub user_id: &'a str,
    pub prompt: &'a str,
    pub primary_image_key: &'a str,
    pub secondary_image_key: Option<&'a str>,
    pub options: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
}

/// Insert a new job in `queued` state.
pub async fn create_job(pool: &PgPool, new: NewJob<'_>) -> Result<Job, sqlx::Error> {
    let sql = format!(
        "INSERT INTO jobs (user_id, prompt, primary_image_key, secondary_image_key, options, \
         priority, max_attempts) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING {JOB_COLUMNS}"
    );

    let row = sqlx::query(&sql)
        .bind(new.user_id)
        .bind(new.prompt)
        .bind(new.primary_image_key)
        .bind(new.secondary_image_key)
        .bind(new.options)
        .bind(new.priority)
        .bind(new.max_attempts)
        .fetch_one(pool)
        .await?;

    map_job(&row)
}

/// Get a job by ID
pub async fn find_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;
    row.as_ref().map(map_job).transpose()
}

/// Look a job up by the provider's task handle.
///
/// Webhook callbacks only know the provider-side id, not ours.
pub async fn find_job_by_provider_task(
    pool: &PgPool,
    provider_task_id: &str,
) -> Result<Option<Job>, sqlx::Error> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE provider_task_id = $1");
    let row = sqlx::query(&sql)
        .bind(provider_task_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_job).transpose()
}

/// Transition a job into `processing` for a new delivery attempt.
///
/// Guarded: only from queued/failed (retry) or processing (stall
/// redelivery), and only while the attempt budget lasts. Returns None when
/// the guard rejects the transition; the caller must treat that as "do not
/// run this job". A stale provider task handle from a failed asynchronous
/// attempt is cleared so late callbacks for it land as orphans.
pub async fn mark_processing(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let sql = format!(
        "UPDATE jobs \
         SET status = 'processing', \
             attempts = attempts + 1, \
             started_at = NOW(), \
             updated_at = NOW(), \
             completed_at = NULL, \
             retry_at = NULL, \
             provider_task_id = NULL, \
             queue_time_ms = COALESCE(queue_time_ms, \
                 (EXTRACT(EPOCH FROM (NOW() - created_at)) * 1000)::BIGINT) \
         WHERE id = $1 \
           AND status IN ('queued', 'processing', 'failed') \
           AND attempts < max_attempts \
         RETURNING {JOB_COLUMNS}"
    );

    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;
    row.as_ref().map(map_job).transpose()
}

/// Finalize a job as succeeded.
///
/// Only a `processing` job can succeed; a duplicate or late completion
/// touches zero rows and returns false. This guard is what decides the race
/// between a webhook success and a concurrent local stall failure.
pub async fn mark_succeeded(
    pool: &PgPool,
    job_id: Uuid,
    output_image_id: Uuid,
    processing_time_ms: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'succeeded',
            completed_at = NOW(),
            updated_at = NOW(),
            output_image_id = $2,
            processing_time_ms = $3,
            error = NULL,
            error_detail = NULL,
            retry_at = NULL
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(job_id)
    .bind(output_image_id)
    .bind(processing_time_ms)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Finalize a job as failed.
///
/// `retry_at` is computed in the same statement: `now + base * 2^attempts`
/// when the error is retryable and attempts remain, NULL (terminal)
/// otherwise. Terminal rows are untouched (duplicate no-op).
pub async fn mark_failed(
    pool: &PgPool,
    job_id: Uuid,
    message: &str,
    detail: Option<serde_json::Value>,
    retryable: bool,
    base_delay_secs: f64,
) -> Result<Option<Job>, sqlx::Error> {
    let sql = format!(
        "UPDATE jobs \
         SET status = 'failed', \
             completed_at = NOW(), \
             updated_at = NOW(), \
             error = $2, \
             error_detail = $3, \
             retry_at = CASE \
                 WHEN $4 AND attempts < max_attempts \
                 THEN NOW() + make_interval(secs => $5 * power(2, attempts)) \
                 ELSE NULL \
             END \
         WHERE id = $1 AND status IN ('queued', 'processing') \
         RETURNING {JOB_COLUMNS}"
    );

    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(message)
        .bind(detail)
        .bind(retryable)
        .bind(base_delay_secs)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_job).transpose()
}

/// Cancel a queued job. Only `queued` jobs are cancellable.
pub async fn cancel_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let sql = format!(
        "UPDATE jobs \
         SET status = 'cancelled', completed_at = NOW(), updated_at = NOW() \
         WHERE id = $1 AND status = 'queued' \
         RETURNING {JOB_COLUMNS}"
    );

    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;
    row.as_ref().map(map_job).transpose()
}

/// Record the provider-side task handle after an asynchronous submission.
pub async fn set_provider_task(
    pool: &PgPool,
    job_id: Uuid,
    provider_task_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET provider_task_id = $2, updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(job_id)
    .bind(provider_task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Jobs stuck in `processing` with no update for longer than `max_age_secs`.
///
/// Feeds the reconciliation sweep: a crashed worker or a provider that never
/// calls back leaves an abandoned `processing` row behind.
pub async fn find_stuck_jobs(
    pool: &PgPool,
    max_age_secs: f64,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs \
         WHERE status = 'processing' \
           AND updated_at < NOW() - make_interval(secs => $1) \
         ORDER BY updated_at ASC \
         LIMIT $2"
    );

    let rows = sqlx::query(&sql)
        .bind(max_age_secs)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter().map(map_job).collect()
}

/// Aggregate per-user job counts.
pub async fn stats_by_user(pool: &PgPool, user_id: &str) -> Result<UserStatsResponse, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE status = 'queued') AS queued,
            COUNT(*) FILTER (WHERE status = 'processing') AS processing,
            COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
            COUNT(*) FILTER (WHERE status = 'failed') AS failed,
            COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
            (AVG(processing_time_ms) FILTER (WHERE status = 'succeeded'))::DOUBLE PRECISION
                AS avg_processing_time_ms
        FROM jobs
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(UserStatsResponse {
        user_id: user_id.to_string(),
        total: row.try_get("total")?,
        queued: row.try_get("queued")?,
        processing: row.try_get("processing")?,
        succeeded: row.try_get("succeeded")?,
        failed: row.try_get("failed")?,
        cancelled: row.try_get("cancelled")?,
        avg_processing_time_ms: row.try_get("avg_processing_time_ms")?,
    })
}
