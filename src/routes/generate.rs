use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use garde::Validate;
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::{artifact_queries, queries};
use crate::models::generation::{
    GenerateRequest, GenerateResponse, JobStatusResponse, UserStatsResponse,
};
use crate::models::job::JobStatus;
use crate::services::audit::AuditEvent;
use crate::services::processor::JOB_TYPE_COMPOSE;
use crate::services::queue::{BackoffPolicy, EnqueueOptions, QueueMetrics, QueuePayload};

/// The user identity is attached upstream by the auth gateway.
fn user_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// POST /api/v1/generations — enqueue a composition job.
pub async fn submit_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<GenerateResponse>), StatusCode> {
    let user_id = user_from_headers(&headers).ok_or(StatusCode::BAD_REQUEST)?;

    if request.validate().is_err() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let priority = request.priority.unwrap_or(5);
    let options = serde_json::to_value(crate::models::job::GenerationOptions::from(
        request.options,
    ))
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let job = queries::create_job(
        &state.db,
        queries::NewJob {
            user_id: &user_id,
            prompt: &request.prompt,
            primary_image_key: &request.primary_image_key,
            secondary_image_key: request.secondary_image_key.as_deref(),
            options,
            priority,
            max_attempts: state.config.max_attempts,
        },
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "failed to create job record");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let enqueued = state
        .queue
        .enqueue(
            JOB_TYPE_COMPOSE,
            QueuePayload {
                job_id: job.id,
                user_id: user_id.clone(),
            },
            EnqueueOptions {
                max_attempts: state.config.max_attempts.max(1) as u32,
                backoff: BackoffPolicy::exponential(state.config.retry_base_delay_ms),
                priority: priority.clamp(1, 10) as u8,
                delay: None,
            },
        )
        .await;

    if let Err(e) = enqueued {
        // The transport is the only way this job can ever run; leaving the
        // row `queued` would strand it, so take it back out.
        tracing::error!(job_id = %job.id, error = %e, "enqueue failed, cancelling job");
        if let Err(cancel_err) = queries::cancel_job(&state.db, job.id).await {
            tracing::error!(job_id = %job.id, error = %cancel_err, "failed to cancel stranded job");
        }
        return Err(if e.is_unavailable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        });
    }

    metrics::counter!("composegen_jobs_enqueued").increment(1);

    state.audit.record(AuditEvent {
        user_id,
        event_type: "generation".into(),
        action: "job_enqueued".into(),
        resource_id: Some(job.id.to_string()),
        details: Some(json!({"priority": priority})),
        is_success: true,
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse {
            job_id: job.id,
            status: job.status.to_string(),
        }),
    ))
}

/// GET /api/v1/generations/{id} — job status and artifact URLs.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = queries::find_job(&state.db, job_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to look up job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let mut output_url = None;
    let mut thumbnail_urls = Vec::new();

    if job.status == JobStatus::Succeeded {
        let artifacts = artifact_queries::list_for_job(&state.db, job.id)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to list artifacts");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;

        let ttl = state.config.download_url_ttl_secs;
        for artifact in &artifacts {
            match state.storage.presigned_get(&artifact.storage_key, ttl).await {
                Ok(url) if artifact.is_primary() => output_url = Some(url),
                Ok(url) => thumbnail_urls.push(url),
                Err(e) => {
                    tracing::warn!(
                        artifact_id = %artifact.id,
                        error = %e,
                        "failed to presign artifact URL"
                    );
                }
            }
        }
    }

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        status: job.status.to_string(),
        attempts: job.attempts,
        error: job.error,
        output_url,
        thumbnail_urls,
        queue_time_ms: job.queue_time_ms,
        processing_time_ms: job.processing_time_ms,
    }))
}

/// POST /api/v1/generations/{id}/cancel — cancel a queued job.
///
/// Jobs already processing cannot be cancelled: the provider call may be in
/// flight.
pub async fn cancel_generation(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<GenerateResponse>, StatusCode> {
    let cancelled = queries::cancel_job(&state.db, job_id).await.map_err(|e| {
        tracing::error!(error = %e, "failed to cancel job");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    match cancelled {
        Some(job) => {
            state.audit.record(AuditEvent {
                user_id: job.user_id.clone(),
                event_type: "generation".into(),
                action: "job_cancelled".into(),
                resource_id: Some(job.id.to_string()),
                details: None,
                is_success: true,
            });

            Ok(Json(GenerateResponse {
                job_id: job.id,
                status: job.status.to_string(),
            }))
        }
        None => {
            let exists = queries::find_job(&state.db, job_id)
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
                .is_some();
            Err(if exists {
                StatusCode::CONFLICT
            } else {
                StatusCode::NOT_FOUND
            })
        }
    }
}

/// GET /api/v1/generations/stats/{user_id} — per-user aggregates.
pub async fn user_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserStatsResponse>, StatusCode> {
    let stats = queries::stats_by_user(&state.db, &user_id).await.map_err(|e| {
        tracing::error!(error = %e, "failed to aggregate user stats");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(stats))
}

/// GET /api/v1/queue/stats — counts per queue bucket.
pub async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<QueueMetrics>, StatusCode> {
    match state.queue.metrics().await {
        Ok(metrics) => Ok(Json(metrics)),
        Err(e) if e.is_unavailable() => Err(StatusCode::SERVICE_UNAVAILABLE),
        Err(e) => {
            tracing::error!(error = %e, "failed to read queue metrics");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
