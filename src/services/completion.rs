use chrono::Utc;
use image::GenericImageView;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::db::artifact_queries::{self, NewArtifact};
use crate::db::queries;
use crate::models::job::Job;
use crate::services::audit::{AuditEvent, AuditLog};
use crate::services::processor::{extension_for_mime, JOB_TYPE_COMPOSE};
use crate::services::queue::{BackoffPolicy, EnqueueOptions, JobQueue, QueueError, QueuePayload};
use crate::services::storage::{make_storage_key, R2Client};
use crate::services::thumbnail::Thumbnailer;

/// Lock TTL bounding how long a finalizer can hold a job id.
const COMPLETION_LOCK_TTL: Duration = Duration::from_secs(30);
/// Stuck jobs swept per pass.
const SWEEP_BATCH: i64 = 50;

/// Inbound provider callback: `{taskId, code, data|error}`.
///
/// `code == 0` is success. The same task id may be delivered zero, one, or
/// many times.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCallback {
    pub task_id: String,
    pub code: i64,
    #[serde(default)]
    pub data: Option<CallbackData>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackData {
    #[serde(default)]
    pub output_url: Option<String>,
    #[serde(default)]
    pub images: Vec<CallbackImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackImage {
    pub url: String,
}

impl ProviderCallback {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// The artifact reference carried by a success callback.
    pub fn artifact_url(&self) -> Option<&str> {
        let data = self.data.as_ref()?;
        data.output_url
            .as_deref()
            .or_else(|| data.images.first().map(|i| i.url.as_str()))
    }
}

/// How a callback was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDisposition {
    /// No job knows this task id; acknowledged and dropped.
    Orphaned,
    /// The job already reached a terminal state; acknowledged and dropped.
    Duplicate,
    /// Another finalizer holds the job lock right now.
    Busy,
    Succeeded,
    Failed,
}

/// Finalizes jobs outside the worker pool.
///
/// Both entry points (the provider webhook and the stuck-job sweep) race
/// against each other and against in-process retries, so every finalization
/// runs under a per-job lock, with the guarded UPDATE as the authoritative
/// arbiter: exactly one terminal transition wins, the rest degrade to
/// logged no-ops.
pub struct CompletionService {
    db: PgPool,
    storage: Arc<R2Client>,
    queue: Arc<JobQueue>,
    thumbnailer: Arc<Thumbnailer>,
    audit: Arc<AuditLog>,
    http: reqwest::Client,
    retry_base_delay_ms: u64,
}

impl CompletionService {
    pub fn new(
        db: PgPool,
        storage: Arc<R2Client>,
        queue: Arc<JobQueue>,
        thumbnailer: Arc<Thumbnailer>,
        audit: Arc<AuditLog>,
        retry_base_delay_ms: u64,
    ) -> Self {
        Self {
            db,
            storage,
            queue,
            thumbnailer,
            audit,
            http: reqwest::Client::new(),
            retry_base_delay_ms,
        }
    }

    /// Reconcile a provider callback with the pending job record.
    pub async fn handle_callback(
        &self,
        callback: &ProviderCallback,
    ) -> Result<CallbackDisposition, CompletionError> {
        let job = queries::find_job_by_provider_task(&self.db, &callback.task_id).await?;

        let Some(job) = job else {
            tracing::info!(task_id = %callback.task_id, "orphaned provider callback, ignoring");
            return Ok(CallbackDisposition::Orphaned);
        };

        if job.status.is_terminal() {
            tracing::info!(
                job_id = %job.id,
                task_id = %callback.task_id,
                status = %job.status,
                "duplicate provider callback for terminal job, ignoring"
            );
            return Ok(CallbackDisposition::Duplicate);
        }

        let lock_name = format!("job:{}", job.id);
        if !self.queue.try_lock(&lock_name, COMPLETION_LOCK_TTL).await? {
            tracing::info!(job_id = %job.id, "job is being finalized elsewhere, deferring");
            return Ok(CallbackDisposition::Busy);
        }

        let disposition = self.reconcile_locked(callback, &job).await;

        if let Err(e) = self.queue.unlock(&lock_name).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to release completion lock");
        }

        disposition
    }

    async fn reconcile_locked(
        &self,
        callback: &ProviderCallback,
        job: &Job,
    ) -> Result<CallbackDisposition, CompletionError> {
        // Re-read under the lock: the stuck sweep may have finalized the job
        // between lookup and lock acquisition.
        let Some(job) = queries::find_job(&self.db, job.id).await? else {
            return Ok(CallbackDisposition::Orphaned);
        };

        if job.status.is_terminal() {
            tracing::info!(job_id = %job.id, status = %job.status, "job turned terminal before reconciliation");
            return Ok(CallbackDisposition::Duplicate);
        }

        if callback.is_success() {
            self.finalize_success(callback, &job).await
        } else {
            let message = callback
                .error
                .clone()
                .unwrap_or_else(|| format!("provider reported failure code {}", callback.code));
            self.finalize_failure(
                &job,
                &message,
                json!({"kind": "provider_callback", "code": callback.code}),
            )
            .await
        }
    }

    async fn finalize_success(
        &self,
        callback: &ProviderCallback,
        job: &Job,
    ) -> Result<CallbackDisposition, CompletionError> {
        let Some(url) = callback.artifact_url() else {
            return self
                .finalize_failure(
                    job,
                    "success callback carried no artifact reference",
                    json!({"kind": "malformed_callback"}),
                )
                .await;
        };

        let bytes = match self.download_artifact(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .finalize_failure(
                        job,
                        &format!("failed to fetch provider artifact: {e}"),
                        json!({"kind": "artifact_download", "url": url}),
                    )
                    .await;
            }
        };

        let Ok(format) = image::guess_format(&bytes) else {
            return self
                .finalize_failure(
                    job,
                    "provider artifact is not a recognizable image",
                    json!({"kind": "artifact_invalid", "url": url}),
                )
                .await;
        };
        let mime_type = match format {
            image::ImageFormat::Jpeg => "image/jpeg",
            image::ImageFormat::WebP => "image/webp",
            _ => "image/png",
        };

        let dimensions = image::load_from_memory(&bytes)
            .map(|img| (img.width() as i32, img.height() as i32))
            .ok();

        let key = make_storage_key(
            "outputs",
            &format!("composition.{}", extension_for_mime(mime_type)),
            &job.user_id,
        );
        if let Err(e) = self.storage.upload(&key, &bytes, mime_type).await {
            return self
                .finalize_failure(
                    job,
                    &format!("failed to store output artifact: {e}"),
                    json!({"kind": "storage"}),
                )
                .await;
        }

        let artifact = artifact_queries::create_artifact(
            &self.db,
            NewArtifact {
                job_id: job.id,
                parent_id: None,
                storage_key: &key,
                mime_type,
                size_bytes: bytes.len() as i64,
                width: dimensions.map(|(w, _)| w),
                height: dimensions.map(|(_, h)| h),
            },
        )
        .await?;

        let processing_ms = job
            .started_at
            .map(|s| (Utc::now() - s).num_milliseconds().max(0))
            .unwrap_or(0);

        let won = queries::mark_succeeded(&self.db, job.id, artifact.id, processing_ms).await?;
        if !won {
            tracing::warn!(
                job_id = %job.id,
                artifact_id = %artifact.id,
                "late webhook completion discarded, job already terminal"
            );
            return Ok(CallbackDisposition::Duplicate);
        }

        tracing::info!(
            job_id = %job.id,
            artifact_id = %artifact.id,
            task_id = %callback.task_id,
            size_bytes = bytes.len(),
            "job succeeded via provider callback"
        );

        self.audit.record(AuditEvent {
            user_id: job.user_id.clone(),
            event_type: "generation".into(),
            action: "job_succeeded".into(),
            resource_id: Some(job.id.to_string()),
            details: Some(json!({
                "artifact_id": artifact.id,
                "provider_task_id": callback.task_id,
                "size_bytes": bytes.len(),
            })),
            is_success: true,
        });

        self.thumbnailer.fan_out(&artifact, &bytes, &job.user_id).await;

        Ok(CallbackDisposition::Succeeded)
    }

    async fn finalize_failure(
        &self,
        job: &Job,
        message: &str,
        detail: serde_json::Value,
    ) -> Result<CallbackDisposition, CompletionError> {
        let failed = queries::mark_failed(
            &self.db,
            job.id,
            message,
            Some(detail),
            true,
            self.retry_base_delay_ms as f64 / 1000.0,
        )
        .await?;

        let Some(failed) = failed else {
            tracing::info!(job_id = %job.id, "late failure discarded, job already terminal");
            return Ok(CallbackDisposition::Duplicate);
        };

        tracing::warn!(
            job_id = %failed.id,
            attempts = failed.attempts,
            retrying = failed.retry_at.is_some(),
            error = %message,
            "job failed out-of-band"
        );

        self.audit.record(AuditEvent {
            user_id: failed.user_id.clone(),
            event_type: "generation".into(),
            action: "job_failed".into(),
            resource_id: Some(failed.id.to_string()),
            details: Some(json!({
                "attempts": failed.attempts,
                "retry_at": failed.retry_at,
                "error": message,
            })),
            is_success: false,
        });

        // failed -> processing only happens as a queue-driven retry, so a
        // retryable out-of-band failure gets a fresh delayed entry.
        if failed.retry_at.is_some() {
            self.schedule_retry(&failed).await;
        }

        Ok(CallbackDisposition::Failed)
    }

    async fn schedule_retry(&self, job: &Job) {
        let Some(retry_at) = job.retry_at else { return };
        let delay = (retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let remaining = (job.max_attempts - job.attempts).max(1) as u32;

        let result = self
            .queue
            .enqueue(
                JOB_TYPE_COMPOSE,
                QueuePayload {
                    job_id: job.id,
                    user_id: job.user_id.clone(),
                },
                EnqueueOptions {
                    max_attempts: remaining,
                    backoff: BackoffPolicy::exponential(self.retry_base_delay_ms),
                    priority: job.priority.clamp(1, 10) as u8,
                    delay: Some(delay),
                },
            )
            .await;

        match result {
            Ok(entry) => {
                tracing::info!(
                    job_id = %job.id,
                    entry_id = %entry.id,
                    run_at = %entry.run_at,
                    "retry entry scheduled"
                );
            }
            Err(e) => {
                // The job row keeps its retry_at; the stuck sweep will pick
                // it up if the transport stays down.
                tracing::error!(job_id = %job.id, error = %e, "failed to schedule retry entry");
            }
        }
    }

    async fn download_artifact(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }

    /// Fail jobs abandoned in `processing` past `max_age_secs`.
    ///
    /// Covers crashed workers and asynchronous submissions whose callback
    /// never arrived. Returns how many jobs were swept.
    pub async fn sweep_stuck(&self, max_age_secs: u64) -> Result<usize, CompletionError> {
        let stuck = queries::find_stuck_jobs(&self.db, max_age_secs as f64, SWEEP_BATCH).await?;
        let mut swept = 0;

        for job in stuck {
            let lock_name = format!("job:{}", job.id);
            if !self.queue.try_lock(&lock_name, COMPLETION_LOCK_TTL).await? {
                continue;
            }

            let disposition = self
                .finalize_failure(
                    &job,
                    &format!("processing exceeded {max_age_secs}s with no completion"),
                    json!({"kind": "stuck_sweep", "provider_task_id": job.provider_task_id}),
                )
                .await;

            if let Err(e) = self.queue.unlock(&lock_name).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to release completion lock");
            }

            match disposition {
                Ok(CallbackDisposition::Failed) => {
                    metrics::counter!("composegen_jobs_swept").increment(1);
                    swept += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "stuck sweep failed for job")
                }
            }
        }

        Ok(swept)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn callback_parses_success_shape() {
        let cb: ProviderCallback = serde_json::from_value(json!({
            "taskId": "task-9",
            "code": 0,
            "data": {"images": [{"url": "https://cdn.example.com/out.png"}]}
        }))
        .unwrap();

        assert!(cb.is_success());
        assert_eq!(cb.artifact_url(), Some("https://cdn.example.com/out.png"));
    }

    #[test]
    fn callback_prefers_output_url_over_image_list() {
        let cb: ProviderCallback = serde_json::from_value(json!({
            "taskId": "task-9",
            "code": 0,
            "data": {
                "outputUrl": "https://cdn.example.com/primary.png",
                "images": [{"url": "https://cdn.example.com/other.png"}]
            }
        }))
        .unwrap();

        assert_eq!(cb.artifact_url(), Some("https://cdn.example.com/primary.png"));
    }

    #[test]
    fn callback_parses_failure_shape() {
        let cb: ProviderCallback = serde_json::from_value(json!({
            "taskId": "task-9",
            "code": 5001,
            "error": "generation failed upstream"
        }))
        .unwrap();

        assert!(!cb.is_success());
        assert_eq!(cb.artifact_url(), None);
        assert_eq!(cb.error.as_deref(), Some("generation failed upstream"));
    }

    #[test]
    fn success_without_data_has_no_artifact() {
        let cb: ProviderCallback =
            serde_json::from_value(json!({"taskId": "task-9", "code": 0})).unwrap();
        assert!(cb.is_success());
        assert_eq!(cb.artifact_url(), None);
    }
}
