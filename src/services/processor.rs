use async_trait::async_trait;
use image::GenericImageView;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;

use crate::db::artifact_queries::{self, NewArtifact};
use crate::db::queries;
use crate::models::job::{Job, JobStatus};
use crate::services::audit::{AuditEvent, AuditLog};
use crate::services::provider::{
    Dispatch, GeneratedImage, GenerationInputs, ProviderAdapter, ProviderError,
};
use crate::services::queue::QueueEntry;
use crate::services::storage::{make_storage_key, R2Client};
use crate::services::thumbnail::Thumbnailer;
use crate::services::worker::{JobError, JobHandler};

pub const JOB_TYPE_COMPOSE: &str = "image.compose";

/// Business logic for one composition job delivery.
///
/// The job row is transitioned to `processing` before any external call, so
/// a crash mid-call leaves an observable abandoned record for the
/// reconciliation sweep. Synchronous dispatches finalize in the same
/// delivery; asynchronous ones persist the provider task handle and leave
/// completion to the webhook handler.
pub struct GenerationProcessor {
    db: PgPool,
    storage: Arc<R2Client>,
    provider: ProviderAdapter,
    thumbnailer: Arc<Thumbnailer>,
    audit: Arc<AuditLog>,
    retry_base_delay_secs: f64,
}

impl GenerationProcessor {
    pub fn new(
        db: PgPool,
        storage: Arc<R2Client>,
        provider: ProviderAdapter,
        thumbnailer: Arc<Thumbnailer>,
        audit: Arc<AuditLog>,
        retry_base_delay_ms: u64,
    ) -> Self {
        Self {
            db,
            storage,
            provider,
            thumbnailer,
            audit,
            retry_base_delay_secs: retry_base_delay_ms as f64 / 1000.0,
        }
    }

    /// Record a failure on the job row and map it into the pool's error
    /// model. `retry_at` bookkeeping happens inside the guarded UPDATE.
    async fn fail_job(
        &self,
        job: &Job,
        message: &str,
        detail: Option<serde_json::Value>,
        retryable: bool,
    ) -> JobError {
        match queries::mark_failed(
            &self.db,
            job.id,
            message,
            detail,
            retryable,
            self.retry_base_delay_secs,
        )
        .await
        {
            Ok(Some(failed)) => {
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
            }
            Ok(None) => {
                tracing::info!(job_id = %job.id, "failure arrived after terminal state, ignored");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to record job failure");
            }
        }

        if retryable {
            JobError::Retryable(message.to_string())
        } else {
            JobError::Terminal(message.to_string())
        }
    }

    async fn finalize_success(
        &self,
        job: &Job,
        image: GeneratedImage,
        processing_ms: i64,
    ) -> Result<(), JobError> {
        let dimensions = image::load_from_memory(&image.bytes)
            .map(|img| (img.width() as i32, img.height() as i32))
            .ok();

        let base_name = format!("composition.{}", extension_for_mime(&image.mime_type));
        let key = make_storage_key("outputs", &base_name, &job.user_id);

        if let Err(e) = self.storage.upload(&key, &image.bytes, &image.mime_type).await {
            let msg = format!("failed to store output artifact: {e}");
            return Err(self.fail_job(job, &msg, None, true).await);
        }

        let artifact = match artifact_queries::create_artifact(
            &self.db,
            NewArtifact {
                job_id: job.id,
                parent_id: None,
                storage_key: &key,
                mime_type: &image.mime_type,
                size_bytes: image.bytes.len() as i64,
                width: dimensions.map(|(w, _)| w),
                height: dimensions.map(|(_, h)| h),
            },
        )
        .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                let msg = format!("failed to persist output artifact: {e}");
                return Err(self.fail_job(job, &msg, None, true).await);
            }
        };

        let won = queries::mark_succeeded(&self.db, job.id, artifact.id, processing_ms)
            .await
            .map_err(|e| JobError::Retryable(format!("failed to finalize job: {e}")))?;

        if !won {
            // A stall sweep or duplicate completion got there first; the
            // job row stays as the winner wrote it.
            tracing::warn!(
                job_id = %job.id,
                artifact_id = %artifact.id,
                "late completion discarded, job already terminal"
            );
            return Ok(());
        }

        tracing::info!(
            job_id = %job.id,
            artifact_id = %artifact.id,
            size_bytes = image.bytes.len(),
            processing_ms,
            "job succeeded"
        );

        self.audit.record(AuditEvent {
            user_id: job.user_id.clone(),
            event_type: "generation".into(),
            action: "job_succeeded".into(),
            resource_id: Some(job.id.to_string()),
            details: Some(json!({
                "artifact_id": artifact.id,
                "size_bytes": image.bytes.len(),
                "processing_ms": processing_ms,
            })),
            is_success: true,
        });

        // Best-effort enrichment; failures are logged inside.
        self.thumbnailer
            .fan_out(&artifact, &image.bytes, &job.user_id)
            .await;

        Ok(())
    }
}

#[async_trait]
impl JobHandler for GenerationProcessor {
    fn job_type(&self) -> &str {
        JOB_TYPE_COMPOSE
    }

    async fn handle(&self, entry: &QueueEntry) -> Result<(), JobError> {
        let job_id = entry.payload.job_id;

        let job = queries::find_job(&self.db, job_id)
            .await
            .map_err(|e| JobError::Retryable(format!("job lookup failed: {e}")))?;

        let Some(job) = job else {
            tracing::warn!(job_id = %job_id, "queue entry references a missing job, dropping");
            return Ok(());
        };

        if job.status.is_terminal() {
            // Cancelled while queued, or a duplicate delivery after
            // completion.
            tracing::info!(job_id = %job.id, status = %job.status, "job already terminal, skipping");
            return Ok(());
        }

        if job.status == JobStatus::Processing && job.provider_task_id.is_some() {
            // A stall redelivery of an async job that was already submitted;
            // completion belongs to the webhook handler.
            tracing::debug!(job_id = %job.id, "submission already in flight, awaiting callback");
            return Ok(());
        }

        let Some(job) = queries::mark_processing(&self.db, job_id)
            .await
            .map_err(|e| JobError::Retryable(format!("failed to mark job processing: {e}")))?
        else {
            tracing::info!(job_id = %job_id, "processing guard rejected delivery, skipping");
            return Ok(());
        };

        let started = std::time::Instant::now();

        let primary = match self.storage.download(&job.primary_image_key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let msg = format!("failed to fetch primary input: {e}");
                return Err(self.fail_job(&job, &msg, None, true).await);
            }
        };

        let secondary = match &job.secondary_image_key {
            Some(key) => match self.storage.download(key).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    let msg = format!("failed to fetch secondary input: {e}");
                    return Err(self.fail_job(&job, &msg, None, true).await);
                }
            },
            None => None,
        };

        let inputs = GenerationInputs {
            prompt: &job.prompt,
            primary: &primary,
            secondary: secondary.as_deref(),
            options: &job.options,
        };

        match self.provider.dispatch(inputs).await {
            Ok(Dispatch::Completed(image)) => {
                let processing_ms = started.elapsed().as_millis() as i64;
                self.finalize_success(&job, image, processing_ms).await
            }
            Ok(Dispatch::Submitted(task_id)) => {
                let recorded = queries::set_provider_task(&self.db, job.id, &task_id)
                    .await
                    .map_err(|e| {
                        JobError::Retryable(format!("failed to record provider task: {e}"))
                    })?;

                if !recorded {
                    tracing::warn!(
                        job_id = %job.id,
                        task_id = %task_id,
                        "job left processing before task id could be recorded"
                    );
                    return Ok(());
                }

                tracing::info!(
                    job_id = %job.id,
                    task_id = %task_id,
                    "submission accepted, awaiting provider callback"
                );

                self.audit.record(AuditEvent {
                    user_id: job.user_id.clone(),
                    event_type: "generation".into(),
                    action: "job_submitted".into(),
                    resource_id: Some(job.id.to_string()),
                    details: Some(json!({ "provider_task_id": task_id })),
                    is_success: true,
                });

                Ok(())
            }
            Err(e) => {
                let retryable = e.is_retryable();
                let message = e.to_string();
                Err(self
                    .fail_job(&job, &message, Some(provider_error_detail(&e)), retryable)
                    .await)
            }
        }
    }
}

fn provider_error_detail(e: &ProviderError) -> serde_json::Value {
    match e {
        ProviderError::Status { status, body } => {
            json!({"kind": "http_status", "status": status, "body": body})
        }
        ProviderError::ContentPolicy(reason) => {
            json!({"kind": "content_policy", "reason": reason})
        }
        ProviderError::Malformed(detail) => {
            json!({"kind": "malformed_response", "detail": detail})
        }
        ProviderError::Api { code, message } => {
            json!({"kind": "provider_api", "code": code, "message": message})
        }
        ProviderError::Http(e) => {
            json!({"kind": "network", "detail": e.to_string(), "timeout": e.is_timeout()})
        }
        ProviderError::Config(detail) => json!({"kind": "config", "detail": detail}),
    }
}

pub(crate) fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_follow_mime() {
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("image/webp"), "webp");
        assert_eq!(extension_for_mime("application/octet-stream"), "png");
    }
}
