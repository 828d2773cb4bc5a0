use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::GenerationOptions;

/// Request to enqueue a composition job.
///
/// Input images are referenced by storage key; upload URL issuance is
/// handled by the storage layer before this endpoint is called.
#[derive(Debug, Deserialize, Validate)]
pub struct GenerateRequest {
    #[garde(length(min = 1, max = 2000))]
    pub prompt: String,

    #[garde(length(min = 1, max = 512))]
    pub primary_image_key: String,

    #[garde(inner(length(min = 1, max = 512)))]
    pub secondary_image_key: Option<String>,

    #[garde(dive)]
    #[serde(default)]
    pub options: GenerateOptionsRequest,

    #[garde(inner(range(min = 1, max = 10)))]
    pub priority: Option<i32>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct GenerateOptionsRequest {
    #[garde(inner(range(min = 0.0, max = 1.0)))]
    pub strength: Option<f64>,

    #[garde(inner(length(min = 1, max = 100)))]
    pub style: Option<String>,

    #[garde(skip)]
    pub seed: Option<i64>,
}

impl From<GenerateOptionsRequest> for GenerationOptions {
    fn from(req: GenerateOptionsRequest) -> Self {
        Self {
            strength: req.strength,
            style: req.style,
            seed: req.seed,
        }
    }
}

/// Response after a job has been accepted.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub thumbnail_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
}

/// Per-user aggregate counts returned by the stats endpoint.
#[derive(Debug, Serialize)]
pub struct UserStatsResponse {
    pub user_id: String,
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub cancelled: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_processing_time_ms: Option<f64>,
}
