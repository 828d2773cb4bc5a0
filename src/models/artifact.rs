use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A generated image stored in object storage.
///
/// A succeeded job owns exactly one primary artifact (`parent_id` is NULL);
/// thumbnails derived from it carry the primary's id in `parent_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub job_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub storage_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    #[inline]
    pub fn is_primary(&self) -> bool {
        self.parent_id.is_none()
    }
}
