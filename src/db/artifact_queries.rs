use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::artifact::Artifact;

fn map_artifact(row: &PgRow) -> Result<Artifact, sqlx::Error> {
    Ok(Artifact {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        parent_id: row.try_get("parent_id")?,
        storage_key: row.try_get("storage_key")?,
        mime_type: row.try_get("mime_type")?,
        size_bytes: row.try_get("size_bytes")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug)]
pub struct NewArtifact<'a> {
    pub job_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub storage_key: &'a str,
    pub mime_type: &'a str,
    pub size_bytes: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
}

/// Insert a new artifact row.
pub async fn create_artifact(pool: &PgPool, new: NewArtifact<'_>) -> Result<Artifact, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO artifacts (job_id, parent_id, storage_key, mime_type, size_bytes, width, height)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, job_id, parent_id, storage_key, mime_type, size_bytes, width, height, created_at
        "#,
    )
    .bind(new.job_id)
    .bind(new.parent_id)
    .bind(new.storage_key)
    .bind(new.mime_type)
    .bind(new.size_bytes)
    .bind(new.width)
    .bind(new.height)
    .fetch_one(pool)
    .await?;

    map_artifact(&row)
}

/// Get an artifact by ID
pub async fn find_artifact(pool: &PgPool, id: Uuid) -> Result<Option<Artifact>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, job_id, parent_id, storage_key, mime_type, size_bytes, width, height, created_at
        FROM artifacts
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(map_artifact).transpose()
}

/// All artifacts for a job, primary first.
pub async fn list_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<Artifact>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, job_id, parent_id, storage_key, mime_type, size_bytes, width, height, created_at
        FROM artifacts
        WHERE job_id = $1
        ORDER BY parent_id NULLS FIRST, created_at ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_artifact).collect()
}
