use image::{GenericImageView, ImageFormat};
use sqlx::PgPool;
use std::io::Cursor;
use std::sync::Arc;

use crate::db::artifact_queries::{self, NewArtifact};
use crate::models::artifact::Artifact;
use crate::services::storage::{make_storage_key, R2Client};

/// Best-effort thumbnail fan-out after a job succeeds.
///
/// Each configured size is derived, uploaded, and persisted as an artifact
/// referencing the primary. A failure in any single size is logged and
/// swallowed; it must never alter the parent job's succeeded status.
pub struct Thumbnailer {
    db: PgPool,
    storage: Arc<R2Client>,
    sizes: Vec<u32>,
}

impl Thumbnailer {
    pub fn new(db: PgPool, storage: Arc<R2Client>, sizes: Vec<u32>) -> Self {
        Self { db, storage, sizes }
    }

    /// Derive thumbnails for `primary`. Returns the number that succeeded.
    pub async fn fan_out(&self, primary: &Artifact, primary_bytes: &[u8], user_id: &str) -> usize {
        let mut generated = 0;

        for &size in &self.sizes {
            match self.derive_one(primary, primary_bytes, user_id, size).await {
                Ok(artifact) => {
                    tracing::debug!(
                        job_id = %primary.job_id,
                        artifact_id = %artifact.id,
                        size = size,
                        "thumbnail stored"
                    );
                    generated += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %primary.job_id,
                        size = size,
                        error = %e,
                        "thumbnail generation failed, continuing"
                    );
                }
            }
        }

        generated
    }

    async fn derive_one(
        &self,
        primary: &Artifact,
        primary_bytes: &[u8],
        user_id: &str,
        size: u32,
    ) -> Result<Artifact, ThumbnailError> {
        let (bytes, format) = scale_to_fit(primary_bytes, size)?;
        let mime_type = mime_for_format(format);

        let key = make_storage_key("thumbnails", &format!("thumb_{size}.{}", ext_for_format(format)), user_id);
        self.storage
            .upload(&key, &bytes, mime_type)
            .await
            .map_err(|e| ThumbnailError::Upload(e.to_string()))?;

        let (width, height) = image::load_from_memory(&bytes)
            .map(|img| (img.width() as i32, img.height() as i32))
            .map_err(ThumbnailError::Image)?;

        let artifact = artifact_queries::create_artifact(
            &self.db,
            NewArtifact {
                job_id: primary.job_id,
                parent_id: Some(primary.id),
                storage_key: &key,
                mime_type,
                size_bytes: bytes.len() as i64,
                width: Some(width),
                height: Some(height),
            },
        )
        .await?;

        Ok(artifact)
    }
}

/// Scale an image so its longest edge is at most `size`, preserving aspect.
fn scale_to_fit(bytes: &[u8], size: u32) -> Result<(Vec<u8>, ImageFormat), ThumbnailError> {
    let source_format = image::guess_format(bytes).map_err(ThumbnailError::Image)?;
    let img = image::load_from_memory(bytes).map_err(ThumbnailError::Image)?;
    // Derived sizes only ever shrink; small originals pass through.
    let scaled = if img.width().max(img.height()) <= size {
        img
    } else {
        img.thumbnail(size, size)
    };

    // webp encoding support is lossless-only; thumbnails re-encode as png.
    let format = match source_format {
        ImageFormat::Jpeg => ImageFormat::Jpeg,
        _ => ImageFormat::Png,
    };

    let mut out = Vec::new();
    scaled
        .write_to(&mut Cursor::new(&mut out), format)
        .map_err(ThumbnailError::Image)?;
    Ok((out, format))
}

fn mime_for_format(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        _ => "image/png",
    }
}

fn ext_for_format(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        _ => "png",
    }
}

#[derive(Debug, thiserror::Error)]
enum ThumbnailError {
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("thumbnail upload failed: {0}")]
    Upload(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                image::Rgba([255, 255, 255, 255])
            } else {
                image::Rgba([40, 40, 40, 255])
            }
        });
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn scales_down_preserving_aspect() {
        let source = checkerboard_png(640, 480);
        let (bytes, format) = scale_to_fit(&source, 256).unwrap();
        assert_eq!(format, ImageFormat::Png);

        let thumb = image::load_from_memory(&bytes).unwrap();
        assert_eq!(thumb.width(), 256);
        assert_eq!(thumb.height(), 192);
    }

    #[test]
    fn never_upscales() {
        let source = checkerboard_png(100, 80);
        let (bytes, _) = scale_to_fit(&source, 512).unwrap();
        let thumb = image::load_from_memory(&bytes).unwrap();
        assert_eq!(thumb.width(), 100);
        assert_eq!(thumb.height(), 80);
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(scale_to_fit(b"definitely not an image", 256).is_err());
    }
}
