use s3::creds::Credentials;
use s3::{Bucket, Region};
use uuid::Uuid;

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    /// Upload artifact bytes to R2.
    pub async fn upload(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        Ok(())
    }

    /// Download artifact bytes from R2.
    pub async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await.map_err(StorageError::S3)?;
        Ok(response.to_vec())
    }

    /// Delete an object from R2.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.bucket.delete_object(key).await.map_err(StorageError::S3)?;
        Ok(())
    }

    /// Presigned GET URL for direct client downloads.
    pub async fn presigned_get(&self, key: &str, ttl_secs: u32) -> Result<String, StorageError> {
        self.bucket
            .presign_get(key, ttl_secs, None)
            .await
            .map_err(StorageError::S3)
    }
}

/// Build a collision-resistant storage key.
///
/// Repeated calls with the same base name and owner must never collide, so
/// a uuid is spliced in ahead of the sanitized base name.
pub fn make_storage_key(namespace: &str, base_name: &str, owner_id: &str) -> String {
    let sanitized: String = base_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{namespace}/{owner_id}/{}-{sanitized}", Uuid::new_v4())
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_keys_never_collide() {
        let a = make_storage_key("outputs", "result.png", "user-1");
        let b = make_storage_key("outputs", "result.png", "user-1");
        assert_ne!(a, b);
        assert!(a.starts_with("outputs/user-1/"));
        assert!(a.ends_with("-result.png"));
    }

    #[test]
    fn storage_keys_sanitize_base_names() {
        let key = make_storage_key("outputs", "my photo (1).png", "user-1");
        assert!(!key.contains(' '));
        assert!(!key.contains('('));
        assert!(key.ends_with("-my_photo__1_.png"));
    }
}
