//! Object storage for uploaded PDFs
//!
//! Implementations:
//! - `S3BlobStore`: AWS S3 (or any S3-compatible endpoint)
//! - `InMemoryBlobStore` in [`crate::testing`]

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use tracing::debug;

/// Trait for blob retrieval and cleanup
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the object's bytes; a missing object is [`AppError::NotFound`]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Delete the object
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// S3 blob store
pub struct S3BlobStore {
    client: S3Client,
}

impl S3BlobStore {
    /// Create from a shared AWS config, optionally pointing at a custom endpoint
    pub fn new(sdk_config: &aws_types::SdkConfig, endpoint_url: Option<&str>) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: S3Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    AppError::NotFound {
                        resource: format!("s3://{}/{}", bucket, key),
                    }
                } else {
                    AppError::StorageError {
                        message: format!("Failed to get s3://{}/{}: {}", bucket, key, e),
                    }
                }
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| AppError::StorageError {
                message: format!("Failed to read s3://{}/{}: {}", bucket, key, e),
            })?
            .into_bytes();

        debug!(bucket, key, size = bytes.len(), "Fetched object");
        Ok(bytes.to_vec())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::StorageError {
                message: format!("Failed to delete s3://{}/{}: {}", bucket, key, e),
            })?;

        debug!(bucket, key, "Deleted object");
        Ok(())
    }

    fn name(&self) -> &str {
        "s3"
    }
}
