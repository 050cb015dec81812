//! S3-backed blob store

use super::{BlobStore, StorageError, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use s3_utils::{S3Client, S3Error, S3Operations};
use std::time::Duration;
use tracing::info;

pub struct S3BlobStore {
    operations: S3Operations,
}

impl S3BlobStore {
    pub fn new(client: &S3Client) -> Self {
        Self {
            operations: client.operations(),
        }
    }

    /// Establish the store session, failing if the bucket is unreachable
    pub async fn connect(client: &S3Client) -> Result<Self, StorageError> {
        client.health_check().await?;
        info!(bucket = %client.config().bucket, "S3 bucket reachable");
        Ok(Self::new(client))
    }
}

impl From<S3Error> for StorageError {
    fn from(err: S3Error) -> Self {
        match err {
            S3Error::NoSuchKey(key) => StorageError::NotFound(key),
            S3Error::Request(msg) => StorageError::Unavailable(msg),
            S3Error::Presign(msg) => StorageError::Presign(msg),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn resolve_key(&self, reference: &str) -> String {
        self.operations.config().object_key_from_ref(reference)
    }

    async fn get(&self, key: &str) -> Result<StoredObject, StorageError> {
        let object = self.operations.get_object(key).await?;
        Ok(StoredObject {
            content_type: object.content_type,
            size_bytes: object.size,
            body: object.body,
        })
    }

    async fn put(&self, key: &str, content_type: &str, body: Bytes) -> Result<String, StorageError> {
        self.operations.put_object(key, body, content_type).await?;
        Ok(key.to_string())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        Ok(self.operations.presigned_download_url(key, ttl).await?)
    }
}
