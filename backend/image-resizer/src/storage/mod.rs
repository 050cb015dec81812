//! Blob storage boundary
//!
//! - `BlobStore`: capability consumed by the pipeline
//! - `S3BlobStore`: production implementation over `s3-utils`
//! - `InMemoryBlobStore`: test double with failure injection

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub use memory::InMemoryBlobStore;
pub use s3::S3BlobStore;

/// An object read back from the store
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: String,
    pub size_bytes: u64,
    pub body: Bytes,
}

/// Blob store errors. Every variant is treated as transient by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Signed URL generation failed: {0}")]
    Presign(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Map an `image_url` reference (bare key or object URL) to a key
    fn resolve_key(&self, reference: &str) -> String {
        reference.to_string()
    }

    async fn get(&self, key: &str) -> Result<StoredObject, StorageError>;

    /// Store `body` under `key`, returning the stored key
    async fn put(&self, key: &str, content_type: &str, body: Bytes) -> Result<String, StorageError>;

    /// Issue a time-limited read URL for `key`
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}
