/// S3 object operations: download, upload, and presigned download URLs
use crate::config::S3Config;
use crate::S3Error;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fallback content type when S3 does not report one
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct S3Operations {
    client: Arc<Client>,
    config: S3Config,
}

impl S3Operations {
    pub fn new(client: Arc<Client>, config: S3Config) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }

    /// Download an object together with its content type and length
    pub async fn get_object(&self, key: &str) -> Result<ObjectData, S3Error> {
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|svc| svc.is_no_such_key())
                    .unwrap_or(false)
                {
                    S3Error::NoSuchKey(key.to_string())
                } else {
                    S3Error::Request(format!(
                        "get_object {key} failed: {}",
                        DisplayErrorContext(&e)
                    ))
                }
            })?;

        let content_type = response
            .content_type()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| S3Error::Request(format!("Failed to read body of {key}: {e}")))?
            .into_bytes();

        debug!(key = %key, size = body.len(), content_type = %content_type, "Downloaded object");

        Ok(ObjectData {
            content_type,
            size: body.len() as u64,
            body,
        })
    }

    /// Upload an object with the given content type
    pub async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), S3Error> {
        let size = body.len();

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                S3Error::Request(format!(
                    "put_object {key} failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        debug!(key = %key, size = size, content_type = %content_type, "Uploaded object");
        Ok(())
    }

    /// Generate a presigned GET URL valid for `expires_in`
    pub async fn presigned_download_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, S3Error> {
        let presigning_config = PresigningConfig::builder()
            .expires_in(expires_in)
            .build()
            .map_err(|e| S3Error::Presign(format!("Invalid presigning config: {e}")))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| {
                S3Error::Presign(format!(
                    "Failed to presign {key}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(request.uri().to_string())
    }

    /// Check that the configured bucket is reachable with the current credentials
    pub async fn head_bucket(&self) -> Result<(), S3Error> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|e| {
                S3Error::Request(format!(
                    "head_bucket {} failed: {}",
                    self.config.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }
}

/// A downloaded object
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub content_type: String,
    pub size: u64,
    pub body: Bytes,
}
