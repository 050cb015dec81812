/// Shared S3 utilities
///
/// Provides AWS S3 client construction, configuration, and the object
/// operations used by the image pipeline.
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use std::sync::Arc;
use tracing::info;

pub mod config;
pub mod operations;

pub use config::S3Config;
pub use operations::{ObjectData, S3Operations};

/// S3 errors
#[derive(Debug, thiserror::Error)]
pub enum S3Error {
    /// The object does not exist in the bucket
    #[error("No such key: {0}")]
    NoSuchKey(String),

    /// The request failed (network, auth, throttling, service error)
    #[error("S3 request failed: {0}")]
    Request(String),

    /// Presigned URL generation failed
    #[error("Presign failed: {0}")]
    Presign(String),
}

/// Shared S3 client wrapper
#[derive(Clone)]
pub struct S3Client {
    client: Arc<Client>,
    config: S3Config,
}

impl S3Client {
    /// Build a client for the given configuration.
    ///
    /// Static credentials are used when both keys are set, otherwise the
    /// default AWS credential chain applies.
    pub async fn connect(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "s3_utils_static",
            );
            loader = loader.credentials_provider(credentials);
        }

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .build();

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            "S3 client initialized"
        );

        Self {
            client: Arc::new(Client::from_conf(s3_config)),
            config,
        }
    }

    /// Get S3 configuration
    pub fn config(&self) -> &S3Config {
        &self.config
    }

    /// Object operations bound to this client's bucket
    pub fn operations(&self) -> S3Operations {
        S3Operations::new(self.client.clone(), self.config.clone())
    }

    /// Health check for S3 connectivity
    pub async fn health_check(&self) -> Result<(), S3Error> {
        self.operations().head_bucket().await
    }
}
