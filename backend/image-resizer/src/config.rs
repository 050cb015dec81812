//! Configuration for the image resizer
//!
//! Built once at startup from environment variables and handed to the
//! components that need it.
use crate::error::{ResizerError, Result};
use crate::kafka::{KafkaBusConfig, TopicSpec};
use s3_utils::S3Config;
use serde::Deserialize;
use std::time::Duration;

/// How resized variants are announced on the output topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// One event per original listing every variant URL
    Aggregate,
    /// One event per variant, keyed by the variant's storage key
    PerVariant,
}

/// Main configuration struct, loaded from environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Kafka broker addresses (comma-separated)
    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,

    /// Topic carrying `image_created` events
    #[serde(default = "default_input_topic")]
    pub kafka_input_topic: String,

    /// Topic receiving `image_resized` events
    #[serde(default = "default_output_topic")]
    pub kafka_output_topic: String,

    #[serde(default = "default_group_id")]
    pub kafka_group_id: String,

    #[serde(default = "default_output_partitions")]
    pub kafka_output_partitions: i32,

    #[serde(default = "default_output_replication")]
    pub kafka_output_replication: i32,

    /// Permanently failing messages are copied here before being skipped
    #[serde(default)]
    pub kafka_dead_letter_topic: Option<String>,

    #[serde(default = "default_bucket")]
    pub s3_bucket: String,

    #[serde(default = "default_region")]
    pub aws_region: String,

    /// S3-compatible endpoint (MinIO, LocalStack)
    #[serde(default)]
    pub s3_endpoint: Option<String>,

    #[serde(default)]
    pub s3_path_style: bool,

    #[serde(default)]
    pub aws_access_key_id: Option<String>,

    #[serde(default)]
    pub aws_secret_access_key: Option<String>,

    /// Lifetime of the signed URLs announced for each variant
    #[serde(default = "default_signed_url_ttl")]
    pub signed_url_ttl_secs: u64,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    #[serde(default = "default_publish_mode")]
    pub publish_mode: PublishMode,

    /// How long shutdown waits for the in-flight message
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_input_topic() -> String {
    "image-service".to_string()
}

fn default_output_topic() -> String {
    "image-service-resized".to_string()
}

fn default_group_id() -> String {
    "image-resizer".to_string()
}

fn default_output_partitions() -> i32 {
    3
}

fn default_output_replication() -> i32 {
    1
}

fn default_bucket() -> String {
    "my-bucket".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_signed_url_ttl() -> u64 {
    3600 // 1 hour
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_publish_mode() -> PublishMode {
    PublishMode::Aggregate
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_retry_backoff_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kafka_brokers: default_kafka_brokers(),
            kafka_input_topic: default_input_topic(),
            kafka_output_topic: default_output_topic(),
            kafka_group_id: default_group_id(),
            kafka_output_partitions: default_output_partitions(),
            kafka_output_replication: default_output_replication(),
            kafka_dead_letter_topic: None,
            s3_bucket: default_bucket(),
            aws_region: default_region(),
            s3_endpoint: None,
            s3_path_style: false,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            signed_url_ttl_secs: default_signed_url_ttl(),
            jpeg_quality: default_jpeg_quality(),
            publish_mode: default_publish_mode(),
            shutdown_grace_secs: default_shutdown_grace(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> std::result::Result<Self, envy::Error> {
        envy::from_env()
    }

    /// Load and validate; any failure is fatal at startup
    pub fn load() -> Result<Self> {
        let config =
            Self::from_env().map_err(|e| ResizerError::Config(format!("Invalid environment: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ResizerError::Config(msg.to_string()));

        if self.kafka_brokers.split(',').all(|b| b.trim().is_empty()) {
            return fail("KAFKA_BROKERS must list at least one broker");
        }
        if self.kafka_input_topic.trim().is_empty() || self.kafka_output_topic.trim().is_empty() {
            return fail("KAFKA_INPUT_TOPIC and KAFKA_OUTPUT_TOPIC must be set");
        }
        if self.kafka_input_topic == self.kafka_output_topic {
            return fail("KAFKA_OUTPUT_TOPIC must differ from KAFKA_INPUT_TOPIC");
        }
        if self.kafka_group_id.trim().is_empty() {
            return fail("KAFKA_GROUP_ID must be set");
        }
        if self.kafka_output_partitions < 1 || self.kafka_output_replication < 1 {
            return fail("KAFKA_OUTPUT_PARTITIONS and KAFKA_OUTPUT_REPLICATION must be positive");
        }
        if self.s3_bucket.trim().is_empty() {
            return fail("S3_BUCKET must be set");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return fail("JPEG_QUALITY must be within 1..=100");
        }
        if self.signed_url_ttl_secs == 0 {
            return fail("SIGNED_URL_TTL_SECS must be positive");
        }
        if let Some(dlq) = self.dead_letter_topic() {
            if dlq == self.kafka_input_topic || dlq == self.kafka_output_topic {
                return fail("KAFKA_DEAD_LETTER_TOPIC must differ from the input and output topics");
            }
        }
        Ok(())
    }

    pub fn dead_letter_topic(&self) -> Option<&str> {
        self.kafka_dead_letter_topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Topics provisioned before the worker starts consuming
    pub fn topics_to_ensure(&self) -> Vec<TopicSpec> {
        let mut topics = vec![TopicSpec {
            name: self.kafka_output_topic.clone(),
            partitions: self.kafka_output_partitions,
            replication: self.kafka_output_replication,
        }];

        if let Some(dlq) = self.dead_letter_topic() {
            topics.push(TopicSpec {
                name: dlq.to_string(),
                partitions: self.kafka_output_partitions,
                replication: self.kafka_output_replication,
            });
        }

        topics
    }

    pub fn kafka(&self) -> KafkaBusConfig {
        KafkaBusConfig {
            brokers: self.kafka_brokers.clone(),
            group_id: self.kafka_group_id.clone(),
            input_topic: self.kafka_input_topic.clone(),
            ..Default::default()
        }
    }

    pub fn s3(&self) -> S3Config {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());

        S3Config {
            bucket: self.s3_bucket.clone(),
            region: self.aws_region.clone(),
            endpoint: non_empty(&self.s3_endpoint),
            path_style: self.s3_path_style,
            access_key_id: non_empty(&self.aws_access_key_id),
            secret_access_key: non_empty(&self.aws_secret_access_key),
        }
    }
}
