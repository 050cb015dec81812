//! Kafka integration for the resize pipeline
//!
//! - `MessageBus`: consume/commit/publish/admin capability used by the worker
//! - `KafkaBus`: rdkafka implementation
//! - `InMemoryBus`: scripted test double
//! - `events`: message envelopes exchanged on the topics

pub mod bus;
pub mod events;
pub mod memory;

use async_trait::async_trait;

pub use bus::{KafkaBus, KafkaBusConfig};
pub use events::{
    DeadLetterEvent, EnvelopeError, EventType, ImageCreatedEvent, InboundEvent, OutboundEvent,
    ResizedUrls,
};
pub use memory::{InMemoryBus, PublishedRecord};

/// Position of a consumed message, used to commit or rewind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitToken {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A message pulled from the bus, detached from the consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub token: CommitToken,
}

/// Topic settings for create-if-absent provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Kafka configuration error: {0}")]
    Config(String),

    #[error("Kafka consume error: {0}")]
    Consume(String),

    #[error("Kafka commit error: {0}")]
    Commit(String),

    #[error("Kafka seek error: {0}")]
    Seek(String),

    #[error("Kafka publish error: {0}")]
    Publish(String),

    #[error("Kafka admin error: {0}")]
    Admin(String),
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Wait for the next message. Cancel by dropping the future.
    async fn fetch_next(&self) -> Result<Delivery, BusError>;

    /// Durably record that everything up to and including `token` is processed
    async fn commit(&self, token: &CommitToken) -> Result<(), BusError>;

    /// Rewind the partition so the message at `token` is fetched again
    async fn redeliver(&self, token: &CommitToken) -> Result<(), BusError>;

    async fn publish(&self, topic: &str, key: &str, value: &[u8]) -> Result<(), BusError>;

    /// Create the topic if it does not exist yet
    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<(), BusError>;
}
