//! rdkafka-backed message bus
//!
//! Offsets are committed manually, one message at a time, and only when the
//! pipeline says so. Aborted messages are rewound with a partition seek.

use super::{BusError, CommitToken, Delivery, MessageBus, TopicSpec};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Kafka connection settings
#[derive(Debug, Clone)]
pub struct KafkaBusConfig {
    pub brokers: String,
    pub group_id: String,
    pub input_topic: String,
    pub delivery_timeout: Duration,
    pub admin_timeout: Duration,
    pub seek_timeout: Duration,
}

impl Default for KafkaBusConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "image-resizer".to_string(),
            input_topic: "image-service".to_string(),
            delivery_timeout: Duration::from_secs(30),
            admin_timeout: Duration::from_secs(10),
            seek_timeout: Duration::from_secs(5),
        }
    }
}

pub struct KafkaBus {
    consumer: Option<Arc<StreamConsumer>>,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    config: KafkaBusConfig,
}

impl KafkaBus {
    /// Consumer-group member subscribed to the input topic, with producer and admin handles
    pub fn new(config: KafkaBusConfig) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "45000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BusError::Config(format!("Failed to create Kafka consumer: {e}")))?;

        consumer
            .subscribe(&[&config.input_topic])
            .map_err(|e| BusError::Config(format!("Failed to subscribe to topic: {e}")))?;

        info!(
            brokers = %config.brokers,
            topic = %config.input_topic,
            group_id = %config.group_id,
            "Kafka consumer initialized"
        );

        let mut bus = Self::producer_only(config)?;
        bus.consumer = Some(Arc::new(consumer));
        Ok(bus)
    }

    /// Publish/admin handles only; `fetch_next`, `commit` and `redeliver` fail
    pub fn producer_only(config: KafkaBusConfig) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| BusError::Config(format!("Failed to create Kafka producer: {e}")))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("request.timeout.ms", "5000")
            .create()
            .map_err(|e| BusError::Config(format!("Failed to create Kafka admin client: {e}")))?;

        info!(brokers = %config.brokers, "Kafka producer initialized");

        Ok(Self {
            consumer: None,
            producer,
            admin,
            config,
        })
    }

    fn consumer(&self) -> Result<&Arc<StreamConsumer>, BusError> {
        self.consumer
            .as_ref()
            .ok_or_else(|| BusError::Config("bus was created without a consumer".to_string()))
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn fetch_next(&self) -> Result<Delivery, BusError> {
        let consumer = self.consumer()?;
        let message = consumer
            .recv()
            .await
            .map_err(|e| BusError::Consume(e.to_string()))?;

        Ok(Delivery {
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            token: CommitToken {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            },
        })
    }

    async fn commit(&self, token: &CommitToken) -> Result<(), BusError> {
        let consumer = self.consumer()?.clone();
        let token = token.clone();

        // Synchronous commit blocks on the broker round-trip
        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&token.topic, token.partition, Offset::Offset(token.offset + 1))
                .map_err(|e| BusError::Commit(e.to_string()))?;

            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| BusError::Commit(e.to_string()))
        })
        .await
        .map_err(|e| BusError::Commit(format!("Commit task failed: {e}")))?
    }

    async fn redeliver(&self, token: &CommitToken) -> Result<(), BusError> {
        let consumer = self.consumer()?.clone();
        let token = token.clone();
        let timeout = self.config.seek_timeout;

        tokio::task::spawn_blocking(move || {
            consumer
                .seek(&token.topic, token.partition, Offset::Offset(token.offset), timeout)
                .map_err(|e| BusError::Seek(e.to_string()))
        })
        .await
        .map_err(|e| BusError::Seek(format!("Seek task failed: {e}")))?
    }

    async fn publish(&self, topic: &str, key: &str, value: &[u8]) -> Result<(), BusError> {
        let record = FutureRecord::to(topic).key(key).payload(value);

        match self.producer.send(record, self.config.delivery_timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %topic,
                    key = %key,
                    partition = partition,
                    offset = offset,
                    "Published record"
                );
                Ok(())
            }
            Err((err, _)) => Err(BusError::Publish(format!("{topic}: {err}"))),
        }
    }

    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<(), BusError> {
        let new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.config.admin_timeout));

        let results = self
            .admin
            .create_topics(&[new_topic], &options)
            .await
            .map_err(|e| BusError::Admin(format!("create_topics failed: {e}")))?;

        for result in results {
            match result {
                Ok(name) => info!(
                    topic = %name,
                    partitions = spec.partitions,
                    replication = spec.replication,
                    "Created topic"
                ),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists")
                }
                Err((name, code)) => {
                    return Err(BusError::Admin(format!(
                        "Failed to create topic {name}: {code}"
                    )))
                }
            }
        }

        Ok(())
    }
}
