//! Resize pipeline worker
//!
//! Pulls one message at a time from the bus and drives it through
//!
//! ```text
//! Received -> Fetched -> Transformed -> Stored -> Published -> Committed
//! ```
//!
//! or to `Aborted`. The inbound offset is committed only after every side
//! effect has completed, or when the message is permanently unprocessable.
//! Aborted messages are rewound for redelivery and the loop backs off before
//! fetching again. Nothing past an aborted message is fetched until its rewind
//! has succeeded.

use super::resizer::ImageResizer;
use crate::config::{Config, PublishMode};
use crate::error::{Disposition, ResizerError, Result};
use crate::kafka::{
    BusError, CommitToken, DeadLetterEvent, Delivery, EnvelopeError, InboundEvent, MessageBus, OutboundEvent,
    TopicSpec,
};
use crate::models::ImageAsset;
use crate::storage::BlobStore;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pipeline settings, projected from `Config`
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_topic: String,
    pub dead_letter_topic: Option<String>,
    pub publish_mode: PublishMode,
    pub signed_url_ttl: Duration,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    /// Topics ensured by `bootstrap`
    pub topics: Vec<TopicSpec>,
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            output_topic: config.kafka_output_topic.clone(),
            dead_letter_topic: config.dead_letter_topic().map(str::to_string),
            publish_mode: config.publish_mode,
            signed_url_ttl: config.signed_url_ttl(),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(config.max_retry_backoff_ms),
            topics: config.topics_to_ensure(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Per-message processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Fetched,
    Transformed,
    Stored,
    Published,
    Committed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Fetched => "fetched",
            Stage::Transformed => "transformed",
            Stage::Stored => "stored",
            Stage::Published => "published",
            Stage::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// Why a message's offset was committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitReason {
    /// Variants stored and announced
    Completed,
    /// `image_resized` echo, nothing to do
    Ignored,
    /// Permanently unprocessable
    Skipped,
}

/// Terminal state of one message
#[derive(Debug)]
pub enum MessageOutcome {
    Committed(CommitReason),
    /// Left uncommitted; `stage` is the last state reached
    ///
    /// `rewound` is false when the partition seek failed, in which case the
    /// consumer has already moved past this message and must not fetch again
    /// until a seek succeeds.
    Aborted {
        stage: Stage,
        error: ResizerError,
        rewound: bool,
    },
}

impl MessageOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, MessageOutcome::Committed(_))
    }
}

/// Counters for one run of the worker loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub completed: u64,
    pub ignored: u64,
    pub skipped: u64,
    pub aborted: u64,
    pub fetch_errors: u64,
    pub rewind_errors: u64,
}

impl WorkerStats {
    pub fn record(&mut self, outcome: &MessageOutcome) {
        self.received += 1;
        match outcome {
            MessageOutcome::Committed(CommitReason::Completed) => self.completed += 1,
            MessageOutcome::Committed(CommitReason::Ignored) => self.ignored += 1,
            MessageOutcome::Committed(CommitReason::Skipped) => self.skipped += 1,
            MessageOutcome::Aborted { rewound, .. } => {
                self.aborted += 1;
                if !rewound {
                    self.rewind_errors += 1;
                }
            }
        }
    }
}

/// A variant that has been written to the store
#[derive(Debug, Clone)]
struct StoredVariant {
    name: String,
    key: String,
    url: String,
}

enum Processed {
    Completed { image_id: String, variants: usize },
    Ignored,
}

struct Failure {
    stage: Stage,
    image_id: Option<String>,
    error: ResizerError,
}

fn at<E: Into<ResizerError>>(stage: Stage, image_id: Option<&str>) -> impl FnOnce(E) -> Failure {
    let image_id = image_id.map(str::to_string);
    move |e| Failure {
        stage,
        image_id,
        error: e.into(),
    }
}

pub struct ResizePipeline {
    store: Arc<dyn BlobStore>,
    bus: Arc<dyn MessageBus>,
    resizer: Arc<ImageResizer>,
    config: PipelineConfig,
}

impl ResizePipeline {
    pub fn new(
        store: Arc<dyn BlobStore>,
        bus: Arc<dyn MessageBus>,
        resizer: Arc<ImageResizer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            resizer,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ensure the output (and dead-letter) topics exist; failure is fatal
    pub async fn bootstrap(&self) -> Result<()> {
        for topic in &self.config.topics {
            self.bus.ensure_topic(topic).await?;
            info!(
                topic = %topic.name,
                partitions = topic.partitions,
                replication = topic.replication,
                "Topic ready"
            );
        }
        Ok(())
    }

    /// Consume until `shutdown` flips to true or its sender is dropped
    ///
    /// The signal is observed between messages and during backoff; a message
    /// already being handled is always driven to a terminal state.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        let mut backoff = self.config.retry_backoff;

        info!(output_topic = %self.config.output_topic, "Resize worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                fetched = self.bus.fetch_next() => fetched,
            };

            let failed = match fetched {
                Ok(delivery) => {
                    let outcome = self.handle(&delivery).await;
                    stats.record(&outcome);

                    if let MessageOutcome::Aborted { rewound: false, .. } = &outcome {
                        if !self
                            .rewind(&delivery.token, &mut stats, &mut shutdown)
                            .await
                        {
                            break;
                        }
                    }
                    !outcome.is_committed()
                }
                Err(e) => {
                    stats.fetch_errors += 1;
                    error!(error = %e, "Failed to fetch message");
                    true
                }
            };

            if !failed {
                // Reset backoff on successful message
                backoff = self.config.retry_backoff;
                continue;
            }

            debug!(backoff_ms = backoff.as_millis() as u64, "Backing off");
            if wait_or_shutdown(backoff, &mut shutdown).await {
                break;
            }
            backoff = (backoff * 2).min(self.config.max_retry_backoff);
        }

        info!(
            received = stats.received,
            completed = stats.completed,
            ignored = stats.ignored,
            skipped = stats.skipped,
            aborted = stats.aborted,
            fetch_errors = stats.fetch_errors,
            rewind_errors = stats.rewind_errors,
            "Resize worker stopped"
        );

        stats
    }

    /// Drive one delivery to `Committed` or `Aborted`
    pub async fn handle(&self, delivery: &Delivery) -> MessageOutcome {
        let (reached, reason) = match self.process(delivery).await {
            Ok(Processed::Completed { image_id, variants }) => {
                info!(
                    image_id = %image_id,
                    variants = variants,
                    offset = delivery.token.offset,
                    "Image resized"
                );
                (Stage::Published, CommitReason::Completed)
            }
            Ok(Processed::Ignored) => (Stage::Received, CommitReason::Ignored),
            Err(failure) => match failure.error.disposition() {
                Disposition::Retry => {
                    return self.abort(delivery, failure.stage, failure.error).await;
                }
                Disposition::Skip => {
                    warn!(
                        topic = %delivery.token.topic,
                        partition = delivery.token.partition,
                        offset = delivery.token.offset,
                        stage = %failure.stage,
                        error = %failure.error,
                        "Skipping unprocessable message"
                    );

                    if let Err(e) = self.dead_letter(delivery, &failure).await {
                        return self.abort(delivery, failure.stage, e.into()).await;
                    }
                    (failure.stage, CommitReason::Skipped)
                }
            },
        };

        match self.bus.commit(&delivery.token).await {
            Ok(()) => {
                debug!(
                    partition = delivery.token.partition,
                    offset = delivery.token.offset,
                    reason = ?reason,
                    "Offset committed"
                );
                MessageOutcome::Committed(reason)
            }
            Err(e) => self.abort(delivery, reached, e.into()).await,
        }
    }

    async fn process(&self, delivery: &Delivery) -> std::result::Result<Processed, Failure> {
        let event = InboundEvent::from_payload(delivery.payload.as_deref())
            .map_err(at(Stage::Received, None))?;

        let (image_id, source_ref) = match event {
            InboundEvent::ImageCreated {
                image_id,
                source_ref,
            } => (image_id, source_ref),
            InboundEvent::ImageResized { image_id } => {
                info!(image_id = ?image_id, "Ignoring image_resized event");
                return Ok(Processed::Ignored);
            }
            InboundEvent::Unknown { event_type } => {
                return Err(at(Stage::Received, None)(EnvelopeError::UnknownType(event_type)));
            }
        };
        let id = Some(image_id.as_str());

        let key = self
            .store
            .resolve_key(source_ref.as_deref().unwrap_or(&image_id));
        let object = self
            .store
            .get(&key)
            .await
            .map_err(at(Stage::Received, id))?;

        debug!(
            image_id = %image_id,
            key = %key,
            content_type = %object.content_type,
            size = object.size_bytes,
            "Fetched original"
        );

        let original = ImageAsset::original(image_id.clone(), object.content_type, object.body);
        let variants = self
            .resizer
            .clone()
            .resize_async(original)
            .await
            .map_err(at(Stage::Fetched, id))?;

        let stored = self
            .store_variants(&image_id, variants)
            .await
            .map_err(at(Stage::Transformed, id))?;

        self.announce(&image_id, &stored)
            .await
            .map_err(at(Stage::Stored, id))?;

        Ok(Processed::Completed {
            variants: stored.len(),
            image_id,
        })
    }

    /// Upload every variant under a fresh key and issue its signed URL
    async fn store_variants(
        &self,
        image_id: &str,
        variants: Vec<ImageAsset>,
    ) -> Result<Vec<StoredVariant>> {
        let mut stored = Vec::with_capacity(variants.len());

        for variant in variants {
            let key = format!(
                "resized/{}/{}-{}.jpg",
                image_id,
                variant.variant_name,
                Uuid::new_v4()
            );
            let body = variant.content.unwrap_or_default();

            let stored_key = self.store.put(&key, &variant.content_type, body).await?;
            let url = self
                .store
                .signed_url(&stored_key, self.config.signed_url_ttl)
                .await?;

            debug!(image_id = %image_id, variant = %variant.variant_name, key = %stored_key, "Stored variant");
            stored.push(StoredVariant {
                name: variant.variant_name,
                key: stored_key,
                url,
            });
        }

        Ok(stored)
    }

    /// Publish the outbound event(s) for a fully stored image
    async fn announce(&self, image_id: &str, stored: &[StoredVariant]) -> Result<()> {
        // Serialize everything first so a bad envelope publishes nothing
        let records = match self.config.publish_mode {
            PublishMode::Aggregate => {
                let urls = stored.iter().map(|v| v.url.clone()).collect();
                let payload = OutboundEvent::aggregate(image_id, urls).to_payload()?;
                vec![(image_id.to_string(), payload)]
            }
            PublishMode::PerVariant => stored
                .iter()
                .map(|v| {
                    OutboundEvent::per_variant(image_id, &v.name, &v.url)
                        .to_payload()
                        .map(|payload| (v.key.clone(), payload))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };

        for (key, payload) in &records {
            self.bus
                .publish(&self.config.output_topic, key, payload)
                .await?;
        }

        debug!(
            image_id = %image_id,
            topic = %self.config.output_topic,
            records = records.len(),
            "Published resize event"
        );
        Ok(())
    }

    /// Copy a permanently failed message to the dead-letter topic, if configured
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        failure: &Failure,
    ) -> std::result::Result<(), BusError> {
        let Some(topic) = self.config.dead_letter_topic.as_deref() else {
            return Ok(());
        };

        let token = &delivery.token;
        let record = DeadLetterEvent {
            original_topic: token.topic.clone(),
            partition: token.partition,
            offset: token.offset,
            payload: delivery
                .payload
                .as_deref()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            error: failure.error.to_string(),
            failed_at: chrono::Utc::now().timestamp_millis(),
        };
        let value = serde_json::to_vec(&record)
            .map_err(|e| BusError::Publish(format!("dead letter encoding: {e}")))?;

        let key = failure
            .image_id
            .clone()
            .or_else(|| {
                delivery
                    .key
                    .as_deref()
                    .map(|k| String::from_utf8_lossy(k).into_owned())
            })
            .unwrap_or_else(|| format!("{}-{}-{}", token.topic, token.partition, token.offset));

        self.bus.publish(topic, &key, &value).await?;

        info!(
            dead_letter_topic = %topic,
            offset = token.offset,
            "Routed message to dead-letter topic"
        );
        Ok(())
    }

    /// Retry the partition seek until it succeeds; `false` if shutdown came first
    async fn rewind(
        &self,
        token: &CommitToken,
        stats: &mut WorkerStats,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut backoff = self.config.retry_backoff;

        loop {
            if wait_or_shutdown(backoff, shutdown).await {
                warn!(
                    partition = token.partition,
                    offset = token.offset,
                    "Shutdown before rewind, message left uncommitted"
                );
                return false;
            }

            match self.bus.redeliver(token).await {
                Ok(()) => {
                    info!(
                        partition = token.partition,
                        offset = token.offset,
                        "Partition rewound, resuming"
                    );
                    return true;
                }
                Err(e) => {
                    stats.rewind_errors += 1;
                    error!(
                        partition = token.partition,
                        offset = token.offset,
                        error = %e,
                        "Rewind failed again, fetching stays paused"
                    );
                }
            }

            backoff = (backoff * 2).min(self.config.max_retry_backoff);
        }
    }

    async fn abort(&self, delivery: &Delivery, stage: Stage, error: ResizerError) -> MessageOutcome {
        let token = &delivery.token;
        error!(
            topic = %token.topic,
            partition = token.partition,
            offset = token.offset,
            stage = %stage,
            error = %error,
            "Message processing aborted, offset left uncommitted"
        );

        let rewound = match self.bus.redeliver(token).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    partition = token.partition,
                    offset = token.offset,
                    error = %e,
                    "Failed to rewind partition, fetching paused until the seek succeeds"
                );
                false
            }
        };

        MessageOutcome::Aborted {
            stage,
            error,
            rewound,
        }
    }
}

/// Sleep for `delay`, returning early with `true` if shutdown is requested
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
