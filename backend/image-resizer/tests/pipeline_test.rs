/// Integration tests for the resize pipeline against in-memory store and bus
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageOutputFormat, Rgb};
use image_resizer::kafka::{CommitToken, InMemoryBus, MessageBus};
use image_resizer::storage::{InMemoryBlobStore, StorageError};
use image_resizer::{
    CommitReason, ImageResizer, MessageOutcome, PipelineConfig, PublishMode, ResizePipeline,
    ResizerError, Stage, VariantSpec, WorkerStats, VARIANTS,
};
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const INPUT_TOPIC: &str = "image-service";
const OUTPUT_TOPIC: &str = "image-service-resized";
const DLQ_TOPIC: &str = "image-service-dlq";

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, 90])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Jpeg(90))
        .unwrap();
    buf
}

/// Same names as the production set, scaled down to keep tests fast
fn compact_resizer() -> ImageResizer {
    ImageResizer::new(
        vec![
            VariantSpec {
                name: "small",
                width: 32,
                height: 24,
            },
            VariantSpec {
                name: "medium",
                width: 64,
                height: 48,
            },
            VariantSpec {
                name: "large",
                width: 128,
                height: 96,
            },
        ],
        85,
    )
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        retry_backoff: Duration::from_millis(5),
        max_retry_backoff: Duration::from_millis(20),
        ..Default::default()
    }
}

struct Harness {
    store: Arc<InMemoryBlobStore>,
    bus: Arc<InMemoryBus>,
    pipeline: Arc<ResizePipeline>,
}

impl Harness {
    fn new(config: PipelineConfig) -> Self {
        Self::with_resizer(config, compact_resizer())
    }

    fn with_resizer(config: PipelineConfig, resizer: ImageResizer) -> Self {
        let store = Arc::new(InMemoryBlobStore::new());
        let bus = Arc::new(InMemoryBus::new(INPUT_TOPIC));
        let pipeline = Arc::new(ResizePipeline::new(
            store.clone(),
            bus.clone(),
            Arc::new(resizer),
            config,
        ));
        Self {
            store,
            bus,
            pipeline,
        }
    }

    fn push_created(&self, image_id: &str, image_url: &str) -> CommitToken {
        self.bus.push_json(&json!({
            "type": "image_created",
            "image_id": image_id,
            "image_url": image_url,
        }))
    }

    async fn handle_next(&self) -> MessageOutcome {
        let delivery = self.bus.fetch_next().await.unwrap();
        self.pipeline.handle(&delivery).await
    }
}

async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ==================== Scenarios ====================

#[tokio::test]
async fn test_valid_image_created_stores_variants_and_publishes_once() {
    let h = Harness::new(test_config());
    h.store.insert("abc", "image/jpeg", jpeg(40, 30));
    let token = h.push_created("abc", "abc");

    let outcome = h.handle_next().await;
    assert!(matches!(
        outcome,
        MessageOutcome::Committed(CommitReason::Completed)
    ));

    let keys = h.store.stored_keys();
    assert_eq!(keys.len(), 3);
    for (key, name) in keys.iter().zip(["small", "medium", "large"]) {
        assert!(key.starts_with(&format!("resized/abc/{name}-")), "{key}");
        assert!(key.ends_with(".jpg"));
        assert_eq!(h.store.object(key).unwrap().content_type, "image/jpeg");
    }

    let published = h.bus.published_to(OUTPUT_TOPIC);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, "abc");

    let event = published[0].json();
    assert_eq!(event["type"], "image_resized");
    assert_eq!(event["image_id"], "abc");
    let urls: Vec<_> = event["image_url"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u.as_str().unwrap().to_string())
        .collect();
    let expected: Vec<_> = keys
        .iter()
        .map(|k| format!("memory://{k}?expires_in=3600"))
        .collect();
    assert_eq!(urls, expected);

    assert_eq!(h.bus.commits(), vec![token]);
}

#[tokio::test]
async fn test_image_resized_is_ignored_but_committed() {
    let h = Harness::new(test_config());
    let token = h.bus.push_json(&json!({
        "type": "image_resized",
        "image_id": "abc",
        "image_url": ["u1", "u2", "u3"],
    }));

    let outcome = h.handle_next().await;
    assert!(matches!(
        outcome,
        MessageOutcome::Committed(CommitReason::Ignored)
    ));
    assert_eq!(h.store.calls(), 0);
    assert!(h.bus.published().is_empty());
    assert!(h.bus.is_committed(&token));
}

#[tokio::test]
async fn test_missing_original_is_not_committed() {
    let h = Harness::new(test_config());
    let token = h.push_created("x", "x");

    let outcome = h.handle_next().await;
    match outcome {
        MessageOutcome::Aborted {
            stage: Stage::Received,
            error: ResizerError::Storage(StorageError::NotFound(key)),
            rewound: true,
        } => assert_eq!(key, "x"),
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert!(h.bus.commits().is_empty());
    assert!(h.bus.published().is_empty());
    assert_eq!(h.bus.redeliveries(), vec![token]);
    assert_eq!(h.bus.pending(), 1);
}

#[tokio::test]
async fn test_image_resized_with_non_string_id_is_still_ignored() {
    let h = Harness::new(dlq_config());
    let token = h.bus.push(None, br#"{"type":"image_resized","image_id":7,"image_url":["u"]}"#);

    assert!(matches!(
        h.handle_next().await,
        MessageOutcome::Committed(CommitReason::Ignored)
    ));
    assert!(h.bus.published().is_empty());
    assert!(h.bus.is_committed(&token));
}

#[tokio::test]
async fn test_unknown_event_type_is_skipped_without_side_effects() {
    let h = Harness::new(test_config());
    let token = h.bus.push(None, br#"{"type":"bogus"}"#);

    let outcome = h.handle_next().await;
    assert!(matches!(
        outcome,
        MessageOutcome::Committed(CommitReason::Skipped)
    ));
    assert_eq!(h.store.calls(), 0);
    assert!(h.bus.published().is_empty());
    assert!(h.bus.is_committed(&token));
}

// ==================== Properties ====================

#[tokio::test]
async fn test_variant_dimensions_match_production_set() {
    let h = Harness::with_resizer(test_config(), ImageResizer::with_quality(85));
    h.store.insert("orig", "image/jpeg", jpeg(50, 20));
    h.push_created("orig", "orig");

    assert!(h.handle_next().await.is_committed());

    let dims: Vec<_> = h
        .store
        .stored_keys()
        .iter()
        .map(|k| {
            let object = h.store.object(k).unwrap();
            image::load_from_memory(&object.body).unwrap().dimensions()
        })
        .collect();
    let expected: Vec<_> = VARIANTS.iter().map(|v| (v.width, v.height)).collect();
    assert_eq!(dims, expected);
}

#[tokio::test]
async fn test_undecodable_original_is_skipped() {
    let h = Harness::new(test_config());
    h.store.insert("bad", "image/jpeg", b"definitely not a jpeg".to_vec());
    let token = h.push_created("bad", "bad");

    let outcome = h.handle_next().await;
    assert!(matches!(
        outcome,
        MessageOutcome::Committed(CommitReason::Skipped)
    ));
    assert_eq!(h.store.get_calls(), 1);
    assert_eq!(h.store.put_calls(), 0);
    assert!(h.bus.published().is_empty());
    assert!(h.bus.is_committed(&token));
}

#[tokio::test]
async fn test_malformed_and_empty_payloads_are_skipped() {
    let h = Harness::new(test_config());
    let malformed = h.bus.push(Some("k"), b"{not json");
    let empty = h.bus.push_tombstone(Some("k"));
    let no_id = h.bus.push(None, br#"{"type":"image_created","image_url":"abc"}"#);

    for _ in 0..3 {
        assert!(matches!(
            h.handle_next().await,
            MessageOutcome::Committed(CommitReason::Skipped)
        ));
    }
    assert_eq!(h.bus.commits(), vec![malformed, empty, no_id]);
    assert_eq!(h.store.calls(), 0);
}

#[tokio::test]
async fn test_store_outage_is_not_committed() {
    let h = Harness::new(test_config());
    h.store.insert("abc", "image/jpeg", jpeg(16, 16));
    h.store.fail_gets(true);
    h.push_created("abc", "abc");

    let outcome = h.handle_next().await;
    assert!(matches!(
        outcome,
        MessageOutcome::Aborted {
            error: ResizerError::Storage(StorageError::Unavailable(_)),
            ..
        }
    ));
    assert!(h.bus.commits().is_empty());

    // Recovers on redelivery
    h.store.fail_gets(false);
    assert!(h.handle_next().await.is_committed());
    assert_eq!(h.bus.commits().len(), 1);
}

#[tokio::test]
async fn test_missing_image_url_falls_back_to_image_id() {
    let h = Harness::new(test_config());
    h.store.insert("abc", "image/jpeg", jpeg(16, 16));
    h.bus.push_json(&json!({"type": "image_created", "image_id": "abc"}));

    assert!(h.handle_next().await.is_committed());
    assert_eq!(h.store.stored_keys().len(), 3);
}

// ==================== Partial failures ====================

#[tokio::test]
async fn test_partial_upload_failure_retries_whole_message_with_fresh_keys() {
    let h = Harness::new(test_config());
    h.store.insert("abc", "image/jpeg", jpeg(24, 24));
    h.store.fail_put_at(Some(2));
    let token = h.push_created("abc", "abc");

    let outcome = h.handle_next().await;
    assert!(matches!(
        outcome,
        MessageOutcome::Aborted {
            stage: Stage::Transformed,
            error: ResizerError::Storage(_),
            rewound: true,
        }
    ));
    let orphaned = h.store.stored_keys();
    assert_eq!(orphaned.len(), 1);
    assert!(h.bus.published().is_empty());
    assert!(!h.bus.is_committed(&token));

    assert!(h.handle_next().await.is_committed());
    let keys = h.store.stored_keys();
    assert_eq!(keys.len(), 4);
    assert!(!keys[1..].contains(&orphaned[0]));
    assert_eq!(h.bus.published_to(OUTPUT_TOPIC).len(), 1);
    assert_eq!(h.bus.commits(), vec![token]);
}

#[tokio::test]
async fn test_publish_failure_is_not_committed() {
    let h = Harness::new(test_config());
    h.store.insert("abc", "image/jpeg", jpeg(24, 24));
    h.bus.fail_next_publishes(1);
    let token = h.push_created("abc", "abc");

    let outcome = h.handle_next().await;
    assert!(matches!(
        outcome,
        MessageOutcome::Aborted {
            stage: Stage::Stored,
            error: ResizerError::Bus(_),
            rewound: true,
        }
    ));
    assert_eq!(h.store.stored_keys().len(), 3);
    assert!(!h.bus.is_committed(&token));

    assert!(h.handle_next().await.is_committed());
    assert_eq!(h.store.stored_keys().len(), 6);
    assert_eq!(h.bus.published_to(OUTPUT_TOPIC).len(), 1);
}

#[tokio::test]
async fn test_signing_failure_is_not_committed() {
    let h = Harness::new(test_config());
    h.store.insert("abc", "image/jpeg", jpeg(24, 24));
    h.store.fail_signing(true);
    let token = h.push_created("abc", "abc");

    let outcome = h.handle_next().await;
    assert!(matches!(
        outcome,
        MessageOutcome::Aborted {
            stage: Stage::Transformed,
            error: ResizerError::Storage(StorageError::Presign(_)),
            rewound: true,
        }
    ));
    assert!(h.bus.published().is_empty());
    assert!(!h.bus.is_committed(&token));
    assert_eq!(h.bus.redeliveries(), vec![token.clone()]);

    h.store.fail_signing(false);
    assert!(h.handle_next().await.is_committed());
    assert_eq!(h.bus.commits(), vec![token]);
}

// ==================== Publish modes ====================

#[tokio::test]
async fn test_per_variant_mode_publishes_one_record_per_variant() {
    let h = Harness::new(PipelineConfig {
        publish_mode: PublishMode::PerVariant,
        ..test_config()
    });
    h.store.insert("abc", "image/jpeg", jpeg(24, 24));
    h.push_created("abc", "abc");

    assert!(h.handle_next().await.is_committed());

    let keys = h.store.stored_keys();
    let published = h.bus.published_to(OUTPUT_TOPIC);
    assert_eq!(published.len(), 3);

    for ((record, key), name) in published.iter().zip(&keys).zip(["small", "medium", "large"]) {
        assert_eq!(&record.key, key);
        let event = record.json();
        assert_eq!(event["type"], "image_resized");
        assert_eq!(event["image_id"], "abc");
        assert_eq!(event["variant"], name);
        assert_eq!(event["image_url"], format!("memory://{key}?expires_in=3600"));
    }
}

#[tokio::test]
async fn test_per_variant_publish_failure_midway_republishes_everything() {
    let h = Harness::new(PipelineConfig {
        publish_mode: PublishMode::PerVariant,
        ..test_config()
    });
    h.store.insert("abc", "image/jpeg", jpeg(24, 24));
    h.bus.fail_publish_at(Some(2));
    let token = h.push_created("abc", "abc");

    let outcome = h.handle_next().await;
    assert!(matches!(
        outcome,
        MessageOutcome::Aborted {
            stage: Stage::Stored,
            error: ResizerError::Bus(_),
            rewound: true,
        }
    ));
    assert_eq!(h.bus.published_to(OUTPUT_TOPIC).len(), 1);
    assert!(!h.bus.is_committed(&token));

    assert!(h.handle_next().await.is_committed());

    // The first attempt's record stays on the topic; the retry announces a full fresh set
    let keys = h.store.stored_keys();
    assert_eq!(keys.len(), 6);
    let published: Vec<_> = h
        .bus
        .published_to(OUTPUT_TOPIC)
        .iter()
        .map(|r| r.key.clone())
        .collect();
    assert_eq!(published.len(), 4);
    assert_eq!(published[0], keys[0]);
    assert_eq!(&published[1..], &keys[3..]);
    assert_eq!(h.bus.commits(), vec![token]);
}

// ==================== Dead-letter routing ====================

fn dlq_config() -> PipelineConfig {
    PipelineConfig {
        dead_letter_topic: Some(DLQ_TOPIC.to_string()),
        ..test_config()
    }
}

#[tokio::test]
async fn test_unknown_event_is_routed_to_dead_letter_topic() {
    let h = Harness::new(dlq_config());
    let token = h.bus.push(Some("k1"), br#"{"type":"bogus"}"#);

    assert!(matches!(
        h.handle_next().await,
        MessageOutcome::Committed(CommitReason::Skipped)
    ));

    let letters = h.bus.published_to(DLQ_TOPIC);
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].key, "k1");

    let letter = letters[0].json();
    assert_eq!(letter["original_topic"], INPUT_TOPIC);
    assert_eq!(letter["partition"], 0);
    assert_eq!(letter["offset"], token.offset);
    assert_eq!(letter["payload"], r#"{"type":"bogus"}"#);
    assert!(letter["error"].as_str().unwrap().contains("bogus"));
    assert!(letter["failed_at"].as_i64().unwrap() > 0);
    assert!(h.bus.is_committed(&token));
}

#[tokio::test]
async fn test_undecodable_image_dead_letter_is_keyed_by_image_id() {
    let h = Harness::new(dlq_config());
    h.store.insert("bad", "image/png", b"garbage".to_vec());
    h.push_created("bad", "bad");

    assert!(h.handle_next().await.is_committed());

    let letters = h.bus.published_to(DLQ_TOPIC);
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].key, "bad");
    assert!(h.bus.published_to(OUTPUT_TOPIC).is_empty());
}

#[tokio::test]
async fn test_dead_letter_publish_failure_is_retried() {
    let h = Harness::new(dlq_config());
    h.bus.fail_next_publishes(1);
    let token = h.bus.push(None, br#"{"type":"bogus"}"#);

    assert!(matches!(
        h.handle_next().await,
        MessageOutcome::Aborted {
            error: ResizerError::Bus(_),
            ..
        }
    ));
    assert!(!h.bus.is_committed(&token));

    assert!(h.handle_next().await.is_committed());
    assert_eq!(h.bus.published_to(DLQ_TOPIC).len(), 1);
}

// ==================== Bootstrap ====================

#[tokio::test]
async fn test_bootstrap_ensures_output_and_dead_letter_topics() {
    let h = Harness::new(dlq_config());
    h.pipeline.bootstrap().await.unwrap();

    let topics = h.bus.ensured_topics();
    assert_eq!(topics.len(), 2);
    assert_eq!(topics[0].name, OUTPUT_TOPIC);
    assert_eq!(topics[0].partitions, 3);
    assert_eq!(topics[0].replication, 1);
    assert_eq!(topics[1].name, DLQ_TOPIC);
}

#[tokio::test]
async fn test_bootstrap_failure_is_reported() {
    let h = Harness::new(test_config());
    h.bus.fail_admin(true);

    assert!(matches!(
        h.pipeline.bootstrap().await,
        Err(ResizerError::Bus(_))
    ));
}

// ==================== Worker loop ====================

#[tokio::test]
async fn test_run_processes_mixed_stream_in_order() {
    let h = Harness::new(test_config());
    h.store.insert("a", "image/jpeg", jpeg(20, 20));
    h.store.insert("b", "image/jpeg", jpeg(20, 20));

    let first = h.push_created("a", "a");
    let echo = h.bus.push_json(&json!({"type": "image_resized", "image_id": "a"}));
    let bogus = h.bus.push(None, br#"{"type":"bogus"}"#);
    let second = h.push_created("b", "b");

    let (tx, rx) = watch::channel(false);
    let pipeline = h.pipeline.clone();
    let worker = tokio::spawn(async move { pipeline.run(rx).await });

    let bus = h.bus.clone();
    wait_for(move || bus.commits().len() == 4).await;
    tx.send(true).unwrap();
    let stats = worker.await.unwrap();

    assert_eq!(h.bus.commits(), vec![first, echo, bogus, second]);
    assert_eq!(
        stats,
        WorkerStats {
            received: 4,
            completed: 2,
            ignored: 1,
            skipped: 1,
            aborted: 0,
            fetch_errors: 0,
            rewind_errors: 0,
        }
    );

    let announced: Vec<_> = h
        .bus
        .published_to(OUTPUT_TOPIC)
        .iter()
        .map(|r| r.key.clone())
        .collect();
    assert_eq!(announced, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_run_redelivers_aborted_message_after_backoff() {
    let h = Harness::new(test_config());
    h.store.insert("abc", "image/jpeg", jpeg(20, 20));
    h.bus.fail_next_publishes(2);
    let token = h.push_created("abc", "abc");

    let (tx, rx) = watch::channel(false);
    let pipeline = h.pipeline.clone();
    let worker = tokio::spawn(async move { pipeline.run(rx).await });

    let bus = h.bus.clone();
    let committed = token.clone();
    wait_for(move || bus.is_committed(&committed)).await;
    tx.send(true).unwrap();
    let stats = worker.await.unwrap();

    assert_eq!(stats.aborted, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(h.bus.redeliveries(), vec![token.clone(), token.clone()]);
    assert_eq!(h.bus.commits(), vec![token]);
    assert_eq!(h.bus.published_to(OUTPUT_TOPIC).len(), 1);
}

#[tokio::test]
async fn test_run_does_not_fetch_past_message_it_could_not_rewind() {
    let h = Harness::new(test_config());
    h.store.insert("b", "image/jpeg", jpeg(20, 20));
    h.bus.fail_next_seeks(3);
    let first = h.push_created("a", "a");
    let second = h.push_created("b", "b");

    let (tx, rx) = watch::channel(false);
    let pipeline = h.pipeline.clone();
    let worker = tokio::spawn(async move { pipeline.run(rx).await });

    // Seeks fail three times before the rewind lands
    let bus = h.bus.clone();
    wait_for(move || !bus.redeliveries().is_empty()).await;
    assert!(h.bus.commits().is_empty());
    assert!(!h.bus.is_committed(&second));

    h.store.insert("a", "image/jpeg", jpeg(20, 20));
    let bus = h.bus.clone();
    wait_for(move || bus.commits().len() == 2).await;
    tx.send(true).unwrap();
    let stats = worker.await.unwrap();

    assert_eq!(h.bus.commits(), vec![first, second]);
    assert_eq!(stats.rewind_errors, 3);
    assert_eq!(stats.completed, 2);
    assert_eq!(h.bus.in_flight(), 0);
}

#[tokio::test]
async fn test_run_stops_while_rewind_keeps_failing() {
    let h = Harness::new(test_config());
    h.bus.fail_next_seeks(usize::MAX);
    let first = h.push_created("missing", "missing");
    let second = h.push_created("also-missing", "also-missing");

    let (tx, rx) = watch::channel(false);
    let pipeline = h.pipeline.clone();
    let worker = tokio::spawn(async move { pipeline.run(rx).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_eq!(stats.received, 1);
    assert!(stats.rewind_errors >= 2);
    assert!(h.bus.commits().is_empty());
    assert!(!h.bus.is_committed(&first));
    assert!(!h.bus.is_committed(&second));
    assert_eq!(h.bus.pending(), 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown_while_idle() {
    let h = Harness::new(test_config());

    let (tx, rx) = watch::channel(false);
    let pipeline = h.pipeline.clone();
    let worker = tokio::spawn(async move { pipeline.run(rx).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    tx.send(true).unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_eq!(stats, WorkerStats::default());
}

#[tokio::test]
async fn test_run_stops_during_backoff_leaving_message_uncommitted() {
    let h = Harness::new(PipelineConfig {
        retry_backoff: Duration::from_secs(60),
        max_retry_backoff: Duration::from_secs(60),
        ..test_config()
    });
    let token = h.push_created("missing", "missing");

    let (tx, rx) = watch::channel(false);
    let pipeline = h.pipeline.clone();
    let worker = tokio::spawn(async move { pipeline.run(rx).await });

    let bus = h.bus.clone();
    wait_for(move || !bus.redeliveries().is_empty()).await;
    tx.send(true).unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_eq!(stats.aborted, 1);
    assert!(!h.bus.is_committed(&token));
    assert_eq!(h.bus.pending(), 1);
}

