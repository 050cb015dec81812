//! Image Resizer - event-driven derivation of resized image variants
//!
//! Consumes `image_created` events, fetches the original from blob storage,
//! produces the small/medium/large JPEG variants, stores them and announces
//! them with an `image_resized` event before committing the inbound offset.

pub mod config;
pub mod error;
pub mod kafka;
pub mod models;
pub mod services;
pub mod storage;

pub use config::{Config, PublishMode};
pub use error::{Disposition, ResizerError, Result};
pub use kafka::{InMemoryBus, KafkaBus, MessageBus};
pub use models::{ImageAsset, VariantSpec, VARIANTS};
pub use services::{
    CommitReason, ImageResizer, MessageOutcome, PipelineConfig, ResizePipeline, Stage,
    TransformError, WorkerStats,
};
pub use storage::{BlobStore, InMemoryBlobStore, S3BlobStore};

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the default filter; `LOG_FORMAT=json` switches to
/// JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "image_resizer=info,s3_utils=info,rdkafka=warn,info".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
