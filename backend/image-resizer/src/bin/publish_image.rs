//! publish-image - upload an original and announce it to the resize worker
//!
//! Stores the file under a fresh image id and publishes the matching
//! `image_created` event to the input topic. Prints the image id.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use image_resizer::kafka::{ImageCreatedEvent, KafkaBus, MessageBus};
use image_resizer::{BlobStore, Config, S3BlobStore};
use s3_utils::S3Client;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "publish-image")]
#[command(about = "Upload an image and publish an image_created event")]
#[command(version)]
struct Args {
    /// Image file to upload
    path: PathBuf,

    /// Key prefix for the stored original
    #[arg(long, default_value = "")]
    prefix: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    image_resizer::init_tracing();

    let args = Args::parse();
    let config = Config::load().context("Failed to load configuration")?;

    let data = tokio::fs::read(&args.path)
        .await
        .with_context(|| format!("Failed to read {}", args.path.display()))?;
    if data.is_empty() {
        bail!("{} is empty", args.path.display());
    }

    let content_type = match image::guess_format(&data) {
        Ok(format) => format.to_mime_type(),
        Err(_) => bail!("{} is not a recognized image", args.path.display()),
    };

    let image_id = Uuid::new_v4().to_string();
    let key = format!("{}{}", args.prefix, image_id);

    let s3_client = S3Client::connect(config.s3()).await;
    let store = S3BlobStore::new(&s3_client);
    let stored_key = store
        .put(&key, content_type, Bytes::from(data))
        .await
        .context("Failed to store original")?;

    info!(image_id = %image_id, key = %stored_key, content_type = %content_type, "Original stored");

    let bus = KafkaBus::producer_only(config.kafka()).context("Failed to create Kafka producer")?;
    let payload = ImageCreatedEvent::new(&image_id, &stored_key).to_payload()?;
    bus.publish(&config.kafka_input_topic, &image_id, &payload)
        .await
        .context("Failed to publish image_created event")?;

    info!(image_id = %image_id, topic = %config.kafka_input_topic, "Published image_created");
    println!("{image_id}");
    Ok(())
}
