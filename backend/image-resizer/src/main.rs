//! Image Resizer - main entry point
//!
//! Runs the resize worker as a member of the configured consumer group until
//! SIGINT/SIGTERM.

use anyhow::{Context, Result};
use image_resizer::{
    Config, ImageResizer, KafkaBus, PipelineConfig, ResizePipeline, S3BlobStore,
};
use s3_utils::S3Client;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    image_resizer::init_tracing();

    let config = Config::load().context("Failed to load configuration")?;

    info!(
        brokers = %config.kafka_brokers,
        input_topic = %config.kafka_input_topic,
        output_topic = %config.kafka_output_topic,
        group_id = %config.kafka_group_id,
        bucket = %config.s3_bucket,
        publish_mode = ?config.publish_mode,
        "Starting image-resizer"
    );

    // Startup failures are fatal: no store session, no topics, no loop
    let s3_client = S3Client::connect(config.s3()).await;
    let store = S3BlobStore::connect(&s3_client)
        .await
        .context("Failed to establish object store session")?;

    let bus = KafkaBus::new(config.kafka()).context("Failed to create Kafka bus")?;

    let pipeline = Arc::new(ResizePipeline::new(
        Arc::new(store),
        Arc::new(bus),
        Arc::new(ImageResizer::with_quality(config.jpeg_quality)),
        PipelineConfig::from(&config),
    ));

    pipeline
        .bootstrap()
        .await
        .context("Failed to provision Kafka topics")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(shutdown_rx).await })
    };

    shutdown_signal().await;
    info!("Shutdown signal received, stopping worker");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(config.shutdown_grace(), worker).await {
        Ok(Ok(stats)) => info!(
            completed = stats.completed,
            aborted = stats.aborted,
            "Worker drained"
        ),
        Ok(Err(e)) => error!(error = %e, "Worker task failed"),
        Err(_) => warn!(
            grace_secs = config.shutdown_grace_secs,
            "Grace period elapsed, abandoning in-flight message"
        ),
    }

    info!("image-resizer stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    }
}
