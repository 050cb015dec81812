//! Variant generator - derives fixed-size JPEG variants from an original
//!
//! Every variant is resized to exactly its target dimensions with a Lanczos
//! filter and re-encoded as JPEG at a fixed quality, so identical inputs give
//! identical bytes.
//!
//! Uses `spawn_blocking` for the CPU-bound work to keep the runtime responsive.

use crate::models::{ImageAsset, VariantSpec, VARIANTS};
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode variant: {0}")]
    Encode(String),

    #[error("Resize task failed: {0}")]
    Task(String),
}

/// Produces one variant per configured `VariantSpec`, in order
pub struct ImageResizer {
    variants: Vec<VariantSpec>,
    quality: u8,
}

impl ImageResizer {
    pub fn new(variants: Vec<VariantSpec>, quality: u8) -> Self {
        Self { variants, quality }
    }

    /// Standard small/medium/large set
    pub fn with_quality(quality: u8) -> Self {
        Self::new(VARIANTS.to_vec(), quality)
    }

    pub fn variants(&self) -> &[VariantSpec] {
        &self.variants
    }

    /// Resize `original` into every variant (blocking version)
    ///
    /// **Note:** CPU-intensive; call `resize_async` from async code.
    pub fn resize(&self, original: &ImageAsset) -> Result<Vec<ImageAsset>, TransformError> {
        let img = image::load_from_memory(original.bytes())
            .map_err(|e| TransformError::Decode(e.to_string()))?;

        let (orig_w, orig_h) = img.dimensions();
        debug!(
            image_id = %original.id,
            original_width = orig_w,
            original_height = orig_h,
            "Decoded original"
        );

        self.variants
            .iter()
            .map(|spec| {
                let resized = img.resize_exact(spec.width, spec.height, FilterType::Lanczos3);
                let data = self.encode_jpeg(&resized)?;

                debug!(
                    image_id = %original.id,
                    variant = spec.name,
                    size = data.len(),
                    "Variant generated"
                );

                Ok(ImageAsset::variant(original.id.clone(), spec.name, data))
            })
            .collect()
    }

    /// Resize on the blocking thread pool
    pub async fn resize_async(
        self: Arc<Self>,
        original: ImageAsset,
    ) -> Result<Vec<ImageAsset>, TransformError> {
        tokio::task::spawn_blocking(move || self.resize(&original))
            .await
            .map_err(|e| TransformError::Task(e.to_string()))?
    }

    fn encode_jpeg(&self, img: &DynamicImage) -> Result<Bytes, TransformError> {
        let mut buf = Vec::new();
        let mut cursor = Cursor::new(&mut buf);

        // JPEG has no alpha channel
        DynamicImage::ImageRgb8(img.to_rgb8())
            .write_to(&mut cursor, ImageOutputFormat::Jpeg(self.quality))
            .map_err(|e| TransformError::Encode(e.to_string()))?;

        Ok(Bytes::from(buf))
    }
}
