//! Image asset and variant definitions

use bytes::Bytes;

/// Name of the variant that represents an uploaded original
pub const ORIGINAL_VARIANT: &str = "original";

/// Content type of every derived variant
pub const VARIANT_CONTENT_TYPE: &str = "image/jpeg";

/// Target dimensions for one derived variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantSpec {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Variants produced for every original, in output order
pub const VARIANTS: [VariantSpec; 3] = [
    VariantSpec {
        name: "small",
        width: 320,
        height: 240,
    },
    VariantSpec {
        name: "medium",
        width: 640,
        height: 480,
    },
    VariantSpec {
        name: "large",
        width: 1280,
        height: 960,
    },
];

/// A logical image, materialized transiently while one message is processed
#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub id: String,
    /// Payload bytes; `None` once the asset only refers to stored data
    pub content: Option<Bytes>,
    pub content_type: String,
    pub size_bytes: u64,
    pub variant_name: String,
}

impl ImageAsset {
    /// An original as fetched from the blob store
    pub fn original(id: impl Into<String>, content_type: impl Into<String>, content: Bytes) -> Self {
        Self {
            id: id.into(),
            size_bytes: content.len() as u64,
            content: Some(content),
            content_type: content_type.into(),
            variant_name: ORIGINAL_VARIANT.to_string(),
        }
    }

    /// A JPEG-encoded variant derived from the original `id`
    pub fn variant(id: impl Into<String>, variant_name: &str, content: Bytes) -> Self {
        Self {
            id: id.into(),
            size_bytes: content.len() as u64,
            content: Some(content),
            content_type: VARIANT_CONTENT_TYPE.to_string(),
            variant_name: variant_name.to_string(),
        }
    }

    /// Payload bytes, empty when the content has been released
    pub fn bytes(&self) -> &[u8] {
        self.content.as_deref().unwrap_or_default()
    }
}
