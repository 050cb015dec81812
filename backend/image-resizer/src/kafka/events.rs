//! Message envelopes exchanged over Kafka
//!
//! Inbound:  `{"type": "image_created", "image_id": "..", "image_url": ".."}`
//! Outbound: `{"type": "image_resized", "image_id": "..", "image_url": <url or list>}`

use serde::{Deserialize, Serialize};

/// Event type tag carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ImageCreated,
    ImageResized,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ImageCreated => "image_created",
            EventType::ImageResized => "image_resized",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Empty message payload")]
    Empty,

    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Envelope of type {event_type} is missing field {field}")]
    MissingField {
        event_type: &'static str,
        field: &'static str,
    },

    #[error("Unrecognized event type: {0}")]
    UnknownType(String),

    #[error("Failed to serialize envelope: {0}")]
    Serialize(String),
}

/// Wire shape before classification
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    /// Only `image_created` requires a string here
    #[serde(default)]
    image_id: Option<serde_json::Value>,
    #[serde(default)]
    image_url: Option<serde_json::Value>,
}

/// A decoded inbound message, classified over the closed set of event kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    ImageCreated {
        image_id: String,
        /// Key or URL of the original; `None` means the image id is the key
        source_ref: Option<String>,
    },
    ImageResized {
        image_id: Option<String>,
    },
    Unknown {
        event_type: String,
    },
}

impl InboundEvent {
    pub fn from_payload(payload: Option<&[u8]>) -> Result<Self, EnvelopeError> {
        let payload = match payload {
            Some(p) if !p.is_empty() => p,
            _ => return Err(EnvelopeError::Empty),
        };

        let raw: RawEnvelope = serde_json::from_slice(payload)?;

        match raw.event_type.as_str() {
            "image_created" => {
                let image_id = match raw.image_id {
                    Some(serde_json::Value::String(id)) if !id.trim().is_empty() => id,
                    _ => {
                        return Err(EnvelopeError::MissingField {
                            event_type: EventType::ImageCreated.as_str(),
                            field: "image_id",
                        })
                    }
                };

                let source_ref = match raw.image_url {
                    Some(serde_json::Value::String(url)) if !url.trim().is_empty() => Some(url),
                    Some(serde_json::Value::String(_)) | Some(serde_json::Value::Null) | None => {
                        None
                    }
                    Some(_) => {
                        return Err(EnvelopeError::MissingField {
                            event_type: EventType::ImageCreated.as_str(),
                            field: "image_url",
                        })
                    }
                };

                Ok(InboundEvent::ImageCreated {
                    image_id,
                    source_ref,
                })
            }
            "image_resized" => Ok(InboundEvent::ImageResized {
                image_id: match raw.image_id {
                    Some(serde_json::Value::String(id)) => Some(id),
                    Some(other) if !other.is_null() => Some(other.to_string()),
                    _ => None,
                },
            }),
            _ => Ok(InboundEvent::Unknown {
                event_type: raw.event_type,
            }),
        }
    }

    pub fn image_id(&self) -> Option<&str> {
        match self {
            InboundEvent::ImageCreated { image_id, .. } => Some(image_id),
            InboundEvent::ImageResized { image_id } => image_id.as_deref(),
            InboundEvent::Unknown { .. } => None,
        }
    }
}

/// URL payload of a resized event: one URL per record or all variants at once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResizedUrls {
    One(String),
    Many(Vec<String>),
}

/// Announcement that resized variants of an image are available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub image_id: String,
    pub image_url: ResizedUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl OutboundEvent {
    /// One event listing every variant URL in variant order
    pub fn aggregate(image_id: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            event_type: EventType::ImageResized,
            image_id: image_id.into(),
            image_url: ResizedUrls::Many(urls),
            variant: None,
        }
    }

    /// One event for a single variant
    pub fn per_variant(
        image_id: impl Into<String>,
        variant: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            event_type: EventType::ImageResized,
            image_id: image_id.into(),
            image_url: ResizedUrls::One(url.into()),
            variant: Some(variant.into()),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialize(e.to_string()))
    }
}

/// Announcement that an original has been stored and awaits resizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCreatedEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub image_id: String,
    pub image_url: String,
}

impl ImageCreatedEvent {
    pub fn new(image_id: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            event_type: EventType::ImageCreated,
            image_id: image_id.into(),
            image_url: image_url.into(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialize(e.to_string()))
    }
}

/// Record written to the dead-letter topic for a permanently failed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub original_topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Original payload, lossily decoded as UTF-8
    pub payload: Option<String>,
    pub error: String,
    /// Epoch milliseconds
    pub failed_at: i64,
}
