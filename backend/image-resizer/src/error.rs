//! Error types for the image resizer
//!
//! Per-message errors are classified into a `Disposition` that decides
//! whether the inbound offset is committed (skip) or left for redelivery.

use crate::kafka::{BusError, EnvelopeError};
use crate::services::resizer::TransformError;
use crate::storage::StorageError;

/// Result type for image-resizer operations
pub type Result<T> = std::result::Result<T, ResizerError>;

#[derive(Debug, thiserror::Error)]
pub enum ResizerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// What to do with a message whose processing failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient failure: leave the offset uncommitted and redeliver
    Retry,
    /// Permanent failure: commit the offset and move on
    Skip,
}

impl ResizerError {
    pub fn disposition(&self) -> Disposition {
        match self {
            ResizerError::Envelope(_) => Disposition::Skip,
            ResizerError::Transform(TransformError::Task(_)) => Disposition::Retry,
            ResizerError::Transform(_) => Disposition::Skip,
            ResizerError::Storage(_) | ResizerError::Bus(_) => Disposition::Retry,
            ResizerError::Config(_) => Disposition::Retry,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == Disposition::Retry
    }
}
