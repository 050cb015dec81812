//! Resize services
//!
//! - `resizer`: CPU-bound variant generation
//! - `pipeline`: the consume, transform, store, publish, commit loop

pub mod pipeline;
pub mod resizer;

pub use pipeline::{
    CommitReason, MessageOutcome, PipelineConfig, ResizePipeline, Stage, WorkerStats,
};
pub use resizer::{ImageResizer, TransformError};
