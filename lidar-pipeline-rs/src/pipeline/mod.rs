//! Frame buffering and stage orchestration.

pub mod processor;
pub mod progress;

pub use processor::{LidarProcessor, PipelineError, PointStage};
pub use progress::{CancelToken, Progress, ProgressTask};
