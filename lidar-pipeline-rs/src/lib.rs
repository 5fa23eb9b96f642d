//! LIDAR capture processing and object tracking pipeline.
//!
//! Building blocks:
//! - Decoding 32-channel spinning LIDAR datagrams from pcap captures into frames
//! - Re-leveling point clouds onto a fitted ground plane and clipping them
//! - Extracting a static background and subtracting it from live frames
//! - Clustering foreground points into objects with oriented bounding boxes
//! - Tracking objects across frames and writing JSON or CSV records
//!
//! # Example
//!
//! ```no_run
//! use lidar_pipeline::pipeline::LidarProcessor;
//!
//! let mut processor = LidarProcessor::new();
//! processor.set_capture("capture.pcap").unwrap();
//! processor.load_config("project.json").unwrap();
//! processor.buffer_frames(0..10).unwrap().run().unwrap();
//! processor.update_processing().unwrap().run().unwrap();
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod pipeline;
pub mod processors;

pub use config::{ClipperConfig, ClusteringConfig, PipelineConfig, TrackingConfig, TransformerConfig};
pub use core::{Frame, OutputFormat, OutputWriter, PointArray};
pub use pipeline::{CancelToken, LidarProcessor, PipelineError, Progress};

/// Version from Cargo metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
