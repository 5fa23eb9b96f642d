//! Point cloud processing stages.

pub mod background;
pub mod clipping;
pub mod clustering;
pub mod geometry;
pub mod tracking;
pub mod transform;

// Stage types used by the pipeline
pub use background::{BackgroundError, BackgroundExtractor, BackgroundSubtractor};
pub use clipping::Clipper;
pub use clustering::{Cluster, Clusterer};
pub use geometry::GeometryError;
pub use tracking::{Track, Tracker};
pub use transform::PlaneTransformer;
