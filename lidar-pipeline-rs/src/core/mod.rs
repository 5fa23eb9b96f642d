//! Core data types and I/O: sensor packets, frames, captures, background
//! tables and output records.

pub mod capture;
pub mod frame;
pub mod loaders;
pub mod output;
pub mod packet;
pub mod points;
pub mod writers;

pub use capture::{count_frames, open_frames, CaptureError, CaptureReader, Datagram, FrameReader};
pub use frame::{Frame, FrameAssembler, Sample, MAX_FRAME_SAMPLES};
pub use loaders::{load_background, LoaderError};
pub use output::{FrameRecord, ObjectRecord, OutputError, OutputFormat, OutputWriter};
pub use packet::{Firing, Packet};
pub use points::{Point, PointArray};
pub use writers::{write_background, WriteError};
