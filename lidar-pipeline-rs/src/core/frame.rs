//! Frames (one full rotation of samples) and the assembler that builds them
//! from decoded firings.

use log::trace;

use super::packet::{Firing, ELEVATION_LUT, LASERS};
use super::points::PointArray;

/// Maximum number of samples a frame can hold.
pub const MAX_FRAME_SAMPLES: usize = 70_000;

/// One laser-channel return within one firing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub channel: u8,
    pub elevation_deg: f32,
    pub azimuth_deg: f32,
    pub range_m: f32,
    pub intensity: u8,
}

impl Sample {
    /// Spherical to Cartesian conversion. Azimuth is measured clockwise from
    /// +Y, elevation up from the XY plane.
    #[inline]
    pub fn to_cartesian(&self) -> [f32; 3] {
        let az = self.azimuth_deg.to_radians();
        let el = self.elevation_deg.to_radians();
        let horizontal = self.range_m * el.cos();
        [horizontal * az.sin(), horizontal * az.cos(), self.range_m * el.sin()]
    }
}

/// All samples spanning one rotation, stored column-wise.
///
/// Frames are immutable once built; the only way to grow one is through a
/// [`FrameBuilder`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    channel: Vec<u8>,
    elevation: Vec<f32>,
    azimuth: Vec<f32>,
    distance: Vec<f32>,
    intensity: Vec<u8>,
}

impl Frame {
    /// Build a frame from equally sized columns. Returns `None` when the
    /// column lengths disagree.
    pub fn from_columns(
        channel: Vec<u8>,
        elevation: Vec<f32>,
        azimuth: Vec<f32>,
        distance: Vec<f32>,
        intensity: Vec<u8>,
    ) -> Option<Self> {
        let n = channel.len();
        if elevation.len() != n || azimuth.len() != n || distance.len() != n || intensity.len() != n
        {
            return None;
        }
        Some(Self {
            channel,
            elevation,
            azimuth,
            distance,
            intensity,
        })
    }

    /// Returns the number of samples in the frame.
    #[inline]
    pub fn len(&self) -> usize {
        self.distance.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.distance.is_empty()
    }

    pub fn channels(&self) -> &[u8] {
        &self.channel
    }

    pub fn elevations(&self) -> &[f32] {
        &self.elevation
    }

    pub fn azimuths(&self) -> &[f32] {
        &self.azimuth
    }

    /// Range of every sample in meters.
    pub fn distances(&self) -> &[f32] {
        &self.distance
    }

    pub fn intensities(&self) -> &[u8] {
        &self.intensity
    }

    /// Sample at index `i`.
    pub fn sample(&self, i: usize) -> Option<Sample> {
        (i < self.len()).then(|| Sample {
            channel: self.channel[i],
            elevation_deg: self.elevation[i],
            azimuth_deg: self.azimuth[i],
            range_m: self.distance[i],
            intensity: self.intensity[i],
        })
    }

    pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
        (0..self.len()).filter_map(move |i| self.sample(i))
    }

    /// Cartesian points of every sample with a non-zero range.
    pub fn to_points(&self) -> PointArray {
        let mut points = PointArray::with_capacity(self.len());
        for sample in self.samples() {
            if sample.range_m > 0.0 {
                points.push(sample.to_cartesian());
            }
        }
        points
    }
}

/// Append-only accumulation of firings for the frame under construction.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    frame: Frame,
    capacity: usize,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::with_capacity(MAX_FRAME_SAMPLES)
    }

    /// Builder holding at most `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frame: Frame::default(),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// Append all channels of a firing. Returns false, leaving the builder
    /// unchanged, when the firing does not fit.
    pub fn append(&mut self, firing: &Firing) -> bool {
        if self.frame.len() + LASERS > self.capacity {
            return false;
        }

        let azimuth = firing.azimuth_deg();
        for channel in 0..LASERS {
            self.frame.channel.push(channel as u8);
            self.frame.elevation.push(ELEVATION_LUT[channel]);
            self.frame.azimuth.push(azimuth);
            self.frame.distance.push(firing.ranges_m[channel]);
            self.frame.intensity.push(firing.intensities[channel]);
        }
        true
    }

    /// Consume the builder, producing the immutable frame.
    pub fn finalize(mut self) -> Frame {
        self.frame.channel.shrink_to_fit();
        self.frame.elevation.shrink_to_fit();
        self.frame.azimuth.shrink_to_fit();
        self.frame.distance.shrink_to_fit();
        self.frame.intensity.shrink_to_fit();
        self.frame
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a stream of firings into frames at azimuth wraparound.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    current: FrameBuilder,
    last_azimuth: Option<u16>,
    capacity: usize,
    skipped: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_capacity(MAX_FRAME_SAMPLES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            current: FrameBuilder::with_capacity(capacity),
            last_azimuth: None,
            capacity,
            skipped: 0,
        }
    }

    /// Number of firings dropped because the frame under construction was full.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feed one firing. When its azimuth is below the last seen azimuth the
    /// accumulated frame is returned, stamped with `timestamp`, and the firing
    /// starts the next frame.
    pub fn push(&mut self, timestamp: f64, firing: &Firing) -> Option<(f64, Frame)> {
        let completed = match self.last_azimuth {
            Some(last) if firing.azimuth_raw < last => {
                let builder = std::mem::replace(
                    &mut self.current,
                    FrameBuilder::with_capacity(self.capacity),
                );
                Some((timestamp, builder.finalize()))
            }
            _ => None,
        };

        if !self.current.append(firing) {
            self.skipped += 1;
            trace!(
                "frame full at {} samples, skipping firing at azimuth {}",
                self.current.len(),
                firing.azimuth_raw
            );
        }
        self.last_azimuth = Some(firing.azimuth_raw);

        completed
    }

    /// Take the partial accumulation left at end of stream, if any.
    pub fn finish(&mut self, timestamp: f64) -> Option<(f64, Frame)> {
        if self.current.is_empty() {
            return None;
        }
        let builder = std::mem::replace(&mut self.current, FrameBuilder::with_capacity(self.capacity));
        Some((timestamp, builder.finalize()))
    }

    /// Forget all state, as if no firing had been seen.
    pub fn reset(&mut self) {
        self.current = FrameBuilder::with_capacity(self.capacity);
        self.last_azimuth = None;
        self.skipped = 0;
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
