//! Background model: extraction of a static reference frame from a run of
//! frames, and subtraction of that reference from live point clouds.
//!
//! Extraction works on range images: every frame is viewed as a
//! `rows × 32` grid of ranges (one column per laser channel), the stack of
//! grids is reduced per pixel to a range percentile, and pixels that rarely
//! return anything are cleared.

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use log::{debug, info};
use thiserror::Error;

use crate::config::{KdTreeParams, RangeImageParams};
use crate::core::frame::Frame;
use crate::core::packet::LASERS;
use crate::core::points::PointArray;

/// Percentile of frame heights used as the common range image height.
const HEIGHT_PERCENTILE: f64 = 0.05;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackgroundError {
    #[error("no frames available for background extraction")]
    NoFrames,

    #[error("background not ready: set a background before subtracting")]
    BackgroundNotReady,
}

/// Result type for background operations.
pub type Result<T> = std::result::Result<T, BackgroundError>;

/// Percentile of `values` with linear interpolation between closest ranks.
/// `q` is a fraction in `0..=1`. Sorts `values` in place.
pub fn percentile_linear(values: &mut [f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);

    let pos = q.clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Some(values[lower] + (values[upper] - values[lower]) * frac)
}

/// Builds a background frame from a run of frames.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundExtractor {
    params: RangeImageParams,
}

impl BackgroundExtractor {
    pub fn new(params: RangeImageParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RangeImageParams {
        &self.params
    }

    /// Extract the background from the first `n_frames` of `frames`.
    ///
    /// # Errors
    ///
    /// Returns [`BackgroundError::NoFrames`] when `frames` is empty.
    pub fn extract(&self, frames: &[Frame]) -> Result<Frame> {
        let frames = &frames[..frames.len().min(self.params.n_frames)];
        if frames.is_empty() {
            return Err(BackgroundError::NoFrames);
        }

        let mut heights: Vec<f64> = frames.iter().map(|f| (f.len() / LASERS) as f64).collect();
        let height = percentile_linear(&mut heights, HEIGHT_PERCENTILE)
            .map(|h| h.floor() as usize)
            .unwrap_or(0);

        let stack: Vec<&[f32]> = frames
            .iter()
            .filter(|f| f.len() / LASERS >= height)
            .map(|f| &f.distances()[..height * LASERS])
            .collect();
        let Some(first) = frames.iter().find(|f| f.len() / LASERS >= height) else {
            return Err(BackgroundError::NoFrames);
        };
        debug!(
            "range image height {} from {} frames, {} stacked",
            height,
            frames.len(),
            stack.len()
        );

        let pixels = height * LASERS;
        let min_returns = self.params.non_zero as f64 * frames.len() as f64;
        let mut column = Vec::with_capacity(stack.len());
        let mut distance = Vec::with_capacity(pixels);
        let mut cleared = 0usize;

        for px in 0..pixels {
            column.clear();
            column.extend(stack.iter().map(|img| img[px] as f64));

            let returns = column.iter().filter(|&&r| r != 0.0).count();
            if (returns as f64) < min_returns {
                distance.push(0.0);
                cleared += 1;
                continue;
            }
            let value = percentile_linear(&mut column, self.params.percentile as f64).unwrap_or(0.0);
            distance.push(value as f32);
        }

        info!(
            "extracted background: {} samples, {} cleared for missing returns",
            pixels, cleared
        );

        Frame::from_columns(
            first.channels()[..pixels].to_vec(),
            first.elevations()[..pixels].to_vec(),
            first.azimuths()[..pixels].to_vec(),
            distance,
            first.intensities()[..pixels].to_vec(),
        )
        .ok_or(BackgroundError::NoFrames)
    }
}

/// Removes points lying near a background cloud.
pub struct BackgroundSubtractor {
    params: KdTreeParams,
    index: Option<BackgroundIndex>,
}

/// Spatial index over the background points. An empty background keeps no
/// tree, so nothing is ever matched.
enum BackgroundIndex {
    Empty,
    Tree(ImmutableKdTree<f32, 3>),
}

impl BackgroundSubtractor {
    pub fn new(params: KdTreeParams) -> Self {
        Self {
            params,
            index: None,
        }
    }

    pub fn params(&self) -> &KdTreeParams {
        &self.params
    }

    /// Whether a background index is in place.
    pub fn is_ready(&self) -> bool {
        self.index.is_some()
    }

    /// Index `background` for subsequent subtractions.
    pub fn set_background(&mut self, background: &PointArray) {
        self.index = Some(if background.is_empty() {
            BackgroundIndex::Empty
        } else {
            BackgroundIndex::Tree(ImmutableKdTree::new_from_slice(background.as_slice()))
        });
        debug!("background index built over {} points", background.len());
    }

    /// Drop the index; it must be set again before the next subtraction.
    pub fn invalidate(&mut self) {
        self.index = None;
    }

    /// Keep the points with no background point within `search_radius`.
    ///
    /// # Errors
    ///
    /// Returns [`BackgroundError::BackgroundNotReady`] without an index.
    pub fn subtract(&self, points: &PointArray) -> Result<PointArray> {
        let tree = match &self.index {
            None => return Err(BackgroundError::BackgroundNotReady),
            Some(BackgroundIndex::Empty) => return Ok(points.clone()),
            Some(BackgroundIndex::Tree(tree)) => tree,
        };

        let radius_sq = self.params.search_radius * self.params.search_radius;
        Ok(points
            .iter()
            .filter(|p| tree.nearest_one::<SquaredEuclidean>(p).distance > radius_sq)
            .copied()
            .collect())
    }
}
