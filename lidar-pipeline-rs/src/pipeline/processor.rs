//! Pipeline orchestrator.
//!
//! [`LidarProcessor`] owns the buffered frames and every optional stage, and
//! wires them in a fixed order:
//!
//! ```text
//! frame -> points -> transform -> clip -> subtract background -> cluster -> track
//! ```
//!
//! Multi-frame operations return a [`Progress`] iterator that performs one
//! frame of work per step.

use std::collections::BTreeMap;
use std::ops::{Range, RangeInclusive};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use super::progress::{CancelToken, FnTask, Progress, ProgressTask};
use crate::config::{
    BackgroundConfig, ClipperConfig, ClusteringConfig, ConfigError, ExtractorConfig,
    NearestNeighbourParams, PipelineConfig, PlaneParams, RangeImageParams,
    SubtractorConfig, TrackingConfig, TransformerConfig,
};
use crate::core::capture::{count_frames, open_frames, CaptureError, CaptureReader, FrameReader};
use crate::core::frame::Frame;
use crate::core::loaders::{load_background, LoaderError};
use crate::core::output::{FrameRecord, OutputError, OutputWriter};
use crate::core::points::{Point, PointArray};
use crate::core::writers::{write_background, WriteError};
use crate::processors::background::{BackgroundError, BackgroundExtractor, BackgroundSubtractor};
use crate::processors::clipping::Clipper;
use crate::processors::clustering::{Cluster, Clusterer};
use crate::processors::geometry::GeometryError;
use crate::processors::tracking::Tracker;
use crate::processors::transform::PlaneTransformer;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Background(#[from] BackgroundError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// A preprocessing stage mapping a point cloud to a point cloud.
pub trait PointStage {
    fn apply(&self, points: &PointArray) -> Result<PointArray>;
}

impl PointStage for PlaneTransformer {
    fn apply(&self, points: &PointArray) -> Result<PointArray> {
        Ok(self.transform(points))
    }
}

impl PointStage for Clipper {
    fn apply(&self, points: &PointArray) -> Result<PointArray> {
        Ok(self.clip(points))
    }
}

impl PointStage for BackgroundSubtractor {
    fn apply(&self, points: &PointArray) -> Result<PointArray> {
        Ok(self.subtract(points)?)
    }
}

/// Stages rebuilt from a configuration before being committed.
struct StagedConfig {
    transformer: Option<PlaneTransformer>,
    clipper: Option<Clipper>,
    extractor: Option<BackgroundExtractor>,
    background: Option<Frame>,
    background_path: Option<PathBuf>,
    subtractor: Option<BackgroundSubtractor>,
    clusterer: Option<Clusterer>,
    tracker: Option<Tracker>,
}

/// Owns buffered frames, their derived data and every pipeline stage.
#[derive(Default)]
pub struct LidarProcessor {
    capture: Option<PathBuf>,

    frames: Vec<Frame>,
    timestamps: Vec<f64>,
    frame_offset: usize,
    /// Preprocessed points per buffered frame
    points: Vec<PointArray>,
    clusters: Vec<Vec<Cluster>>,

    transformer: Option<PlaneTransformer>,
    clipper: Option<Clipper>,
    extractor: Option<BackgroundExtractor>,
    background: Option<Frame>,
    background_path: Option<PathBuf>,
    subtractor: Option<BackgroundSubtractor>,
    clusterer: Option<Clusterer>,
    tracker: Option<Tracker>,

    cancel: Option<CancelToken>,
}

impl LidarProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }

    /// Install a token checked before every step of every [`Progress`].
    pub fn set_cancel_token(&mut self, token: Option<CancelToken>) {
        self.cancel = token;
    }

    // -----------------------------------------------------------------------
    // Capture and buffer
    // -----------------------------------------------------------------------

    /// Select the capture file. Clears all buffered data.
    pub fn set_capture<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        CaptureReader::open(&path)?;
        info!("capture set to {}", path.display());
        self.capture = Some(path);
        self.clear_buffer();
        Ok(())
    }

    pub fn capture(&self) -> Option<&Path> {
        self.capture.as_deref()
    }

    fn capture_path(&self) -> Result<PathBuf> {
        self.capture
            .clone()
            .ok_or(PipelineError::NotConfigured("capture"))
    }

    /// Count the frames in the capture without decoding samples.
    pub fn peek_frame_count(&self) -> Result<usize> {
        Ok(count_frames(self.capture_path()?)?)
    }

    fn clear_buffer(&mut self) {
        self.frames.clear();
        self.timestamps.clear();
        self.points.clear();
        self.clusters.clear();
        self.frame_offset = 0;
    }

    /// Read the capture frames in `range` into the buffer, replacing its
    /// content. Buffered frames start unprocessed; stops quietly at the end of
    /// the capture.
    pub fn buffer_frames(&mut self, range: Range<usize>) -> Result<Progress<'_>> {
        let reader = open_frames(self.capture_path()?)?;
        self.clear_buffer();
        self.frame_offset = range.start;
        let total = range.len();
        let task = BufferTask {
            reader,
            next_index: 0,
            start: range.start,
            exhausted: false,
        };
        Ok(Progress::new(self, total, task))
    }

    /// Number of buffered frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Capture index of the first buffered frame.
    pub fn frame_offset(&self) -> usize {
        self.frame_offset
    }

    /// Buffered frame `i`, counted from the start of the buffer.
    pub fn frame(&self, i: usize) -> Option<&Frame> {
        self.frames.get(i)
    }

    /// Points of buffered frame `i` after the last preprocessing.
    pub fn points(&self, i: usize) -> Option<&PointArray> {
        self.points.get(i)
    }

    pub fn timestamp(&self, i: usize) -> Option<f64> {
        self.timestamps.get(i).copied()
    }

    /// Clusters of buffered frame `i`; empty when not clustered.
    pub fn clusters(&self, i: usize) -> &[Cluster] {
        self.clusters.get(i).map(Vec::as_slice).unwrap_or(&[])
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    pub fn transformer(&self) -> Option<&PlaneTransformer> {
        self.transformer.as_ref()
    }

    pub fn create_transformer(&mut self, config: &TransformerConfig) -> Result<()> {
        self.transformer = Some(build_transformer(config)?);
        info!("transformer created");
        self.invalidate_background();
        Ok(())
    }

    /// Fit the transformer plane through three points.
    pub fn fit_transformer(&mut self, points: [[f64; 3]; 3]) -> Result<()> {
        self.transformer = Some(PlaneTransformer::fit(points)?);
        info!("transformer fitted");
        self.invalidate_background();
        Ok(())
    }

    pub fn destroy_transformer(&mut self) {
        self.transformer = None;
        self.invalidate_background();
    }

    pub fn clipper(&self) -> Option<&Clipper> {
        self.clipper.as_ref()
    }

    pub fn create_clipper(&mut self, config: ClipperConfig) -> Result<()> {
        self.clipper = Some(Clipper::new(config)?);
        info!("clipper created");
        self.invalidate_background();
        Ok(())
    }

    pub fn destroy_clipper(&mut self) {
        self.clipper = None;
        self.invalidate_background();
    }

    pub fn background(&self) -> Option<&Frame> {
        self.background.as_ref()
    }

    /// File the background was last loaded from or saved to.
    pub fn background_path(&self) -> Option<&Path> {
        self.background_path.as_deref()
    }

    /// Extract the background from the buffered frames.
    pub fn extract_background(&mut self, params: RangeImageParams) -> Result<()> {
        let extractor = BackgroundExtractor::new(params);
        let background = extractor.extract(&self.frames)?;
        self.extractor = Some(extractor);
        self.background = Some(background);
        self.background_path = None;
        self.invalidate_background();
        Ok(())
    }

    /// Replace the background with one read from a table file. On failure the
    /// previous background is kept.
    pub fn load_background<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let background = load_background(path)?;
        info!("background loaded from {} ({} samples)", path.display(), background.len());
        self.background = Some(background);
        self.background_path = Some(path.to_path_buf());
        self.extractor = None;
        self.invalidate_background();
        Ok(())
    }

    pub fn save_background<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let background = self
            .background
            .as_ref()
            .ok_or(PipelineError::NotConfigured("background"))?;
        write_background(path, background)?;
        info!("background saved to {}", path.display());
        self.background_path = Some(path.to_path_buf());
        Ok(())
    }

    /// Drop the background together with the subtractor that depends on it.
    pub fn destroy_background(&mut self) {
        self.background = None;
        self.background_path = None;
        self.extractor = None;
        if self.subtractor.take().is_some() {
            info!("subtractor removed with the background");
        }
    }

    pub fn create_subtractor(&mut self, config: &SubtractorConfig) -> Result<()> {
        if self.background.is_none() {
            return Err(PipelineError::NotConfigured("background"));
        }
        self.subtractor = Some(build_subtractor(config)?);
        info!("background subtractor created");
        self.refresh_background()
    }

    pub fn destroy_subtractor(&mut self) {
        self.subtractor = None;
        self.background_path = None;
    }

    pub fn clusterer(&self) -> Option<&Clusterer> {
        self.clusterer.as_ref()
    }

    /// Replace the clusterer. Clusters of buffered frames are discarded.
    pub fn create_clusterer(&mut self, config: ClusteringConfig) -> Result<()> {
        self.clusterer = Some(Clusterer::new(config)?);
        self.clusters.clear();
        info!("clusterer created");
        Ok(())
    }

    pub fn destroy_clusterer(&mut self) {
        self.clusterer = None;
        self.clusters.clear();
    }

    pub fn tracker(&self) -> Option<&Tracker> {
        self.tracker.as_ref()
    }

    /// Install a fresh tracker; track ids restart from zero.
    pub fn create_tracker(&mut self, config: &TrackingConfig) {
        self.tracker = Some(build_tracker(config));
        info!("tracker created");
    }

    /// Drop the tracker and the ids it assigned.
    pub fn destroy_tracker(&mut self) {
        self.tracker = None;
        for cluster in self.clusters.iter_mut().flatten() {
            cluster.track_id = None;
        }
    }

    /// Which stages are currently enabled.
    pub fn status(&self) -> BTreeMap<&'static str, bool> {
        BTreeMap::from([
            ("transform", self.transformer.is_some()),
            ("clipping", self.clipper.is_some()),
            ("background_extraction", self.background.is_some()),
            ("background_subtraction", self.subtractor.is_some()),
            ("clustering", self.clusterer.is_some()),
            ("tracking", self.tracker.is_some()),
        ])
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Snapshot of the enabled stages as a configuration.
    pub fn config(&self) -> PipelineConfig {
        let background = BackgroundConfig {
            path: self.background_path.clone(),
            extractor: self
                .extractor
                .as_ref()
                .map(|e| ExtractorConfig::RangeImage(e.params().clone())),
            subtractor: self
                .subtractor
                .as_ref()
                .map(|s| SubtractorConfig::KdTree(s.params().clone())),
        };
        let has_background = background.path.is_some()
            || background.extractor.is_some()
            || background.subtractor.is_some();

        PipelineConfig {
            transformer: self.transformer.as_ref().map(|t| {
                TransformerConfig::ThreePointsPlane(PlaneParams {
                    normal: t.normal(),
                    intercept: t.intercept(),
                })
            }),
            clipper: self.clipper.as_ref().map(|c| c.config().clone()),
            background: has_background.then_some(background),
            clustering: self.clusterer.as_ref().map(|c| c.config().clone()),
            tracking: self.tracker.as_ref().map(|t| {
                TrackingConfig::NearestNeighbour(NearestNeighbourParams {
                    max_missing: t.max_missing(),
                })
            }),
        }
    }

    pub fn save_config<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.config().save(path)?;
        info!("configuration saved to {}", path.display());
        Ok(())
    }

    /// Load a configuration file and apply it.
    pub fn load_config<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let config = PipelineConfig::load(path)?;
        self.apply_config(&config)?;
        info!("configuration loaded from {}", path.display());
        Ok(())
    }

    /// Replace every stage with the ones described by `config`.
    ///
    /// All stages are built before any is installed, so a failure leaves the
    /// processor unchanged.
    pub fn apply_config(&mut self, config: &PipelineConfig) -> Result<()> {
        config.validate()?;
        let staged = self.stage_config(config)?;

        self.transformer = staged.transformer;
        self.clipper = staged.clipper;
        self.extractor = staged.extractor;
        self.background = staged.background;
        self.background_path = staged.background_path;
        self.subtractor = staged.subtractor;
        self.clusterer = staged.clusterer;
        self.tracker = staged.tracker;
        self.clusters.clear();
        self.refresh_background()
    }

    fn stage_config(&self, config: &PipelineConfig) -> Result<StagedConfig> {
        let transformer = config.transformer.as_ref().map(build_transformer).transpose()?;
        let clipper = config.clipper.clone().map(Clipper::new).transpose()?;

        let mut extractor = None;
        let mut background = None;
        let mut background_path = None;
        let mut subtractor = None;

        if let Some(bg) = &config.background {
            match &bg.path {
                Some(path) if path.exists() => {
                    background = Some(load_background(path)?);
                    background_path = Some(path.clone());
                }
                Some(path) => warn!("background file {} not found", path.display()),
                None => {}
            }

            if let Some(ExtractorConfig::RangeImage(params)) = &bg.extractor {
                let stage = BackgroundExtractor::new(params.clone());
                if background.is_none() {
                    match stage.extract(&self.frames) {
                        Ok(frame) => background = Some(frame),
                        Err(BackgroundError::NoFrames) => {
                            warn!("no buffered frames to extract the background from")
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                extractor = Some(stage);
            }

            if let Some(sub) = &bg.subtractor {
                if background.is_some() {
                    subtractor = Some(build_subtractor(sub)?);
                } else {
                    warn!("background subtractor skipped: no background available");
                }
            }
        }

        let clusterer = config.clustering.clone().map(Clusterer::new).transpose()?;
        let tracker = config.tracking.as_ref().map(build_tracker);

        Ok(StagedConfig {
            transformer,
            clipper,
            extractor,
            background,
            background_path,
            subtractor,
            clusterer,
            tracker,
        })
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    fn invalidate_background(&mut self) {
        if let Some(subtractor) = &mut self.subtractor {
            subtractor.invalidate();
        }
    }

    /// Rebuild the subtractor index from the background seen through the
    /// current transformer and clipper.
    fn refresh_background(&mut self) -> Result<()> {
        let needs_index = self.subtractor.as_ref().is_some_and(|s| !s.is_ready());
        if !needs_index {
            return Ok(());
        }
        let background = self
            .background
            .as_ref()
            .ok_or(PipelineError::NotConfigured("background"))?;

        let mut points = background.to_points();
        for stage in self.geometry_stages() {
            points = stage.apply(&points)?;
        }
        if let Some(subtractor) = &mut self.subtractor {
            subtractor.set_background(&points);
        }
        Ok(())
    }

    fn geometry_stages(&self) -> Vec<&dyn PointStage> {
        let mut stages: Vec<&dyn PointStage> = Vec::with_capacity(2);
        if let Some(t) = &self.transformer {
            stages.push(t);
        }
        if let Some(c) = &self.clipper {
            stages.push(c);
        }
        stages
    }

    fn point_stages(&self) -> Vec<&dyn PointStage> {
        let mut stages = self.geometry_stages();
        if let Some(s) = &self.subtractor {
            stages.push(s);
        }
        stages
    }

    /// Run the preprocessing stages over one frame.
    pub fn preprocess(&self, frame: &Frame) -> Result<PointArray> {
        let mut points = frame.to_points();
        for stage in self.point_stages() {
            points = stage.apply(&points)?;
        }
        Ok(points)
    }

    fn cluster_points(&self, points: &PointArray) -> Result<Vec<Cluster>> {
        let clusterer = self
            .clusterer
            .as_ref()
            .ok_or(PipelineError::NotConfigured("clustering"))?;
        Ok(clusterer.cluster(points))
    }

    /// Assign track ids to clusters of one frame.
    fn track(&mut self, clusters: &mut [Cluster]) -> Result<()> {
        let tracker = self
            .tracker
            .as_mut()
            .ok_or(PipelineError::NotConfigured("tracking"))?;
        let centroids: Vec<Point> = clusters.iter().map(|c| c.centroid).collect();
        let ids = tracker.update(&centroids);
        for (cluster, &id) in clusters.iter_mut().zip(ids) {
            cluster.track_id = Some(id);
        }
        Ok(())
    }

    /// Recompute the preprocessed points of every buffered frame.
    pub fn update_preprocessed(&mut self) -> Result<Progress<'_>> {
        self.refresh_background()?;
        let total = self.frames.len();
        let task = FnTask(|p: &mut LidarProcessor, i: usize| -> Result<()> {
            let points = p.preprocess(&p.frames[i])?;
            p.points[i] = points;
            Ok(())
        });
        Ok(Progress::new(self, total, task))
    }

    /// Cluster the preprocessed points of every buffered frame.
    pub fn extract_clusters(&mut self) -> Result<Progress<'_>> {
        if self.clusterer.is_none() {
            return Err(PipelineError::NotConfigured("clustering"));
        }
        let total = self.frames.len();
        self.clusters = vec![Vec::new(); total];
        let task = FnTask(|p: &mut LidarProcessor, i: usize| -> Result<()> {
            let clusters = p.cluster_points(&p.points[i])?;
            p.clusters[i] = clusters;
            Ok(())
        });
        Ok(Progress::new(self, total, task))
    }

    /// Track the clusters of every buffered frame from a restarted tracker.
    pub fn track_clusters(&mut self) -> Result<Progress<'_>> {
        if self.clusterer.is_none() {
            return Err(PipelineError::NotConfigured("clustering"));
        }
        let tracker = self
            .tracker
            .as_mut()
            .ok_or(PipelineError::NotConfigured("tracking"))?;
        tracker.restart();

        let total = self.clusters.len();
        let task = FnTask(|p: &mut LidarProcessor, i: usize| -> Result<()> {
            let mut clusters = std::mem::take(&mut p.clusters[i]);
            let tracked = p.track(&mut clusters);
            p.clusters[i] = clusters;
            tracked
        });
        Ok(Progress::new(self, total, task))
    }

    /// Preprocess, cluster and track every buffered frame in one pass.
    /// Clustering and tracking are skipped when not configured.
    pub fn update_processing(&mut self) -> Result<Progress<'_>> {
        self.refresh_background()?;
        if let Some(tracker) = &mut self.tracker {
            tracker.restart();
        }
        let total = self.frames.len();
        self.clusters = vec![Vec::new(); total];

        let task = FnTask(|p: &mut LidarProcessor, i: usize| -> Result<()> {
            let points = p.preprocess(&p.frames[i])?;
            if p.clusterer.is_some() {
                let mut clusters = p.cluster_points(&points)?;
                if p.tracker.is_some() {
                    p.track(&mut clusters)?;
                }
                p.clusters[i] = clusters;
            }
            p.points[i] = points;
            Ok(())
        });
        Ok(Progress::new(self, total, task))
    }

    /// Run the full pipeline over the capture frames in `frames` and write
    /// one record per frame. The capture is re-read from its start with a
    /// restarted tracker; the buffer is not touched. The writer is closed
    /// when the operation completes or is cancelled.
    pub fn write_output(
        &mut self,
        writer: OutputWriter,
        frames: RangeInclusive<usize>,
    ) -> Result<Progress<'_>> {
        if self.clusterer.is_none() {
            return Err(PipelineError::NotConfigured("clustering"));
        }
        let tracker = self
            .tracker
            .as_mut()
            .ok_or(PipelineError::NotConfigured("tracking"))?;
        tracker.restart();

        let reader = open_frames(self.capture_path()?)?;
        self.refresh_background()?;

        let (start, end) = frames.into_inner();
        let total = (end + 1).saturating_sub(start);
        let task = OutputTask {
            reader,
            writer: Some(writer),
            start,
            next_index: 0,
            exhausted: false,
        };
        Ok(Progress::new(self, total, task))
    }
}

fn build_transformer(config: &TransformerConfig) -> Result<PlaneTransformer> {
    match config {
        TransformerConfig::ThreePointsPlane(p) => {
            Ok(PlaneTransformer::from_coefficients(p.normal, p.intercept)?)
        }
    }
}

fn build_subtractor(config: &SubtractorConfig) -> Result<BackgroundSubtractor> {
    config.validate()?;
    match config {
        SubtractorConfig::KdTree(p) => Ok(BackgroundSubtractor::new(p.clone())),
    }
}

fn build_tracker(config: &TrackingConfig) -> Tracker {
    match config {
        TrackingConfig::NearestNeighbour(p) => Tracker::new(p),
    }
}

/// Advance `reader` until it yields capture frame `index`, skipping earlier
/// ones. Returns `None` at the end of the capture.
fn read_frame_at(
    reader: &mut FrameReader<CaptureReader>,
    next_index: &mut usize,
    index: usize,
) -> Result<Option<(f64, Frame)>> {
    for item in reader {
        let (timestamp, frame) = item?;
        let current = *next_index;
        *next_index += 1;
        if current == index {
            return Ok(Some((timestamp, frame)));
        }
    }
    Ok(None)
}

struct BufferTask {
    reader: FrameReader<CaptureReader>,
    next_index: usize,
    start: usize,
    exhausted: bool,
}

impl ProgressTask for BufferTask {
    fn step(&mut self, processor: &mut LidarProcessor, index: usize) -> Result<()> {
        if self.exhausted {
            return Ok(());
        }
        let target = self.start + index;
        match read_frame_at(&mut self.reader, &mut self.next_index, target)? {
            Some((timestamp, frame)) => {
                processor.points.push(frame.to_points());
                processor.timestamps.push(timestamp);
                processor.frames.push(frame);
            }
            None => {
                debug!("capture ended before frame {}", target);
                self.exhausted = true;
            }
        }
        Ok(())
    }

    fn finish(&mut self, processor: &mut LidarProcessor, _completed: bool) -> Result<()> {
        info!(
            "buffered {} frames from index {}",
            processor.frames.len(),
            processor.frame_offset
        );
        Ok(())
    }
}

struct OutputTask {
    reader: FrameReader<CaptureReader>,
    writer: Option<OutputWriter>,
    start: usize,
    next_index: usize,
    exhausted: bool,
}

impl ProgressTask for OutputTask {
    fn step(&mut self, processor: &mut LidarProcessor, index: usize) -> Result<()> {
        if self.exhausted {
            return Ok(());
        }
        let frame_number = self.start + index;
        let Some((timestamp, frame)) =
            read_frame_at(&mut self.reader, &mut self.next_index, frame_number)?
        else {
            debug!("capture ended before frame {}", frame_number);
            self.exhausted = true;
            return Ok(());
        };

        let points = processor.preprocess(&frame)?;
        let mut clusters = processor.cluster_points(&points)?;
        processor.track(&mut clusters)?;

        if let Some(writer) = &mut self.writer {
            writer.add(FrameRecord::new(frame_number, timestamp, &clusters))?;
        }
        Ok(())
    }

    fn finish(&mut self, _processor: &mut LidarProcessor, completed: bool) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let path = writer.path().to_path_buf();
            let written = writer.close()?;
            info!(
                "{} {} records to {}",
                if completed { "wrote" } else { "stopped early after" },
                written,
                path.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CartesianParams, DbscanParams, KdTreeParams};
    use crate::core::capture::test_support::{rotation_datagrams, write_pcap};
    use crate::core::output::OutputFormat;
    use std::fs;
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    /// A capture with three complete rotations of constant range.
    fn capture() -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        write_pcap(&path, &rotation_datagrams(3, 10, 2500));
        (dir, path)
    }

    fn dbscan() -> ClusteringConfig {
        ClusteringConfig::Dbscan(DbscanParams {
            search_radius: 0.05,
            min_samples: 2,
            is_xy: false,
        })
    }

    fn tracking() -> TrackingConfig {
        TrackingConfig::NearestNeighbour(NearestNeighbourParams { max_missing: 2 })
    }

    fn buffered(n: usize) -> (TempDir, LidarProcessor) {
        let (dir, path) = capture();
        let mut p = LidarProcessor::new();
        p.set_capture(&path).unwrap();
        p.buffer_frames(0..n).unwrap().run().unwrap();
        (dir, p)
    }

    #[test]
    fn test_peek_and_buffer() {
        let (dir, path) = capture();
        let mut p = LidarProcessor::new();
        assert!(matches!(
            p.peek_frame_count(),
            Err(PipelineError::NotConfigured("capture"))
        ));

        p.set_capture(&path).unwrap();
        assert_eq!(p.peek_frame_count().unwrap(), 3);

        let progress: Vec<f32> = p.buffer_frames(1..3).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(progress, vec![50.0, 100.0]);
        assert_eq!(p.len(), 2);
        assert_eq!(p.frame_offset(), 1);
        assert!(p.timestamp(0).unwrap() < p.timestamp(1).unwrap());
        assert_eq!(p.points(0).unwrap().len(), p.frame(0).unwrap().len());
        drop(dir);
    }

    #[test]
    fn test_buffer_past_end_of_capture() {
        let (_dir, p) = buffered(10);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn test_missing_capture() {
        let mut p = LidarProcessor::new();
        assert!(matches!(
            p.set_capture("/nonexistent/capture.pcap"),
            Err(PipelineError::Capture(_))
        ));
        assert!(p.buffer_frames(0..1).is_err());
    }

    #[test]
    fn test_status_reflects_stages() {
        let (_dir, mut p) = buffered(2);
        assert!(p.status().values().all(|&on| !on));

        p.create_clusterer(dbscan()).unwrap();
        p.create_tracker(&tracking());
        p.extract_background(RangeImageParams::default()).unwrap();
        let status = p.status();
        assert!(status["clustering"]);
        assert!(status["tracking"]);
        assert!(status["background_extraction"]);
        assert!(!status["background_subtraction"]);
        assert_eq!(status.len(), 6);
    }

    #[test]
    fn test_subtractor_requires_background() {
        let mut p = LidarProcessor::new();
        let config = SubtractorConfig::KdTree(KdTreeParams::default());
        assert!(matches!(
            p.create_subtractor(&config),
            Err(PipelineError::NotConfigured("background"))
        ));
    }

    #[test]
    fn test_background_subtraction_removes_static_scene() {
        let (_dir, mut p) = buffered(3);
        p.extract_background(RangeImageParams::default()).unwrap();
        p.create_subtractor(&SubtractorConfig::KdTree(KdTreeParams::default()))
            .unwrap();
        p.update_preprocessed().unwrap().run().unwrap();
        for i in 0..p.len() {
            assert!(p.points(i).unwrap().is_empty());
        }

        // Changing an upstream stage rebuilds the index on next use.
        p.create_clipper(ClipperConfig::Cartesian(CartesianParams {
            x_range: [-100.0, 100.0],
            y_range: [-100.0, 100.0],
            z_range: [-100.0, 100.0],
            inverse: false,
        }))
        .unwrap();
        p.update_preprocessed().unwrap().run().unwrap();
        assert!(p.points(0).unwrap().is_empty());

        p.destroy_background();
        assert!(!p.status()["background_subtraction"]);
    }

    #[test]
    fn test_stale_background_index_is_not_used() {
        let (_dir, mut p) = buffered(2);
        p.extract_background(RangeImageParams::default()).unwrap();
        p.create_subtractor(&SubtractorConfig::KdTree(KdTreeParams::default()))
            .unwrap();
        p.update_preprocessed().unwrap().run().unwrap();

        p.create_clipper(ClipperConfig::Cartesian(CartesianParams {
            x_range: [-100.0, 100.0],
            y_range: [-100.0, 100.0],
            z_range: [-100.0, 100.0],
            inverse: false,
        }))
        .unwrap();

        // Until rebuilt, the index no longer matches the clipped background.
        let frame = p.frame(0).unwrap().clone();
        assert!(matches!(
            p.preprocess(&frame),
            Err(PipelineError::Background(BackgroundError::BackgroundNotReady))
        ));

        p.update_preprocessed().unwrap().run().unwrap();
        assert!(p.points(0).unwrap().is_empty());
        assert!(p.preprocess(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_clustering_and_tracking() {
        let (_dir, mut p) = buffered(3);
        assert!(matches!(
            p.extract_clusters(),
            Err(PipelineError::NotConfigured("clustering"))
        ));

        p.create_clusterer(dbscan()).unwrap();
        p.extract_clusters().unwrap().run().unwrap();
        assert!(!p.clusters(0).is_empty());
        assert!(p.clusters(0).iter().all(|c| c.track_id.is_none()));

        assert!(matches!(
            p.track_clusters(),
            Err(PipelineError::NotConfigured("tracking"))
        ));
        p.create_tracker(&tracking());
        p.track_clusters().unwrap().run().unwrap();

        // Identical rotations keep every id.
        let ids = |p: &LidarProcessor, i: usize| {
            let mut ids: Vec<u64> = p.clusters(i).iter().filter_map(|c| c.track_id).collect();
            ids.sort_unstable();
            ids
        };
        assert_eq!(ids(&p, 0).len(), p.clusters(0).len());
        assert_eq!(ids(&p, 0), ids(&p, 2));

        p.destroy_tracker();
        assert!(p.clusters(1).iter().all(|c| c.track_id.is_none()));
    }

    #[test]
    fn test_update_processing_matches_stepwise() {
        let (_dir, mut p) = buffered(2);
        p.create_clusterer(dbscan()).unwrap();
        p.create_tracker(&tracking());

        p.update_processing().unwrap().run().unwrap();
        let combined: Vec<Vec<Cluster>> = (0..2).map(|i| p.clusters(i).to_vec()).collect();

        p.update_preprocessed().unwrap().run().unwrap();
        p.extract_clusters().unwrap().run().unwrap();
        p.track_clusters().unwrap().run().unwrap();
        let stepwise: Vec<Vec<Cluster>> = (0..2).map(|i| p.clusters(i).to_vec()).collect();

        assert_eq!(combined, stepwise);
    }

    #[test]
    fn test_cancelled_processing_keeps_completed_work() {
        let (_dir, mut p) = buffered(3);
        p.create_clusterer(dbscan()).unwrap();
        let token = CancelToken::new();
        p.set_cancel_token(Some(token.clone()));

        let mut progress = p.extract_clusters().unwrap();
        assert!(progress.next().unwrap().is_ok());
        token.cancel();
        assert!(matches!(progress.next(), Some(Err(PipelineError::Cancelled))));
        drop(progress);

        assert!(!p.clusters(0).is_empty());
        assert!(p.clusters(1).is_empty());
    }

    #[test]
    fn test_write_output_range() {
        let (dir, path) = capture();
        let mut p = LidarProcessor::new();
        p.set_capture(&path).unwrap();
        p.create_clusterer(dbscan()).unwrap();

        let out = dir.path().join("out/objects.json");
        let writer = OutputWriter::create(&out, OutputFormat::Json, 10).unwrap();
        assert!(matches!(
            p.write_output(writer, 1..=2),
            Err(PipelineError::NotConfigured("tracking"))
        ));

        p.create_tracker(&tracking());
        let writer = OutputWriter::create(&out, OutputFormat::Json, 10).unwrap();
        let steps = p.write_output(writer, 1..=2).unwrap().count();
        assert_eq!(steps, 2);
        assert!(p.is_empty());

        let content = fs::read_to_string(&out).unwrap();
        let records: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["frame_number"], 1);
        assert_eq!(records[1]["frame_number"], 2);
        assert!(records[0]["objects"][0]["id"].is_u64());
    }

    fn json_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_abandoned_write_output_keeps_records() {
        let (dir, path) = capture();
        let mut p = LidarProcessor::new();
        p.set_capture(&path).unwrap();
        p.create_clusterer(dbscan()).unwrap();
        p.create_tracker(&tracking());

        let out = dir.path().join("partial.json");
        let writer = OutputWriter::create(&out, OutputFormat::Json, 10).unwrap();
        let mut progress = p.write_output(writer, 0..=2).unwrap();
        assert!(progress.next().unwrap().is_ok());
        assert!(progress.next().unwrap().is_ok());
        drop(progress);

        let records = json_lines(&out);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["frame_number"], 1);
    }

    #[test]
    fn test_failed_write_output_keeps_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("damaged.pcap");
        write_pcap(&path, &rotation_datagrams(3, 10, 2500));
        // Trailing record header promising a full packet, cut short.
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        for field in [1u32, 0, 1248, 1248] {
            file.write_all(&field.to_le_bytes()).unwrap();
        }
        file.write_all(&[0xff; 16]).unwrap();
        drop(file);

        let mut p = LidarProcessor::new();
        p.set_capture(&path).unwrap();
        p.create_clusterer(dbscan()).unwrap();
        p.create_tracker(&tracking());

        let out = dir.path().join("objects.json");
        let writer = OutputWriter::create(&out, OutputFormat::Json, 10).unwrap();
        let results: Vec<Result<f32>> = p.write_output(writer, 0..=4).unwrap().collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert!(matches!(results.last(), Some(Err(PipelineError::Capture(_)))));

        let records = json_lines(&out);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2]["frame_number"], 2);
    }

    #[test]
    fn test_config_round_trip() {
        let (dir, mut p) = buffered(2);
        p.fit_transformer([[0.0, 0.0, -1.5], [1.0, 0.0, -1.5], [0.0, 1.0, -1.5]])
            .unwrap();
        p.extract_background(RangeImageParams::default()).unwrap();
        let bg_path = dir.path().join("background.txt");
        p.save_background(&bg_path).unwrap();
        p.create_subtractor(&SubtractorConfig::KdTree(KdTreeParams { search_radius: 0.2 }))
            .unwrap();
        p.create_clusterer(dbscan()).unwrap();
        p.create_tracker(&tracking());

        let config_path = dir.path().join("project.json");
        p.save_config(&config_path).unwrap();

        let mut restored = LidarProcessor::new();
        restored.load_config(&config_path).unwrap();
        assert_eq!(restored.status(), p.status());
        assert_eq!(restored.config(), p.config());
        assert_eq!(restored.background_path(), Some(bg_path.as_path()));
        assert_eq!(restored.background().unwrap().len(), p.background().unwrap().len());
    }

    #[test]
    fn test_failed_config_load_leaves_stages() {
        let dir = tempdir().unwrap();
        let mut p = LidarProcessor::new();
        p.create_clusterer(dbscan()).unwrap();

        let path = dir.path().join("broken.json");
        fs::write(
            &path,
            r#"{"clipper": {"method": "polygon", "params": {"polygon": [[0, 0], [1, 1]]}}}"#,
        )
        .unwrap();
        assert!(p.load_config(&path).is_err());
        assert!(p.status()["clustering"]);
        assert!(!p.status()["clipping"]);
    }

    #[test]
    fn test_missing_background_file_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("project.json");
        fs::write(
            &path,
            r#"{"background": {"path": "/nonexistent/bg.txt",
                "subtractor": {"method": "kd_tree", "params": {"search_radius": 0.1}}}}"#,
        )
        .unwrap();

        let mut p = LidarProcessor::new();
        p.load_config(&path).unwrap();
        assert!(!p.status()["background_extraction"]);
        assert!(!p.status()["background_subtraction"]);
    }
}
