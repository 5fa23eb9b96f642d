//! Project configuration for the LIDAR pipeline.
//!
//! Every stage is optional; an absent key means the stage is disabled. Stage
//! entries use the `{ "method": ..., "params": {...} }` shape on disk.
//!
//! ```json
//! {
//!   "clipper": {
//!     "method": "polygon",
//!     "params": { "polygon": [[0, 0], [10, 0], [10, 10]], "z_range": [-1, 3], "inverse": false }
//!   },
//!   "tracking": { "method": "nearest_neighbour", "params": { "max_missing": 50 } }
//! }
//! ```
//!
//! Files ending in `.yaml` or `.yml` use the same schema in YAML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while reading, writing or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid YAML in '{path}': {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid {stage} parameters: {message}")]
    Invalid {
        stage: &'static str,
        message: String,
    },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

fn invalid(stage: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        stage,
        message: message.into(),
    }
}

fn check_range(stage: &'static str, name: &str, range: [f32; 2]) -> Result<()> {
    if !range[0].is_finite() || !range[1].is_finite() {
        return Err(invalid(stage, format!("{} must be finite", name)));
    }
    if range[0] > range[1] {
        return Err(invalid(
            stage,
            format!("{} minimum {} exceeds maximum {}", name, range[0], range[1]),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Transformer
// ---------------------------------------------------------------------------

/// Coordinate re-leveling stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum TransformerConfig {
    /// Plane `normal · p + intercept = 0` fitted through three points.
    #[serde(rename = "3_points_plane")]
    ThreePointsPlane(PlaneParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaneParams {
    pub normal: [f64; 3],
    pub intercept: f64,
}

impl TransformerConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            TransformerConfig::ThreePointsPlane(p) => {
                let norm_sq: f64 = p.normal.iter().map(|v| v * v).sum();
                if !norm_sq.is_finite() || norm_sq == 0.0 {
                    return Err(invalid("transformer", "normal must be finite and non-zero"));
                }
                if !p.intercept.is_finite() {
                    return Err(invalid("transformer", "intercept must be finite"));
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Clipper
// ---------------------------------------------------------------------------

/// Spatial clipping stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum ClipperConfig {
    /// Keep points inside an XY polygon and a Z band.
    #[serde(rename = "polygon")]
    Polygon(PolygonParams),

    /// Keep points inside an axis-aligned box.
    #[serde(rename = "cartesian")]
    Cartesian(CartesianParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonParams {
    /// Polygon vertices in the XY plane
    pub polygon: Vec<[f32; 2]>,

    /// Inclusive Z band; equal bounds disable the Z test
    #[serde(default)]
    pub z_range: [f32; 2],

    /// Keep the points outside instead of inside
    #[serde(default)]
    pub inverse: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartesianParams {
    pub x_range: [f32; 2],
    pub y_range: [f32; 2],
    pub z_range: [f32; 2],

    #[serde(default)]
    pub inverse: bool,
}

impl ClipperConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ClipperConfig::Polygon(p) => {
                if p.polygon.len() < 3 {
                    return Err(invalid(
                        "clipper",
                        format!("polygon needs at least 3 vertices, got {}", p.polygon.len()),
                    ));
                }
                if p.polygon.iter().flatten().any(|v| !v.is_finite()) {
                    return Err(invalid("clipper", "polygon vertices must be finite"));
                }
                check_range("clipper", "z_range", p.z_range)
            }
            ClipperConfig::Cartesian(p) => {
                check_range("clipper", "x_range", p.x_range)?;
                check_range("clipper", "y_range", p.y_range)?;
                check_range("clipper", "z_range", p.z_range)
            }
        }
    }

    pub fn inverse(&self) -> bool {
        match self {
            ClipperConfig::Polygon(p) => p.inverse,
            ClipperConfig::Cartesian(p) => p.inverse,
        }
    }
}

// ---------------------------------------------------------------------------
// Background
// ---------------------------------------------------------------------------

/// Background model: optional stored reference, extractor and subtractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Background table the reference frame was saved to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor: Option<ExtractorConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtractor: Option<SubtractorConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum ExtractorConfig {
    #[serde(rename = "range_image")]
    RangeImage(RangeImageParams),
}

/// Parameters of range-image background extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeImageParams {
    /// Per-pixel range percentile as a fraction (0..=1)
    #[serde(default = "default_percentile")]
    pub percentile: f32,

    /// Minimum fraction of frames with a return for a pixel to be kept
    #[serde(default = "default_non_zero")]
    pub non_zero: f32,

    /// Number of leading frames to use
    #[serde(default = "default_n_frames")]
    pub n_frames: usize,
}

fn default_percentile() -> f32 {
    0.8
}

fn default_non_zero() -> f32 {
    0.7
}

fn default_n_frames() -> usize {
    100
}

impl Default for RangeImageParams {
    fn default() -> Self {
        Self {
            percentile: default_percentile(),
            non_zero: default_non_zero(),
            n_frames: default_n_frames(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum SubtractorConfig {
    #[serde(rename = "kd_tree", alias = "kd-tree")]
    KdTree(KdTreeParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KdTreeParams {
    /// Points closer than this to the background are removed
    #[serde(default = "default_subtract_radius")]
    pub search_radius: f32,
}

fn default_subtract_radius() -> f32 {
    0.1
}

impl Default for KdTreeParams {
    fn default() -> Self {
        Self {
            search_radius: default_subtract_radius(),
        }
    }
}

impl ExtractorConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ExtractorConfig::RangeImage(p) => {
                if !(0.0..=1.0).contains(&p.percentile) {
                    return Err(invalid("extractor", "percentile must be within 0..=1"));
                }
                if !(0.0..=1.0).contains(&p.non_zero) {
                    return Err(invalid("extractor", "non_zero must be within 0..=1"));
                }
                if p.n_frames == 0 {
                    return Err(invalid("extractor", "n_frames must be at least 1"));
                }
                Ok(())
            }
        }
    }
}

impl SubtractorConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            SubtractorConfig::KdTree(p) => check_radius("subtractor", p.search_radius),
        }
    }
}

impl BackgroundConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(extractor) = &self.extractor {
            extractor.validate()?;
        }
        if let Some(subtractor) = &self.subtractor {
            subtractor.validate()?;
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.path.is_none() && self.extractor.is_none() && self.subtractor.is_none()
    }
}

fn check_radius(stage: &'static str, radius: f32) -> Result<()> {
    if !radius.is_finite() || radius <= 0.0 {
        return Err(invalid(stage, format!("search_radius must be positive, got {}", radius)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

/// Object clustering stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum ClusteringConfig {
    /// Agglomerative clustering cut at a distance threshold.
    #[serde(rename = "naive")]
    Naive(NaiveParams),

    /// Density-based clustering.
    #[serde(rename = "dbscan")]
    Dbscan(DbscanParams),
}

/// Inter-cluster distance used by hierarchical clustering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    #[default]
    Single,
    Complete,
    Average,
    /// Minimum increase of within-cluster variance
    Ward,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaiveParams {
    /// Distance threshold at which the hierarchy is cut
    #[serde(default = "default_cluster_radius")]
    pub search_radius: f32,

    #[serde(default)]
    pub linkage: Linkage,

    /// Cluster on the XY projection
    #[serde(default = "default_is_xy")]
    pub is_xy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbscanParams {
    /// Neighborhood radius
    #[serde(default = "default_cluster_radius")]
    pub search_radius: f32,

    /// Minimum neighborhood size (including the point) of a core point
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_is_xy")]
    pub is_xy: bool,
}

fn default_cluster_radius() -> f32 {
    0.5
}

fn default_min_samples() -> usize {
    30
}

fn default_is_xy() -> bool {
    true
}

impl Default for NaiveParams {
    fn default() -> Self {
        Self {
            search_radius: default_cluster_radius(),
            linkage: Linkage::default(),
            is_xy: default_is_xy(),
        }
    }
}

impl Default for DbscanParams {
    fn default() -> Self {
        Self {
            search_radius: default_cluster_radius(),
            min_samples: default_min_samples(),
            is_xy: default_is_xy(),
        }
    }
}

impl ClusteringConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ClusteringConfig::Naive(p) => check_radius("clustering", p.search_radius),
            ClusteringConfig::Dbscan(p) => {
                check_radius("clustering", p.search_radius)?;
                if p.min_samples == 0 {
                    return Err(invalid("clustering", "min_samples must be at least 1"));
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tracking
// ---------------------------------------------------------------------------

/// Object tracking stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum TrackingConfig {
    #[serde(rename = "nearest_neighbour", alias = "nearest_neigbour")]
    NearestNeighbour(NearestNeighbourParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestNeighbourParams {
    /// Consecutive empty frames a track survives
    #[serde(default = "default_max_missing")]
    pub max_missing: u32,
}

fn default_max_missing() -> u32 {
    50
}

impl Default for NearestNeighbourParams {
    fn default() -> Self {
        Self {
            max_missing: default_max_missing(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// On-disk encoding of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Pick the format from the file extension; anything but `.yaml`/`.yml`
    /// is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Json,
        }
    }
}

/// Complete pipeline configuration: one optional entry per stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer: Option<TransformerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipper: Option<ClipperConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<BackgroundConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clustering: Option<ClusteringConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<TrackingConfig>,
}

impl PipelineConfig {
    /// Validate every present stage.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = &self.transformer {
            t.validate()?;
        }
        if let Some(c) = &self.clipper {
            c.validate()?;
        }
        if let Some(b) = &self.background {
            b.validate()?;
        }
        if let Some(c) = &self.clustering {
            c.validate()?;
        }
        // Tracking has no invalid settings.
        Ok(())
    }

    /// Parse a configuration from text in the given format.
    pub fn parse(content: &str, format: ConfigFormat, path: &Path) -> Result<Self> {
        let mut config: PipelineConfig = match format {
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| ConfigError::Json {
                path: path.to_path_buf(),
                source: e,
            })?,
            ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| ConfigError::Yaml {
                path: path.to_path_buf(),
                source: e,
            })?,
        };
        if config.background.as_ref().is_some_and(BackgroundConfig::is_empty) {
            config.background = None;
        }
        Ok(config)
    }

    /// Serialize to text in the given format.
    pub fn render(&self, format: ConfigFormat, path: &Path) -> Result<String> {
        match format {
            ConfigFormat::Json => {
                serde_json::to_string_pretty(self).map_err(|e| ConfigError::Json {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(|e| ConfigError::Yaml {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::parse(&content, ConfigFormat::from_path(path), path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration. The file is written to a temporary sibling
    /// first and renamed over the target, so a failed save leaves any
    /// previous file untouched.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = self.render(ConfigFormat::from_path(path), path)?;

        let write_err = |e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        fs::write(&tmp_path, content).map_err(write_err)?;
        fs::rename(&tmp_path, path).map_err(write_err)?;
        Ok(())
    }
}
