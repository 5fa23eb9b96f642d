//! Spatial clipping of point clouds by polygon or axis-aligned box.

use super::geometry::{point_in_polygon, GeometryError, Result};
use crate::config::ClipperConfig;
use crate::core::points::{Point, PointArray};

#[inline]
fn within(value: f32, range: [f32; 2]) -> bool {
    range[0] <= value && value <= range[1]
}

/// Keeps the points inside (or, inverted, outside) a region.
#[derive(Debug, Clone, PartialEq)]
pub struct Clipper {
    config: ClipperConfig,
}

impl Clipper {
    /// Build a clipper from its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::DegeneratePolygon`] for a polygon with fewer
    /// than three vertices.
    pub fn new(config: ClipperConfig) -> Result<Self> {
        match &config {
            ClipperConfig::Polygon(p) => {
                if p.polygon.len() < 3 {
                    return Err(GeometryError::DegeneratePolygon(p.polygon.len()));
                }
                if p.polygon.iter().flatten().any(|v| !v.is_finite()) {
                    return Err(GeometryError::NonFinite("clip polygon"));
                }
            }
            ClipperConfig::Cartesian(p) => {
                if [p.x_range, p.y_range, p.z_range]
                    .iter()
                    .flatten()
                    .any(|v| !v.is_finite())
                {
                    return Err(GeometryError::NonFinite("clip box"));
                }
            }
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClipperConfig {
        &self.config
    }

    /// Whether a point lies inside the region, ignoring `inverse`.
    pub fn contains(&self, p: &Point) -> bool {
        match &self.config {
            ClipperConfig::Polygon(c) => {
                let z_ok = c.z_range[0] == c.z_range[1] || within(p[2], c.z_range);
                z_ok && point_in_polygon(p[0], p[1], &c.polygon)
            }
            ClipperConfig::Cartesian(c) => {
                within(p[0], c.x_range) && within(p[1], c.y_range) && within(p[2], c.z_range)
            }
        }
    }

    /// Per-point keep mask with `inverse` applied.
    pub fn mask(&self, points: &PointArray) -> Vec<bool> {
        let inverse = self.config.inverse();
        points.iter().map(|p| self.contains(p) != inverse).collect()
    }

    /// Return the kept points as a new array.
    pub fn clip(&self, points: &PointArray) -> PointArray {
        points.select(&self.mask(points))
    }
}
