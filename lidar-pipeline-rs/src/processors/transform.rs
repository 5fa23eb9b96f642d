//! Plane-fit re-leveling of point clouds.
//!
//! A ground plane is fitted through three points and every cloud is then
//! shifted onto that plane and rotated so the plane normal points along +Z.

use nalgebra::{UnitQuaternion, Vector3};

use super::geometry::{GeometryError, Result};
use crate::core::points::PointArray;

/// Relative tolerance on the cross product norm below which the three fit
/// points are treated as collinear.
const COLLINEAR_TOLERANCE: f64 = 1e-9;

/// Rigid transform taking a fitted ground plane to `z = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneTransformer {
    normal: [f64; 3],
    intercept: f64,
    unit_normal: Vector3<f64>,
    unit_intercept: f64,
    rotation: UnitQuaternion<f64>,
}

impl PlaneTransformer {
    /// Fit the plane through three points.
    ///
    /// The normal is flipped so that its Z component is non-negative.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::DegeneratePlane`] when the points are
    /// collinear (or coincide).
    pub fn fit(points: [[f64; 3]; 3]) -> Result<Self> {
        let [p0, p1, p2] = points.map(Vector3::from);
        if points.iter().flatten().any(|v| !v.is_finite()) {
            return Err(GeometryError::NonFinite("plane fit points"));
        }

        let u = p1 - p0;
        let v = p2 - p0;
        let cross = u.cross(&v);
        if cross.norm() <= COLLINEAR_TOLERANCE * u.norm() * v.norm() {
            return Err(GeometryError::DegeneratePlane);
        }

        let mut normal = cross.normalize();
        if normal.z < 0.0 {
            normal = -normal;
        }
        let intercept = -normal.dot(&p0);

        Self::from_coefficients([normal.x, normal.y, normal.z], intercept)
    }

    /// Rebuild a transformer from stored plane coefficients
    /// `normal · p + intercept = 0`. The normal need not be unit length.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::DegenerateNormal`] for a zero or non-finite
    /// normal, [`GeometryError::NonFinite`] for a non-finite intercept.
    pub fn from_coefficients(normal: [f64; 3], intercept: f64) -> Result<Self> {
        let n = Vector3::from(normal);
        let norm = n.norm();
        if !norm.is_finite() || norm == 0.0 {
            return Err(GeometryError::DegenerateNormal(normal));
        }
        if !intercept.is_finite() {
            return Err(GeometryError::NonFinite("plane intercept"));
        }

        let unit_normal = n / norm;
        let rotation = UnitQuaternion::rotation_between(&unit_normal, &Vector3::z())
            .unwrap_or_else(|| {
                UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
            });

        Ok(Self {
            normal,
            intercept,
            unit_normal,
            unit_intercept: intercept / norm,
            rotation,
        })
    }

    /// Plane normal as stored.
    pub fn normal(&self) -> [f64; 3] {
        self.normal
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    /// Signed distance of a point from the fitted plane.
    pub fn signed_distance(&self, point: [f32; 3]) -> f64 {
        let p = Vector3::new(point[0] as f64, point[1] as f64, point[2] as f64);
        self.unit_normal.dot(&p) + self.unit_intercept
    }

    /// Move every point so the fitted plane becomes `z = 0`.
    pub fn transform(&self, points: &PointArray) -> PointArray {
        let shift = self.unit_normal * self.unit_intercept;
        points
            .iter()
            .map(|p| {
                let v = Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64) + shift;
                let r = self.rotation * v;
                [r.x as f32, r.y as f32, r.z as f32]
            })
            .collect()
    }
}
