//! Planar geometry helpers: convex hull, minimum-area rectangle, oriented
//! bounding boxes.

use thiserror::Error;

use crate::core::points::Point;

/// Errors raised for inputs that cannot define the requested geometry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("points are collinear, cannot define a plane")]
    DegeneratePlane,

    #[error("plane normal must be finite and non-zero, got {0:?}")]
    DegenerateNormal([f64; 3]),

    #[error("polygon needs at least 3 vertices, got {0}")]
    DegeneratePolygon(usize),

    #[error("non-finite coordinate in {0}")]
    NonFinite(&'static str),
}

/// Result type for geometry operations.
pub type Result<T> = std::result::Result<T, GeometryError>;

type Point2 = [f32; 2];

#[inline]
fn cross(o: Point2, a: Point2, b: Point2) -> f32 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

/// Convex hull of 2-D points in counter-clockwise order (monotone chain).
///
/// Collinear points on the hull boundary are dropped. Inputs with fewer than
/// three distinct points return those points.
pub fn convex_hull(points: &[Point2]) -> Vec<Point2> {
    let mut pts: Vec<Point2> = points.to_vec();
    pts.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    pts.dedup();

    if pts.len() < 3 {
        return pts;
    }

    let mut hull: Vec<Point2> = Vec::with_capacity(pts.len() * 2);

    // Lower hull
    for &p in &pts {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(p);
    }

    // Upper hull
    let lower_len = hull.len() + 1;
    for &p in pts.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(p);
    }

    hull.pop();
    hull
}

/// Minimum-area enclosing rectangle of a 2-D point set.
///
/// Each hull edge is tried as a rectangle orientation; the corners of the
/// smallest are returned counter-clockwise. A single point yields four equal
/// corners, a segment a zero-width rectangle along it.
pub fn min_area_rectangle(points: &[Point2]) -> Option<[Point2; 4]> {
    let hull = convex_hull(points);
    match hull.len() {
        0 => return None,
        1 => return Some([hull[0]; 4]),
        _ => {}
    }

    let mut best: Option<(f32, [Point2; 4])> = None;

    for i in 0..hull.len() {
        let a = hull[i];
        let b = hull[(i + 1) % hull.len()];
        let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
        let len = (dx * dx + dy * dy).sqrt();
        if len == 0.0 {
            continue;
        }
        // Edge direction u and its normal v.
        let u = [dx / len, dy / len];
        let v = [-u[1], u[0]];

        let (mut min_u, mut max_u) = (f32::INFINITY, f32::NEG_INFINITY);
        let (mut min_v, mut max_v) = (f32::INFINITY, f32::NEG_INFINITY);
        for p in &hull {
            let pu = p[0] * u[0] + p[1] * u[1];
            let pv = p[0] * v[0] + p[1] * v[1];
            min_u = min_u.min(pu);
            max_u = max_u.max(pu);
            min_v = min_v.min(pv);
            max_v = max_v.max(pv);
        }

        let area = (max_u - min_u) * (max_v - min_v);
        if best.as_ref().map_or(true, |(best_area, _)| area < *best_area) {
            let corner = |s: f32, t: f32| [s * u[0] + t * v[0], s * u[1] + t * v[1]];
            best = Some((
                area,
                [
                    corner(min_u, min_v),
                    corner(max_u, min_v),
                    corner(max_u, max_v),
                    corner(min_u, max_v),
                ],
            ));
        }
    }

    best.map(|(_, rect)| rect)
}

/// Oriented bounding box: the minimum-area XY rectangle extruded over the Z
/// extent. Corners 0..4 lie at `z_min`, corners 4..8 at `z_max`, in the same
/// XY order.
pub fn oriented_bounding_box(points: &[Point]) -> Option<[Point; 8]> {
    let xy: Vec<Point2> = points.iter().map(|p| [p[0], p[1]]).collect();
    let rect = min_area_rectangle(&xy)?;

    let z_min = points.iter().map(|p| p[2]).fold(f32::INFINITY, f32::min);
    let z_max = points.iter().map(|p| p[2]).fold(f32::NEG_INFINITY, f32::max);

    let mut corners = [[0.0f32; 3]; 8];
    for (i, c) in rect.iter().enumerate() {
        corners[i] = [c[0], c[1], z_min];
        corners[i + 4] = [c[0], c[1], z_max];
    }
    Some(corners)
}

/// Even-odd ray casting point-in-polygon test.
pub fn point_in_polygon(x: f32, y: f32, polygon: &[Point2]) -> bool {
    let n = polygon.len();
    let mut inside = false;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let [xi, yi] = polygon[i];
        let [xj, yj] = polygon[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polygon_area(poly: &[Point2]) -> f32 {
        let n = poly.len();
        (0..n)
            .map(|i| {
                let a = poly[i];
                let b = poly[(i + 1) % n];
                a[0] * b[1] - b[0] * a[1]
            })
            .sum::<f32>()
            .abs()
            / 2.0
    }

    #[test]
    fn test_convex_hull_square_with_interior() {
        let pts = vec![
            [0.0, 0.0],
            [1.0, 0.0],
            [1.0, 1.0],
            [0.0, 1.0],
            [0.5, 0.5],
            [0.5, 0.0],
        ];
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        assert!((polygon_area(&hull) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_convex_hull_degenerate() {
        assert!(convex_hull(&[]).is_empty());
        assert_eq!(convex_hull(&[[1.0, 1.0], [1.0, 1.0]]).len(), 1);
        assert_eq!(convex_hull(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]).len(), 2);
    }

    #[test]
    fn test_min_area_rectangle_rotated() {
        // A 4 x 1 rectangle rotated by 30 degrees.
        let (s, c) = 30f32.to_radians().sin_cos();
        let rot = |x: f32, y: f32| [x * c - y * s, x * s + y * c];
        let pts = vec![rot(0.0, 0.0), rot(4.0, 0.0), rot(4.0, 1.0), rot(0.0, 1.0), rot(2.0, 0.5)];

        let rect = min_area_rectangle(&pts).unwrap();
        assert!((polygon_area(&rect) - 4.0).abs() < 1e-4);

        let axis_aligned_area = {
            let xs = pts.iter().map(|p| p[0]);
            let ys = pts.iter().map(|p| p[1]);
            let w = xs.clone().fold(f32::MIN, f32::max) - xs.fold(f32::MAX, f32::min);
            let h = ys.clone().fold(f32::MIN, f32::max) - ys.fold(f32::MAX, f32::min);
            w * h
        };
        assert!(polygon_area(&rect) < axis_aligned_area);
    }

    #[test]
    fn test_min_area_rectangle_segment_and_point() {
        let rect = min_area_rectangle(&[[0.0, 0.0], [2.0, 0.0]]).unwrap();
        assert!(polygon_area(&rect).abs() < 1e-6);
        let rect = min_area_rectangle(&[[3.0, 4.0]]).unwrap();
        assert_eq!(rect, [[3.0, 4.0]; 4]);
        assert!(min_area_rectangle(&[]).is_none());
    }

    #[test]
    fn test_oriented_bounding_box_extrusion() {
        let pts = vec![
            [0.0, 0.0, -1.0],
            [2.0, 0.0, 0.0],
            [2.0, 1.0, 2.0],
            [0.0, 1.0, 0.5],
        ];
        let obb = oriented_bounding_box(&pts).unwrap();
        for i in 0..4 {
            assert_eq!(obb[i][2], -1.0);
            assert_eq!(obb[i + 4][2], 2.0);
            assert_eq!(obb[i][0], obb[i + 4][0]);
            assert_eq!(obb[i][1], obb[i + 4][1]);
        }
        let base: Vec<Point2> = obb[..4].iter().map(|p| [p[0], p[1]]).collect();
        assert!((polygon_area(&base) - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_point_in_polygon() {
        let square = [[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0]];
        assert!(point_in_polygon(1.0, 1.0, &square));
        assert!(!point_in_polygon(3.0, 1.0, &square));
        assert!(!point_in_polygon(-0.5, 1.0, &square));

        // Concave "L" shape
        let l_shape = [[0.0, 0.0], [2.0, 0.0], [2.0, 1.0], [1.0, 1.0], [1.0, 2.0], [0.0, 2.0]];
        assert!(point_in_polygon(0.5, 1.5, &l_shape));
        assert!(!point_in_polygon(1.5, 1.5, &l_shape));
    }
}
