//! Cartesian point arrays handed between pipeline stages.

/// A single Cartesian point `[x, y, z]` in meters.
pub type Point = [f32; 3];

/// Materialized Cartesian points for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointArray {
    points: Vec<Point>,
}

impl PointArray {
    /// Creates a new empty point array.
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Creates a new point array with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true if there are no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    #[inline]
    pub fn as_slice(&self) -> &[Point] {
        &self.points
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.points.iter()
    }

    pub fn into_vec(self) -> Vec<Point> {
        self.points
    }

    /// Keep the points whose mask entry is true.
    pub fn select(&self, mask: &[bool]) -> PointArray {
        debug_assert_eq!(mask.len(), self.points.len(), "mask must match point count");
        self.points
            .iter()
            .zip(mask)
            .filter_map(|(p, &keep)| keep.then_some(*p))
            .collect()
    }

    /// Points projected onto the XY plane (z set to zero).
    pub fn xy_projection(&self) -> Vec<Point> {
        self.points.iter().map(|p| [p[0], p[1], 0.0]).collect()
    }
}

impl From<Vec<Point>> for PointArray {
    fn from(points: Vec<Point>) -> Self {
        Self { points }
    }
}

impl FromIterator<Point> for PointArray {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a PointArray {
    type Item = &'a Point;
    type IntoIter = std::slice::Iter<'a, Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

/// Euclidean distance between two points.
#[inline]
pub fn distance(a: &Point, b: &Point) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_array_operations() {
        let mut arr = PointArray::new();
        assert!(arr.is_empty());

        arr.push([1.0, 2.0, 3.0]);
        arr.push([4.0, 5.0, 6.0]);
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.as_slice()[1], [4.0, 5.0, 6.0]);

        let xy = arr.xy_projection();
        assert_eq!(xy[0], [1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_select_by_mask() {
        let arr: PointArray = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]].into();
        let kept = arr.select(&[true, false, true]);
        assert_eq!(kept.as_slice(), &[[0.0, 0.0, 0.0], [2.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_distance() {
        assert!((distance(&[0.0, 0.0, 0.0], &[3.0, 4.0, 0.0]) - 5.0).abs() < 1e-6);
    }
}
