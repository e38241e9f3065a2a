//! Small 2D helpers for landmark geometry.
//!
//! Image coordinates: x grows to the right, y grows downward.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn midpoint(&self, other: &Point2) -> Point2 {
        Point2::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    /// Vector pointing from `self` to `other`.
    pub fn to(&self, other: &Point2) -> Point2 {
        Point2::new(other.x - self.x, other.y - self.y)
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

/// Angle of `v` against the upward image vertical `(0, -1)`, in degrees [0, 180].
///
/// A zero-length vector has no direction and yields 0.
pub fn angle_from_up_deg(v: Point2) -> f64 {
    let norm = v.norm();
    if norm <= f64::EPSILON {
        return 0.0;
    }
    let cos = (-v.y / norm).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

/// Absolute angle of `v` against the horizontal image axis, in degrees [0, 180].
/// 90° is a vertical segment.
pub fn angle_from_horizontal_deg(v: Point2) -> f64 {
    v.y.atan2(v.x).to_degrees().abs()
}

/// Axis-aligned extent `(width, height)` of a set of points.
pub fn extent<I>(points: I) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = Point2>,
{
    let mut iter = points.into_iter();
    let first = iter.next()?;
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (first.x, first.x, first.y, first.y);
    for p in iter {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    Some((max_x - min_x, max_y - min_y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_angle_from_up() {
        assert_relative_eq!(angle_from_up_deg(Point2::new(0.0, -1.0)), 0.0);
        assert_relative_eq!(angle_from_up_deg(Point2::new(1.0, 0.0)), 90.0);
        assert_relative_eq!(angle_from_up_deg(Point2::new(0.0, 2.0)), 180.0);
        assert_eq!(angle_from_up_deg(Point2::default()), 0.0);
    }

    #[test]
    fn test_angle_from_horizontal() {
        assert_relative_eq!(angle_from_horizontal_deg(Point2::new(0.0, 1.0)), 90.0);
        assert_relative_eq!(angle_from_horizontal_deg(Point2::new(1.0, 0.0)), 0.0);
        assert_relative_eq!(angle_from_horizontal_deg(Point2::new(-1.0, 0.0)), 180.0);
    }

    #[test]
    fn test_extent() {
        let pts = vec![Point2::new(1.0, 5.0), Point2::new(3.0, 2.0), Point2::new(2.0, 9.0)];
        assert_eq!(extent(pts), Some((2.0, 7.0)));
        assert_eq!(extent(Vec::<Point2>::new()), None);
    }
}
