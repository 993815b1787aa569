//! Point geometry shared by the liveness check and the aligner.

use crate::types::Point;

/// Euclidean distance between two points.
pub fn distance(p: Point, q: Point) -> f32 {
    let dx = p.0 - q.0;
    let dy = p.1 - q.1;
    (dx * dx + dy * dy).sqrt()
}

/// Eye aspect ratio of a six-point eye contour.
///
/// `p0`/`p3` are the horizontal corners, `p1`/`p5` and `p2`/`p4` the vertical
/// pairs:
/// ```text
/// EAR = (|p1 - p5| + |p2 - p4|) / (2 * |p0 - p3|)
/// ```
/// A zero-width eye yields 0.0 so it reads as closed.
pub fn eye_aspect_ratio(eye: &[Point; 6]) -> f32 {
    let vertical = distance(eye[1], eye[5]) + distance(eye[2], eye[4]);
    let horizontal = distance(eye[0], eye[3]);
    if horizontal == 0.0 {
        return 0.0;
    }
    vertical / (2.0 * horizontal)
}

/// Arithmetic mean of a set of points. Empty input gives the origin.
pub fn centroid(points: &[Point]) -> Point {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / n, sy / n)
}
