use serde::{Deserialize, Serialize};

use crate::alignment::AlignmentError;
use crate::embedding::Embedding;

/// A 2-D image point `(x, y)` in source pixel coordinates.
pub type Point = (f32, f32);

/// Number of points produced by the 68-point landmark predictor.
pub const LANDMARK_COUNT: usize = 68;

/// Face rectangle from the detector, in integer pixel corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub confidence: f32,
}

impl BoundingBox {
    // Widths of boxes spanning most of the i32 range do not fit in i32.
    pub fn width(&self) -> i64 {
        i64::from(self.x2) - i64::from(self.x1)
    }

    pub fn height(&self) -> i64 {
        i64::from(self.y2) - i64::from(self.y1)
    }

    /// Width × height. Zero or negative for degenerate boxes.
    pub fn area(&self) -> i64 {
        self.width().saturating_mul(self.height())
    }

    /// Center point in source pixels.
    pub fn center(&self) -> Point {
        (
            ((i64::from(self.x1) + i64::from(self.x2)) as f64 / 2.0) as f32,
            ((i64::from(self.y1) + i64::from(self.y2)) as f64 / 2.0) as f32,
        )
    }

    /// A box with no positive extent cannot hold a face.
    pub fn is_degenerate(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }
}

/// The 68 facial landmarks of one detected face (iBUG 300-W ordering).
///
/// Indices 36–41 are the left eye contour, 42–47 the right eye, 30 the nose
/// tip, 48 and 54 the mouth corners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    points: Vec<Point>,
}

impl LandmarkSet {
    pub const LEFT_EYE: std::ops::Range<usize> = 36..42;
    pub const RIGHT_EYE: std::ops::Range<usize> = 42..48;
    pub const NOSE_TIP: usize = 30;
    pub const MOUTH_LEFT: usize = 48;
    pub const MOUTH_RIGHT: usize = 54;

    pub fn new(points: Vec<Point>) -> Result<Self, AlignmentError> {
        if points.len() != LANDMARK_COUNT {
            return Err(AlignmentError::InsufficientLandmarks { got: points.len() });
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn left_eye(&self) -> &[Point] {
        &self.points[Self::LEFT_EYE]
    }

    pub fn right_eye(&self) -> &[Point] {
        &self.points[Self::RIGHT_EYE]
    }
}

/// An enrolled identity as held by the identity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub name: String,
    pub embedding: Embedding,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// A recorded presence of an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: i64,
    pub identity_id: String,
    pub identity_name: String,
    /// RFC 3339 timestamp.
    pub recorded_at: String,
}

/// Result of matching a query embedding against the enrolled identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate, or
    /// [`NO_MATCH_SIMILARITY`](crate::matcher::NO_MATCH_SIMILARITY) when there was none.
    pub similarity: f32,
    pub identity_id: Option<String>,
    pub identity_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: i32, y1: i32, x2: i32, y2: i32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2, confidence: 0.9 }
    }

    #[test]
    fn test_bbox_area() {
        assert_eq!(bbox(10, 20, 110, 70).area(), 5000);
    }

    #[test]
    fn test_bbox_extent_beyond_i32() {
        let wide = bbox(-2_000_000_000, 0, 2_000_000_000, 10);
        assert_eq!(wide.width(), 4_000_000_000);
        assert_eq!(wide.area(), 40_000_000_000);
        assert!(wide.area() > bbox(0, 0, 100, 100).area());
        assert_eq!(wide.center(), (0.0, 5.0));

        let huge = bbox(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
        assert!(huge.area() > 0);
    }

    #[test]
    fn test_bbox_degenerate() {
        assert!(bbox(10, 10, 10, 50).is_degenerate());
        assert!(bbox(10, 50, 40, 20).is_degenerate());
        assert!(!bbox(0, 0, 1, 1).is_degenerate());
    }

    #[test]
    fn test_landmark_set_requires_68_points() {
        let err = LandmarkSet::new(vec![(0.0, 0.0); 5]).unwrap_err();
        assert!(matches!(err, AlignmentError::InsufficientLandmarks { got: 5 }));

        let set = LandmarkSet::new(vec![(1.0, 2.0); LANDMARK_COUNT]).unwrap();
        assert_eq!(set.left_eye().len(), 6);
        assert_eq!(set.right_eye().len(), 6);
    }

    #[test]
    fn test_unmatched_result_json_shape() {
        let result = MatchResult {
            matched: false,
            similarity: -1.0,
            identity_id: None,
            identity_name: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["matched"], false);
        assert_eq!(json["similarity"], -1.0);
        assert!(json["identity_id"].is_null());
    }
}
