//! Blink liveness from eye-aspect-ratio geometry.
//!
//! A single-frame classifier: it reports whether the eyes in one landmark set
//! look closed. Tracking open → closed → open transitions across a stream is
//! left to the caller, which should call [`detect_blink`] per frame.

use serde::{Deserialize, Serialize};

use crate::geometry::eye_aspect_ratio;
use crate::types::{LandmarkSet, Point};

/// Average EAR below which the eyes are considered closed.
///
/// Deliberately permissive to tolerate webcam landmark jitter.
pub const EAR_BLINK_THRESHOLD: f32 = 0.30;

/// Per-frame blink classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlinkResult {
    pub is_blink: bool,
    pub avg_ear: f32,
    pub left_ear: f32,
    pub right_ear: f32,
}

/// Classify one landmark set as blinking or not.
pub fn detect_blink(landmarks: &LandmarkSet) -> BlinkResult {
    let left_ear = eye_aspect_ratio(&eye_contour(landmarks.left_eye()));
    let right_ear = eye_aspect_ratio(&eye_contour(landmarks.right_eye()));
    let avg_ear = (left_ear + right_ear) / 2.0;

    let result = BlinkResult {
        is_blink: avg_ear < EAR_BLINK_THRESHOLD,
        avg_ear,
        left_ear,
        right_ear,
    };
    tracing::debug!(
        avg_ear,
        left_ear,
        right_ear,
        threshold = EAR_BLINK_THRESHOLD,
        is_blink = result.is_blink,
        "blink check"
    );
    result
}

fn eye_contour(points: &[Point]) -> [Point; 6] {
    std::array::from_fn(|i| points[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LANDMARK_COUNT;

    /// Build a landmark set with both eyes drawn at the given vertical opening.
    fn face_with_eye_opening(opening: f32) -> LandmarkSet {
        let mut points = vec![(50.0, 50.0); LANDMARK_COUNT];
        for (start, cx) in [(36usize, 30.0f32), (42, 70.0)] {
            let h = opening / 2.0;
            points[start] = (cx - 10.0, 40.0);
            points[start + 1] = (cx - 4.0, 40.0 - h);
            points[start + 2] = (cx + 4.0, 40.0 - h);
            points[start + 3] = (cx + 10.0, 40.0);
            points[start + 4] = (cx + 4.0, 40.0 + h);
            points[start + 5] = (cx - 4.0, 40.0 + h);
        }
        LandmarkSet::new(points).unwrap()
    }

    #[test]
    fn test_open_eyes_not_blink() {
        // opening 10 over width 20 → EAR 0.5
        let result = detect_blink(&face_with_eye_opening(10.0));
        assert!(!result.is_blink);
        assert!((result.avg_ear - 0.5).abs() < 1e-5);
        assert!((result.left_ear - result.right_ear).abs() < 1e-6);
    }

    #[test]
    fn test_flat_eyes_blink() {
        // Vertical pairs collapse onto the horizontal corner line.
        let result = detect_blink(&face_with_eye_opening(0.0));
        assert!(result.is_blink);
        assert_eq!(result.avg_ear, 0.0);
    }

    #[test]
    fn test_threshold_is_strict() {
        // opening 6 over width 20 → EAR exactly 0.3 → not below threshold
        let result = detect_blink(&face_with_eye_opening(6.0));
        assert_eq!(result.avg_ear, EAR_BLINK_THRESHOLD);
        assert!(!result.is_blink);

        let result = detect_blink(&face_with_eye_opening(5.0));
        assert!((result.avg_ear - 0.25).abs() < 1e-5);
        assert!(result.is_blink);
    }
}
