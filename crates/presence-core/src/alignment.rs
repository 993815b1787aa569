//! Face alignment via 4-DOF similarity transform.
//!
//! Reduces the 68-point landmark set to five semantic points (eye centroids,
//! nose tip, mouth corners), fits the least-squares similarity transform onto
//! the InsightFace 112×112 template, and warps the face into that canonical
//! position. [`crop_face`] is the plain bounding-box fallback used when
//! alignment is not possible.

use image::{Rgb, RgbImage};
use thiserror::Error;

use crate::geometry::centroid;
use crate::types::{BoundingBox, LandmarkSet, Point};

/// Side length of the aligned face crop.
pub const ALIGNED_SIZE: u32 = 112;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [Point; 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Relative pivot size below which the normal equations are treated as singular.
const SINGULAR_PIVOT_EPS: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("expected 68 landmarks, got {got}")]
    InsufficientLandmarks { got: usize },
    #[error("landmark prediction failed: {0}")]
    LandmarksUnavailable(String),
    #[error("similarity transform is degenerate (coincident or non-finite landmarks)")]
    DegenerateTransform,
    #[error("face box lies entirely outside the image")]
    EmptyCrop,
}

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub ty: f64,
}

impl SimilarityTransform {
    pub fn apply(&self, (x, y): Point) -> Point {
        let (x, y) = (f64::from(x), f64::from(y));
        (
            (self.a * x - self.b * y + self.tx) as f32,
            (self.b * x + self.a * y + self.ty) as f32,
        )
    }

    /// Uniform scale factor `sqrt(a² + b²)`.
    pub fn scale(&self) -> f64 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    fn is_usable(&self) -> bool {
        [self.a, self.b, self.tx, self.ty].iter().all(|v| v.is_finite())
            && self.a * self.a + self.b * self.b > 1e-12
    }
}

/// Derive the five alignment points from a 68-point landmark set:
/// `[left_eye, right_eye, nose, mouth_left, mouth_right]`.
pub fn five_point_landmarks(landmarks: &LandmarkSet) -> [Point; 5] {
    let points = landmarks.points();
    [
        centroid(landmarks.left_eye()),
        centroid(landmarks.right_eye()),
        points[LandmarkSet::NOSE_TIP],
        points[LandmarkSet::MOUTH_LEFT],
        points[LandmarkSet::MOUTH_RIGHT],
    ]
}

/// Least-squares similarity transform mapping `src` onto `dst`.
///
/// Returns `None` when the normal equations are singular or the solution is
/// not finite.
pub fn estimate_similarity_transform(
    src: &[Point; 5],
    dst: &[Point; 5],
) -> Option<SimilarityTransform> {
    // Overdetermined system A * [a, b, tx, ty]^T = B, one row pair per point:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [[0.0f64; 4]; 4];
    let mut atb = [0.0f64; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (f64::from(sx), f64::from(sy));
        let (dx, dy) = (f64::from(dx), f64::from(dy));
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb)?;
    let transform = SimilarityTransform { a, b, tx, ty };
    transform.is_usable().then_some(transform)
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f64; 4]; 4], atb: [f64; 4]) -> Option<[f64; 4]> {
    let mut m = [[0.0f64; 5]; 4];
    let mut magnitude = 0.0f64;
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
        for v in &ata[i] {
            magnitude = magnitude.max(v.abs());
        }
    }
    if magnitude == 0.0 || !magnitude.is_finite() {
        return None;
    }
    let tolerance = magnitude * SINGULAR_PIVOT_EPS;

    for col in 0..4 {
        let max_row = (col..4)
            .max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))
            .unwrap_or(col);
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() <= tolerance {
            return None;
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    Some(x)
}

/// Warp `image` through the inverse of `transform` into an `out_size`² crop.
///
/// Bilinear interpolation per channel; samples outside the source are black.
pub fn warp_affine(image: &RgbImage, transform: &SimilarityTransform, out_size: u32) -> RgbImage {
    let SimilarityTransform { a, b, tx, ty } = *transform;
    let det = a * a + b * b;
    let (ia, ib) = (a / det, b / det);
    let (width, height) = (i64::from(image.width()), i64::from(image.height()));

    let sample = |x: i64, y: i64, c: usize| -> f64 {
        if x >= 0 && x < width && y >= 0 && y < height {
            f64::from(image.get_pixel(x as u32, y as u32)[c])
        } else {
            0.0
        }
    };

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        // src = M^-1 * (dst - t)
        let dx = f64::from(ox) - tx;
        let dy = f64::from(oy) - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f64;
        let fy = sy - y0 as f64;

        let mut pixel = [0u8; 3];
        for (c, out) in pixel.iter_mut().enumerate() {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            *out = val.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(pixel)
    })
}

/// Align a face to the canonical 112×112 crop.
///
/// `landmarks` must be the full 68-point set; anything shorter yields
/// [`AlignmentError::InsufficientLandmarks`] and the caller is expected to
/// fall back to [`crop_face`].
pub fn align_face(image: &RgbImage, landmarks: &[Point]) -> Result<RgbImage, AlignmentError> {
    let landmarks = LandmarkSet::new(landmarks.to_vec())?;
    let src = five_point_landmarks(&landmarks);
    let transform = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112)
        .ok_or(AlignmentError::DegenerateTransform)?;

    tracing::trace!(
        scale = transform.scale(),
        tx = transform.tx,
        ty = transform.ty,
        "estimated alignment transform"
    );

    Ok(warp_affine(image, &transform, ALIGNED_SIZE))
}

/// Crop the bounding box out of `image`, clamped to the image bounds.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> Result<RgbImage, AlignmentError> {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let x1 = i64::from(face.x1).clamp(0, width);
    let y1 = i64::from(face.y1).clamp(0, height);
    let x2 = i64::from(face.x2).clamp(0, width);
    let y2 = i64::from(face.y2).clamp(0, height);

    if x2 <= x1 || y2 <= y1 {
        return Err(AlignmentError::EmptyCrop);
    }

    Ok(image::imageops::crop_imm(
        image,
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    )
    .to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LANDMARK_COUNT;

    /// 68-point set whose five derived points are exactly `five`.
    fn landmarks_from_five(five: &[Point; 5]) -> Vec<Point> {
        let mut points = vec![five[2]; LANDMARK_COUNT];
        for i in LandmarkSet::LEFT_EYE {
            points[i] = five[0];
        }
        for i in LandmarkSet::RIGHT_EYE {
            points[i] = five[1];
        }
        points[LandmarkSet::NOSE_TIP] = five[2];
        points[LandmarkSet::MOUTH_LEFT] = five[3];
        points[LandmarkSet::MOUTH_RIGHT] = five[4];
        points
    }

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let t = estimate_similarity_transform(&pts, &pts).unwrap();

        assert!((t.a - 1.0).abs() < 1e-6, "a = {}", t.a);
        assert!(t.b.abs() < 1e-6, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-4, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-4, "ty = {}", t.ty);
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → transform should have a ≈ 0.5
        let src: [Point; 5] = [
            (76.5892, 103.3926),
            (147.0636, 103.0028),
            (112.0504, 143.4732),
            (83.0986, 184.7310),
            (141.4598, 184.4082),
        ];
        let t = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 0.5).abs() < 0.01, "a = {}, expected ~0.5", t.a);
        assert!((t.scale() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_rotated_transform_maps_points() {
        // Rotate the template by 90° and shift it; the fit must undo both.
        let src: [Point; 5] = std::array::from_fn(|i| {
            let (x, y) = REFERENCE_LANDMARKS_112[i];
            (200.0 - y, 50.0 + x)
        });
        let t = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).unwrap();
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            let (x, y) = t.apply(*s);
            assert!((x - d.0).abs() < 1e-3 && (y - d.1).abs() < 1e-3);
        }
    }

    #[test]
    fn test_coincident_points_are_degenerate() {
        let src = [(40.0, 40.0); 5];
        assert!(estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).is_none());

        let image = RgbImage::new(100, 100);
        let err = align_face(&image, &vec![(40.0, 40.0); LANDMARK_COUNT]).unwrap_err();
        assert_eq!(err, AlignmentError::DegenerateTransform);
    }

    #[test]
    fn test_non_finite_points_are_degenerate() {
        let mut src = REFERENCE_LANDMARKS_112;
        src[2] = (f32::NAN, 10.0);
        assert!(estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).is_none());
    }

    #[test]
    fn test_five_point_derivation() {
        let mut points = vec![(0.0, 0.0); LANDMARK_COUNT];
        for (k, i) in LandmarkSet::LEFT_EYE.enumerate() {
            points[i] = (10.0 + k as f32 * 2.0, 20.0);
        }
        for i in LandmarkSet::RIGHT_EYE {
            points[i] = (60.0, 22.0);
        }
        points[30] = (35.0, 40.0);
        points[48] = (20.0, 60.0);
        points[54] = (50.0, 60.0);

        let five = five_point_landmarks(&LandmarkSet::new(points).unwrap());
        assert!((five[0].0 - 15.0).abs() < 1e-5 && (five[0].1 - 20.0).abs() < 1e-5);
        assert_eq!(five[1], (60.0, 22.0));
        assert_eq!(five[2], (35.0, 40.0));
        assert_eq!(five[3], (20.0, 60.0));
        assert_eq!(five[4], (50.0, 60.0));
    }

    #[test]
    fn test_align_rejects_short_landmarks() {
        let image = RgbImage::new(64, 64);
        let result = align_face(&image, &REFERENCE_LANDMARKS_112);
        assert_eq!(result.unwrap_err(), AlignmentError::InsufficientLandmarks { got: 5 });
    }

    #[test]
    fn test_align_face_output_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&image, &landmarks_from_five(&REFERENCE_LANDMARKS_112)).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        // Identity placement over a uniform image stays uniform.
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([128, 128, 128]));
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A bright patch at the left eye must land near the template's left eye.
        let (w, h) = (200u32, 200u32);
        let mut image = RgbImage::new(w, h);

        let five: [Point; 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        let (lx, ly) = (five[0].0 as u32, five[0].1 as u32);
        for y in ly - 2..=ly + 2 {
            for x in lx - 2..=lx + 2 {
                image.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }

        let aligned = align_face(&image, &landmarks_from_five(&five)).unwrap();

        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as u32;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as u32;
        let mut max_red = 0u8;
        for y in ref_y - 1..=ref_y + 1 {
            for x in ref_x - 1..=ref_x + 1 {
                max_red = max_red.max(aligned.get_pixel(x, y)[0]);
            }
        }
        assert!(max_red > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_red}");
        assert_eq!(aligned.get_pixel(ref_x, ref_y)[1], 0);
    }

    #[test]
    fn test_crop_face_clamps_to_image() {
        let image = RgbImage::from_pixel(100, 80, Rgb([1, 2, 3]));
        let face = BoundingBox { x1: -10, y1: 20, x2: 50, y2: 200, confidence: 1.0 };
        let crop = crop_face(&image, &face).unwrap();
        assert_eq!(crop.dimensions(), (50, 60));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_crop_face_outside_image() {
        let image = RgbImage::new(100, 80);
        let face = BoundingBox { x1: 120, y1: 10, x2: 160, y2: 50, confidence: 1.0 };
        assert_eq!(crop_face(&image, &face).unwrap_err(), AlignmentError::EmptyCrop);
    }
}
