//! 68-point facial landmark prediction.
//!
//! The ONNX predictor expects a PFLD-style regressor: a square RGB face crop
//! scaled to [0, 1], and a flat output of 136 values holding `(x, y)` pairs
//! normalized to the crop.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::alignment::AlignmentError;
use crate::types::{BoundingBox, LandmarkSet, Point, LANDMARK_COUNT};

const LANDMARK_INPUT_SIZE: u32 = 112;
/// Fraction of the box size added on every side before cropping.
const LANDMARK_BOX_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0} — place the 68-point landmark model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region is empty after clamping to the image")]
    EmptyRegion,
    #[error("no reliable landmarks: {0}")]
    Unreliable(#[from] AlignmentError),
    #[error("model produced non-finite landmark coordinates")]
    NonFinite,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl LandmarkError {
    /// Failures caused by the image content rather than the model. Callers
    /// may fall back to the bounding box for these.
    pub fn is_per_image(&self) -> bool {
        matches!(self, Self::EmptyRegion | Self::Unreliable(_) | Self::NonFinite)
    }
}

/// Predicts the 68 landmarks of one detected face.
pub trait LandmarkPredictor {
    fn predict(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<LandmarkSet, LandmarkError>;
}

/// Square, clamped crop region around a face box, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CropRegion {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl CropRegion {
    fn around(face: &BoundingBox, image_width: u32, image_height: u32) -> Option<Self> {
        let side = face.width().max(face.height()) as f32 * (1.0 + 2.0 * LANDMARK_BOX_MARGIN);
        let (cx, cy) = face.center();

        let x1 = (cx - side / 2.0).round().clamp(0.0, image_width as f32) as u32;
        let y1 = (cy - side / 2.0).round().clamp(0.0, image_height as f32) as u32;
        let x2 = (cx + side / 2.0).round().clamp(0.0, image_width as f32) as u32;
        let y2 = (cy + side / 2.0).round().clamp(0.0, image_height as f32) as u32;

        (x2 > x1 && y2 > y1).then_some(Self { x: x1, y: y1, width: x2 - x1, height: y2 - y1 })
    }

    fn to_source(&self, nx: f32, ny: f32) -> Point {
        (
            self.x as f32 + nx * self.width as f32,
            self.y as f32 + ny * self.height as f32,
        )
    }
}

/// ONNX 68-point landmark regressor.
pub struct OnnxLandmarkPredictor {
    session: Session,
}

impl OnnxLandmarkPredictor {
    /// Load the landmark ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, LandmarkError> {
        if !Path::new(model_path).exists() {
            return Err(LandmarkError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded landmark model"
        );

        Ok(Self { session })
    }

    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let size = LANDMARK_INPUT_SIZE as usize;
        let resized = imageops::resize(crop, LANDMARK_INPUT_SIZE, LANDMARK_INPUT_SIZE, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }
        tensor
    }
}

/// Turn the flat normalized model output into source-image landmarks.
fn decode_landmarks(raw: &[f32], region: &CropRegion) -> Result<LandmarkSet, LandmarkError> {
    if raw.len() < LANDMARK_COUNT * 2 {
        return Err(AlignmentError::InsufficientLandmarks { got: raw.len() / 2 }.into());
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(LandmarkError::NonFinite);
    }
    let points = raw[..LANDMARK_COUNT * 2]
        .chunks_exact(2)
        .map(|xy| region.to_source(xy[0], xy[1]))
        .collect();
    Ok(LandmarkSet::new(points)?)
}

impl LandmarkPredictor for OnnxLandmarkPredictor {
    fn predict(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<LandmarkSet, LandmarkError> {
        let region = CropRegion::around(face, image.width(), image.height()).ok_or(LandmarkError::EmptyRegion)?;
        let crop = imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image();
        let input = Self::preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmark extraction: {e}")))?;

        decode_landmarks(raw, &region)
    }
}
