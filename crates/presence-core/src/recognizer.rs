//! Face embedding extraction via ONNX Runtime.
//!
//! Produces 512-dimensional embeddings from 112×112 face crops with an
//! EdgeFace/ArcFace-family model. Embeddings are returned raw; the matcher
//! normalizes at comparison time.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::alignment::ALIGNED_SIZE;
use crate::embedding::{Embedding, EMBEDDING_DIM};

const RECOGNIZER_MEAN: f32 = 127.5;
const RECOGNIZER_STD: f32 = 127.5; // symmetric: pixels land in [-1, 1]
const RECOGNIZER_MODEL_VERSION: &str = "edgeface_s_gamma_05";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — place the embedding model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a face crop to its embedding. Identical input yields identical output.
pub trait EmbeddingExtractor {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError>;
}

/// ONNX embedding extractor.
pub struct OnnxEmbeddingExtractor {
    session: Session,
}

impl OnnxEmbeddingExtractor {
    /// Load the embedding ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session })
    }

    /// Resize to 112×112 when needed (bounding-box crops) and build the NCHW tensor.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let resized;
        let face = if face.dimensions() == (ALIGNED_SIZE, ALIGNED_SIZE) {
            face
        } else {
            resized = imageops::resize(face, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle);
            &resized
        };

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in face.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - RECOGNIZER_MEAN) / RECOGNIZER_STD;
            }
        }
        tensor
    }
}

impl EmbeddingExtractor for OnnxEmbeddingExtractor {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(RecognizerError::InferenceFailed("empty face image".into()));
        }
        let input = Self::preprocess(face);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(RecognizerError::InferenceFailed("non-finite embedding values".into()));
        }

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(RECOGNIZER_MODEL_VERSION.to_string()),
        })
    }
}
