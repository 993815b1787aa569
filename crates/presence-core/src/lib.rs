//! presence-core — Face enrollment and verification engine.
//!
//! Blink liveness from eye-aspect-ratio geometry, 5-point similarity
//! alignment, multi-shot embedding aggregation and cosine identity matching.
//! Detection, landmark and embedding models plug in through traits; ONNX
//! Runtime implementations of all three are provided.

pub mod alignment;
pub mod detector;
pub mod embedding;
pub mod geometry;
pub mod landmarks;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

use std::path::PathBuf;

pub use detector::{FaceDetector, ScrfdDetector};
pub use embedding::{Embedding, EMBEDDING_DIM};
pub use landmarks::{LandmarkPredictor, OnnxLandmarkPredictor};
pub use liveness::{detect_blink, BlinkResult};
pub use matcher::{CosineMatcher, Matcher};
pub use pipeline::{EnrollOutcome, Pipeline, PipelineConfig, PipelineError, VerifyOutcome};
pub use recognizer::{EmbeddingExtractor, OnnxEmbeddingExtractor};
pub use store::{IdentityStore, StoreError};
pub use types::{AttendanceEvent, BoundingBox, IdentityRecord, LandmarkSet, MatchResult, Point};

/// System-wide model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/presence/models")
}
