//! Face embeddings: multi-shot aggregation and unit normalization.
//!
//! Identity vectors are stored exactly as [`aggregate`] yields them.
//! Normalization is applied only at comparison time so a stored vector is
//! never normalized twice.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimensionality of the face embeddings produced by the extractor.
pub const EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("cannot aggregate an empty set of embeddings")]
    Empty,
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Face embedding vector (512-dimensional for the EdgeFace/ArcFace family).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "edgeface_s_gamma_05").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean norm of the vector.
    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Cosine similarity in [-1, 1]: dot product of both unit vectors.
    ///
    /// A zero vector normalizes to itself and therefore scores 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        dot(&normalize(&self.values), &normalize(&other.values))
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Dot product over the common prefix of `a` and `b`.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Scale `v` to unit length. A zero vector is returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = l2_norm(v);
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Per-dimension arithmetic mean of one or more embeddings.
///
/// The model version is kept when every input agrees on it.
pub fn aggregate(embeddings: &[Embedding]) -> Result<Embedding, EmbeddingError> {
    let first = embeddings.first().ok_or(EmbeddingError::Empty)?;
    let dim = first.dim();

    let mut sum = vec![0.0f32; dim];
    for embedding in embeddings {
        if embedding.dim() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                got: embedding.dim(),
            });
        }
        for (acc, v) in sum.iter_mut().zip(embedding.values.iter()) {
            *acc += v;
        }
    }

    let n = embeddings.len() as f32;
    let values = sum.into_iter().map(|s| s / n).collect();
    let model_version = first.model_version.clone().filter(|version| {
        embeddings
            .iter()
            .all(|e| e.model_version.as_deref() == Some(version.as_str()))
    });

    Ok(Embedding { values, model_version })
}
