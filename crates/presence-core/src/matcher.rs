//! Nearest-identity matching by cosine similarity.

use crate::embedding::{dot, normalize, Embedding};
use crate::types::{IdentityRecord, MatchResult};

/// Default cosine similarity a match must strictly exceed.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

/// Similarity reported when there was no candidate to compare against.
/// Lies at the bottom of the cosine range so comparisons stay well-defined.
pub const NO_MATCH_SIMILARITY: f32 = -1.0;

/// Strategy for comparing a query embedding against the enrolled identities.
///
/// Implementations must keep the decision rule: a match requires a best
/// candidate whose similarity is strictly greater than `threshold`.
pub trait Matcher {
    fn compare(&self, query: &Embedding, candidates: &[IdentityRecord], threshold: f32)
        -> MatchResult;
}

/// Linear scan over every candidate, O(N) per query.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        query: &Embedding,
        candidates: &[IdentityRecord],
        threshold: f32,
    ) -> MatchResult {
        let query_unit = normalize(&query.values);
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, candidate) in candidates.iter().enumerate() {
            if candidate.embedding.dim() != query.dim() {
                tracing::warn!(
                    identity = %candidate.id,
                    expected = query.dim(),
                    got = candidate.embedding.dim(),
                    "skipping identity with mismatched embedding dimension"
                );
                continue;
            }
            let sim = dot(&query_unit, &normalize(&candidate.embedding.values));
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim > threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                identity_id: Some(candidates[idx].id.clone()),
                identity_name: Some(candidates[idx].name.clone()),
            },
            Some(_) => MatchResult {
                matched: false,
                similarity: best_sim,
                identity_id: None,
                identity_name: None,
            },
            None => MatchResult {
                matched: false,
                similarity: NO_MATCH_SIMILARITY,
                identity_id: None,
                identity_name: None,
            },
        }
    }
}
