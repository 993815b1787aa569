//! Enrollment and verification orchestration.
//!
//! Per image: detect → pick the largest face → predict landmarks → align
//! (falling back to a bounding-box crop) → embed. Enrollment is all-or-nothing
//! over a fixed number of shots; verification drops frames without a usable
//! face and only fails when none remain.
//!
//! The pipeline holds no per-request state. Model capabilities are injected
//! once at construction; the identity store is passed per call.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alignment::{align_face, crop_face, AlignmentError};
use crate::detector::{select_primary_face, DetectorError, FaceDetector};
use crate::embedding::{aggregate, Embedding, EmbeddingError};
use crate::landmarks::{LandmarkError, LandmarkPredictor};
use crate::liveness::{detect_blink, BlinkResult};
use crate::matcher::{CosineMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::recognizer::{EmbeddingExtractor, RecognizerError};
use crate::store::{IdentityStore, StoreError};
use crate::types::{BoundingBox, IdentityRecord, LandmarkSet, MatchResult};

/// Number of shots an enrollment must supply.
pub const DEFAULT_ENROLL_SHOTS: usize = 3;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("no usable face region: {0}")]
    AlignmentFailed(#[source] AlignmentError),
    #[error("embedding extraction failed: {0}")]
    EmbeddingExtractionFailed(#[from] RecognizerError),
    #[error("no usable face in any of {attempted} frame(s)")]
    NoUsableFrames { attempted: usize },
    #[error("identity {0:?} is already enrolled")]
    DuplicateIdentity(String),
    #[error("enrollment requires exactly {expected} shots, got {got}")]
    InvalidShotCount { expected: usize, got: usize },
    #[error("enrollment shot {shot} rejected: {source}")]
    ShotRejected {
        shot: usize,
        #[source]
        source: Box<PipelineError>,
    },
    #[error("face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("landmark predictor: {0}")]
    Landmarks(#[from] LandmarkError),
    #[error("embedding aggregation: {0}")]
    Aggregation(#[from] EmbeddingError),
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// True when a new capture may succeed; false for precondition
    /// violations and model or store failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoFaceDetected
                | Self::AlignmentFailed(_)
                | Self::NoUsableFrames { .. }
                | Self::ShotRejected { .. }
        )
    }

    /// Per-image failures that a verification drops instead of failing on.
    fn is_frame_local(&self) -> bool {
        matches!(self, Self::NoFaceDetected | Self::AlignmentFailed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Exact number of shots an enrollment must supply.
    pub enroll_shots: usize,
    /// Cosine similarity a match must strictly exceed.
    pub match_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enroll_shots: DEFAULT_ENROLL_SHOTS,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

/// How the face crop fed to the extractor was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Aligned,
    Cropped,
}

/// Face crop for one image, tagged with its provenance.
#[derive(Debug, Clone)]
pub enum FaceRegion {
    /// Canonical 112×112 similarity-aligned crop.
    Aligned(RgbImage),
    /// Bounding-box crop used because alignment was impossible.
    Cropped { image: RgbImage, reason: AlignmentError },
    /// Neither alignment nor cropping produced pixels.
    Failed(AlignmentError),
}

impl FaceRegion {
    pub fn kind(&self) -> Option<RegionKind> {
        match self {
            Self::Aligned(_) => Some(RegionKind::Aligned),
            Self::Cropped { .. } => Some(RegionKind::Cropped),
            Self::Failed(_) => None,
        }
    }
}

/// The primary face of an image with its landmarks and extracted region.
#[derive(Debug, Clone)]
pub struct LocatedFace {
    pub face: BoundingBox,
    pub landmarks: Option<LandmarkSet>,
    pub region: FaceRegion,
}

/// Verification progress. `Rejected`, `Matched` and `Unmatched` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Started,
    FramesCollected,
    EmbeddingReady,
    Rejected,
    Matched,
    Unmatched,
}

impl VerificationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Matched | Self::Unmatched)
    }
}

#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub identity: IdentityRecord,
    pub aligned_shots: usize,
    pub cropped_shots: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub result: MatchResult,
    pub state: VerificationState,
    pub frames_used: usize,
    pub frames_skipped: usize,
    pub aligned_frames: usize,
    pub cropped_frames: usize,
    /// Blink signal of the first usable frame with landmarks. Reported only,
    /// never part of the match decision.
    pub liveness: Option<BlinkResult>,
}

struct FrameEmbedding {
    embedding: Embedding,
    kind: RegionKind,
    blink: Option<BlinkResult>,
}

/// Embeddings gathered over a batch of images, with provenance counts.
#[derive(Default)]
struct Collected {
    embeddings: Vec<Embedding>,
    aligned: usize,
    cropped: usize,
    skipped: usize,
    blink: Option<BlinkResult>,
}

impl Collected {
    fn push(&mut self, frame: FrameEmbedding) {
        match frame.kind {
            RegionKind::Aligned => self.aligned += 1,
            RegionKind::Cropped => self.cropped += 1,
        }
        if self.blink.is_none() {
            self.blink = frame.blink;
        }
        self.embeddings.push(frame.embedding);
    }
}

pub struct Pipeline<D, L, E> {
    detector: D,
    landmarks: L,
    extractor: E,
    matcher: Box<dyn Matcher + Send>,
    config: PipelineConfig,
}

impl<D, L, E> Pipeline<D, L, E>
where
    D: FaceDetector,
    L: LandmarkPredictor,
    E: EmbeddingExtractor,
{
    pub fn new(detector: D, landmarks: L, extractor: E, config: PipelineConfig) -> Self {
        Self {
            detector,
            landmarks,
            extractor,
            matcher: Box::new(CosineMatcher),
            config,
        }
    }

    /// Replace the default linear cosine scan.
    pub fn with_matcher(mut self, matcher: Box<dyn Matcher + Send>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Locate the primary face of `image` and extract its region.
    ///
    /// Fails when no face is detected or a model call errors. Alignment and
    /// per-image landmark problems are reported through the returned
    /// [`FaceRegion`].
    pub fn face_region(&mut self, image: &RgbImage) -> Result<LocatedFace, PipelineError> {
        let faces = self.detector.detect(image)?;
        let face = *select_primary_face(&faces).ok_or(PipelineError::NoFaceDetected)?;
        tracing::debug!(
            candidates = faces.len(),
            x1 = face.x1,
            y1 = face.y1,
            x2 = face.x2,
            y2 = face.y2,
            "primary face selected"
        );

        let (landmarks, region) = match self.landmarks.predict(image, &face) {
            Ok(set) => {
                let region = match align_face(image, set.points()) {
                    Ok(aligned) => FaceRegion::Aligned(aligned),
                    Err(reason) => crop_fallback(image, &face, reason),
                };
                (Some(set), region)
            }
            Err(err) if err.is_per_image() => {
                let reason = AlignmentError::LandmarksUnavailable(err.to_string());
                (None, crop_fallback(image, &face, reason))
            }
            Err(err) => return Err(err.into()),
        };

        Ok(LocatedFace { face, landmarks, region })
    }

    /// Standalone blink check on the primary face of one image.
    pub fn check_blink(&mut self, image: &RgbImage) -> Result<BlinkResult, PipelineError> {
        let faces = self.detector.detect(image)?;
        let face = select_primary_face(&faces).ok_or(PipelineError::NoFaceDetected)?;
        let landmarks = self.landmarks.predict(image, face)?;
        Ok(detect_blink(&landmarks))
    }

    fn embed_frame(&mut self, image: &RgbImage) -> Result<FrameEmbedding, PipelineError> {
        let located = self.face_region(image)?;
        let blink = located.landmarks.as_ref().map(detect_blink);
        let (face_image, kind) = match located.region {
            FaceRegion::Aligned(aligned) => (aligned, RegionKind::Aligned),
            FaceRegion::Cropped { image, .. } => (image, RegionKind::Cropped),
            FaceRegion::Failed(reason) => return Err(PipelineError::AlignmentFailed(reason)),
        };
        let embedding = self.extractor.embed(&face_image)?;
        Ok(FrameEmbedding { embedding, kind, blink })
    }

    /// Duplicate-name and shot-count checks of [`Pipeline::enroll`], usable
    /// before the shots are decoded.
    pub fn check_enroll_preconditions<S>(&self, store: &S, name: &str, shot_count: usize) -> Result<(), PipelineError>
    where
        S: IdentityStore + ?Sized,
    {
        if store.exists_by_name(name)? {
            return Err(PipelineError::DuplicateIdentity(name.to_string()));
        }
        if shot_count != self.config.enroll_shots {
            return Err(PipelineError::InvalidShotCount {
                expected: self.config.enroll_shots,
                got: shot_count,
            });
        }
        Ok(())
    }

    /// Enroll `name` from exactly `config.enroll_shots` images.
    ///
    /// Preconditions are checked before any model call. Any shot without a
    /// usable face rejects the whole enrollment and nothing is stored.
    pub fn enroll<S>(&mut self, store: &S, name: &str, shots: &[RgbImage]) -> Result<EnrollOutcome, PipelineError>
    where
        S: IdentityStore + ?Sized,
    {
        self.check_enroll_preconditions(store, name, shots.len())?;

        let mut collected = Collected::default();
        for (shot, image) in shots.iter().enumerate() {
            match self.embed_frame(image) {
                Ok(frame) => collected.push(frame),
                Err(err) if err.is_frame_local() => {
                    tracing::info!(name, shot, error = %err, "enrollment rejected");
                    return Err(PipelineError::ShotRejected { shot, source: Box::new(err) });
                }
                Err(err) => return Err(err),
            }
        }

        let identity_vector = aggregate(&collected.embeddings)?;
        let identity = store
            .create_identity(name, &identity_vector)
            .map_err(|err| match err {
                StoreError::Duplicate(name) => PipelineError::DuplicateIdentity(name),
                other => PipelineError::Store(other),
            })?;

        tracing::info!(
            id = %identity.id,
            name,
            aligned = collected.aligned,
            cropped = collected.cropped,
            "identity enrolled"
        );

        Ok(EnrollOutcome {
            identity,
            aligned_shots: collected.aligned,
            cropped_shots: collected.cropped,
        })
    }

    /// Verify one or more frames against every enrolled identity.
    ///
    /// On a match exactly one attendance event is recorded. Repeated calls
    /// record repeated events.
    pub fn verify<S>(&mut self, store: &S, frames: &[RgbImage]) -> Result<VerifyOutcome, PipelineError>
    where
        S: IdentityStore + ?Sized,
    {
        let mut state = VerificationState::Started;
        let mut collected = Collected::default();

        for (index, image) in frames.iter().enumerate() {
            match self.embed_frame(image) {
                Ok(frame) => collected.push(frame),
                Err(err) if err.is_frame_local() => {
                    tracing::warn!(frame = index, error = %err, "dropping frame");
                    collected.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        enter(&mut state, VerificationState::FramesCollected);

        if collected.embeddings.is_empty() {
            enter(&mut state, VerificationState::Rejected);
            tracing::info!(attempted = frames.len(), "verification rejected: no usable frames");
            return Err(PipelineError::NoUsableFrames { attempted: frames.len() });
        }

        let query = aggregate(&collected.embeddings)?;
        enter(&mut state, VerificationState::EmbeddingReady);

        let candidates = store.list_identities()?;
        let result = self.matcher.compare(&query, &candidates, self.config.match_threshold);

        match result.identity_id.as_deref() {
            Some(identity_id) if result.matched => {
                store.record_event(identity_id)?;
                enter(&mut state, VerificationState::Matched);
            }
            _ => enter(&mut state, VerificationState::Unmatched),
        }

        tracing::info!(
            matched = result.matched,
            similarity = result.similarity,
            identity = result.identity_name.as_deref().unwrap_or("-"),
            candidates = candidates.len(),
            frames_used = collected.embeddings.len(),
            frames_skipped = collected.skipped,
            "verification finished"
        );

        Ok(VerifyOutcome {
            result,
            state,
            frames_used: collected.embeddings.len(),
            frames_skipped: collected.skipped,
            aligned_frames: collected.aligned,
            cropped_frames: collected.cropped,
            liveness: collected.blink,
        })
    }
}

fn crop_fallback(image: &RgbImage, face: &BoundingBox, reason: AlignmentError) -> FaceRegion {
    tracing::warn!(%reason, "alignment unavailable, falling back to bounding-box crop");
    match crop_face(image, face) {
        Ok(crop) => FaceRegion::Cropped { image: crop, reason },
        Err(crop_err) => FaceRegion::Failed(crop_err),
    }
}

fn enter(state: &mut VerificationState, next: VerificationState) {
    tracing::debug!(from = ?*state, to = ?next, "verification state");
    *state = next;
}
