use std::path::{Path, PathBuf};

use image::RgbImage;
use presence_core::detector::DetectorError;
use presence_core::landmarks::LandmarkError;
use presence_core::pipeline::DEFAULT_ENROLL_SHOTS;
use presence_core::recognizer::RecognizerError;
use presence_core::{
    AttendanceEvent, BlinkResult, EmbeddingExtractor, EnrollOutcome, FaceDetector, IdentityRecord, IdentityStore,
    LandmarkPredictor, OnnxEmbeddingExtractor, OnnxLandmarkPredictor, Pipeline, PipelineConfig, PipelineError,
    ScrfdDetector, StoreError, VerifyOutcome,
};
use presence_store::{DbError, EventFilter, SqliteStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("landmark model error: {0}")]
    Landmarks(#[from] LandmarkError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("identity store error: {0}")]
    Store(#[from] StoreError),
    #[error("cannot read image {path}: {source}")]
    ImageDecode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Errors caused by the request itself rather than by the daemon.
    pub fn is_caller_error(&self) -> bool {
        match self {
            Self::ImageDecode { .. } => true,
            Self::Pipeline(err) => {
                err.is_retryable()
                    || matches!(
                        err,
                        PipelineError::DuplicateIdentity(_) | PipelineError::InvalidShotCount { .. }
                    )
            }
            _ => false,
        }
    }
}

/// Identity as exposed to clients; the stored vector stays in the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub model_version: Option<String>,
}

impl From<&IdentityRecord> for IdentitySummary {
    fn from(record: &IdentityRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            created_at: record.created_at.clone(),
            model_version: record.embedding.model_version.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollReport {
    pub identity: IdentitySummary,
    pub aligned_shots: usize,
    pub cropped_shots: usize,
}

impl From<EnrollOutcome> for EnrollReport {
    fn from(outcome: EnrollOutcome) -> Self {
        Self {
            identity: IdentitySummary::from(&outcome.identity),
            aligned_shots: outcome.aligned_shots,
            cropped_shots: outcome.cropped_shots,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub identities: usize,
    pub enroll_shots: usize,
    pub similarity_threshold: f32,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        name: String,
        paths: Vec<PathBuf>,
        reply: Reply<EnrollReport>,
    },
    Verify {
        paths: Vec<PathBuf>,
        reply: Reply<VerifyOutcome>,
    },
    Blink {
        path: PathBuf,
        reply: Reply<BlinkResult>,
    },
    ListIdentities {
        reply: Reply<Vec<IdentitySummary>>,
    },
    RemoveIdentity {
        id: String,
        reply: Reply<bool>,
    },
    Attendance {
        filter: EventFilter,
        reply: Reply<Vec<AttendanceEvent>>,
    },
    Status {
        reply: Reply<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Enroll `name` from exactly the configured number of image files.
    pub async fn enroll(&self, name: String, paths: Vec<PathBuf>) -> Result<EnrollReport, EngineError> {
        self.request(|reply| EngineRequest::Enroll { name, paths, reply }).await
    }

    /// Verify a batch of image files against every enrolled identity.
    pub async fn verify(&self, paths: Vec<PathBuf>) -> Result<VerifyOutcome, EngineError> {
        self.request(|reply| EngineRequest::Verify { paths, reply }).await
    }

    pub async fn detect_blink(&self, path: PathBuf) -> Result<BlinkResult, EngineError> {
        self.request(|reply| EngineRequest::Blink { path, reply }).await
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.request(|reply| EngineRequest::ListIdentities { reply }).await
    }

    pub async fn remove_identity(&self, id: String) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::RemoveIdentity { id, reply }).await
    }

    pub async fn attendance(&self, filter: EventFilter) -> Result<Vec<AttendanceEvent>, EngineError> {
        self.request(|reply| EngineRequest::Attendance { filter, reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the three ONNX models and opens the database synchronously, so
/// startup fails fast if any resource is unavailable. Inference and SQLite
/// access then happen only on the engine thread, one request at a time.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(&detector_path)?;
    tracing::info!(path = %detector_path, "SCRFD detector loaded");

    let landmark_path = config.landmark_model_path();
    let landmarks = OnnxLandmarkPredictor::load(&landmark_path)?;
    tracing::info!(path = %landmark_path, "landmark model loaded");

    let embedding_path = config.embedding_model_path();
    let extractor = OnnxEmbeddingExtractor::load(&embedding_path)?;
    tracing::info!(path = %embedding_path, "embedding model loaded");

    let store = SqliteStore::open(&config.db_path)?;

    let enroll_shots = if config.enroll_shots == 0 {
        tracing::warn!(default = DEFAULT_ENROLL_SHOTS, "enroll shot count of 0 is invalid; using default");
        DEFAULT_ENROLL_SHOTS
    } else {
        config.enroll_shots
    };
    let pipeline = Pipeline::new(
        detector,
        landmarks,
        extractor,
        PipelineConfig {
            enroll_shots,
            match_threshold: config.similarity_threshold,
        },
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    let mut engine = Engine { pipeline, store };
    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

struct Engine<D, L, E> {
    pipeline: Pipeline<D, L, E>,
    store: SqliteStore,
}

impl<D, L, E> Engine<D, L, E>
where
    D: FaceDetector,
    L: LandmarkPredictor,
    E: EmbeddingExtractor,
{
    // A dropped receiver means the caller timed out. Requests that write are
    // skipped if that happened while they were queued; once started they run
    // to completion and the result is discarded.
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Enroll { name, paths, reply } => {
                if reply.is_closed() {
                    tracing::warn!(name, "enroll abandoned by caller before it started");
                    return;
                }
                let _ = reply.send(self.enroll(&name, &paths));
            }
            EngineRequest::Verify { paths, reply } => {
                if reply.is_closed() {
                    tracing::warn!(frames = paths.len(), "verify abandoned by caller before it started");
                    return;
                }
                let _ = reply.send(self.verify(&paths));
            }
            EngineRequest::Blink { path, reply } => {
                let result = load_image(&path)
                    .and_then(|image| self.pipeline.check_blink(&image).map_err(EngineError::from));
                let _ = reply.send(result);
            }
            EngineRequest::ListIdentities { reply } => {
                let result = self
                    .store
                    .list_identities()
                    .map(|records| records.iter().map(IdentitySummary::from).collect())
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::RemoveIdentity { id, reply } => {
                let _ = reply.send(self.store.remove_identity(&id).map_err(EngineError::from));
            }
            EngineRequest::Attendance { filter, reply } => {
                let _ = reply.send(self.store.list_events(&filter).map_err(EngineError::from));
            }
            EngineRequest::Status { reply } => {
                let result = self.store.list_identities().map_err(EngineError::from).map(|records| EngineStatus {
                    identities: records.len(),
                    enroll_shots: self.pipeline.config().enroll_shots,
                    similarity_threshold: self.pipeline.config().match_threshold,
                });
                let _ = reply.send(result);
            }
        }
    }

    fn enroll(&mut self, name: &str, paths: &[PathBuf]) -> Result<EnrollReport, EngineError> {
        self.pipeline.check_enroll_preconditions(&self.store, name, paths.len())?;
        let shots = load_images(paths)?;
        let outcome = self.pipeline.enroll(&self.store, name, &shots)?;
        tracing::info!(
            id = %outcome.identity.id,
            name,
            aligned = outcome.aligned_shots,
            cropped = outcome.cropped_shots,
            "enrolled"
        );
        Ok(outcome.into())
    }

    fn verify(&mut self, paths: &[PathBuf]) -> Result<VerifyOutcome, EngineError> {
        let frames = load_images(paths)?;
        let outcome = self.pipeline.verify(&self.store, &frames)?;
        tracing::info!(
            matched = outcome.result.matched,
            similarity = outcome.result.similarity,
            identity = ?outcome.result.identity_name,
            frames_used = outcome.frames_used,
            "verified"
        );
        Ok(outcome)
    }
}

fn load_image(path: &Path) -> Result<RgbImage, EngineError> {
    let image = image::open(path).map_err(|source| EngineError::ImageDecode {
        path: path.display().to_string(),
        source,
    })?;
    Ok(image.to_rgb8())
}

fn load_images(paths: &[PathBuf]) -> Result<Vec<RgbImage>, EngineError> {
    paths.iter().map(|p| load_image(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use presence_core::detector::DetectorError;
    use presence_core::{BoundingBox, Embedding, LandmarkSet};

    /// Counts calls and never finds a face.
    struct CountingDetector(Rc<Cell<usize>>);

    impl FaceDetector for CountingDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            self.0.set(self.0.get() + 1);
            Ok(Vec::new())
        }
    }

    struct NoLandmarks;

    impl LandmarkPredictor for NoLandmarks {
        fn predict(&mut self, _image: &RgbImage, _face: &BoundingBox) -> Result<LandmarkSet, LandmarkError> {
            Err(LandmarkError::EmptyRegion)
        }
    }

    struct ZeroExtractor;

    impl EmbeddingExtractor for ZeroExtractor {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, RecognizerError> {
            Ok(Embedding::new(vec![0.0; 4]))
        }
    }

    fn test_engine() -> (Engine<CountingDetector, NoLandmarks, ZeroExtractor>, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let pipeline = Pipeline::new(
            CountingDetector(calls.clone()),
            NoLandmarks,
            ZeroExtractor,
            PipelineConfig::default(),
        );
        let store = SqliteStore::open_in_memory().unwrap();
        (Engine { pipeline, store }, calls)
    }

    fn write_frame(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("presenced-{}-{name}.png", std::process::id()));
        RgbImage::from_pixel(8, 8, image::Rgb([120, 90, 60])).save(&path).unwrap();
        path
    }

    #[test]
    fn test_enroll_preconditions_before_decoding() {
        let (mut engine, calls) = test_engine();
        engine.store.create_identity("alice", &Embedding::new(vec![1.0; 4])).unwrap();
        let missing = PathBuf::from("/nonexistent/presence/missing.png");

        let err = engine
            .enroll("alice", &[missing.clone(), missing.clone(), missing.clone()])
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::DuplicateIdentity(ref n)) if n == "alice"));

        let err = engine.enroll("bob", &[missing.clone()]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Pipeline(PipelineError::InvalidShotCount { expected: 3, got: 1 })
        ));

        let err = engine.enroll("bob", &[missing.clone(), missing.clone(), missing]).unwrap_err();
        assert!(matches!(err, EngineError::ImageDecode { .. }));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_abandoned_verify_is_not_run() {
        let (mut engine, calls) = test_engine();
        let frame = write_frame("abandoned");

        let (reply, rx) = oneshot::channel();
        drop(rx);
        engine.handle(EngineRequest::Verify { paths: vec![frame.clone()], reply });
        assert_eq!(calls.get(), 0);

        let (reply, mut rx) = oneshot::channel();
        engine.handle(EngineRequest::Verify { paths: vec![frame.clone()], reply });
        assert_eq!(calls.get(), 1);
        let result = rx.try_recv().unwrap();
        assert!(matches!(
            result,
            Err(EngineError::Pipeline(PipelineError::NoUsableFrames { attempted: 1 }))
        ));
        let _ = std::fs::remove_file(frame);
    }

    #[test]
    fn test_caller_errors() {
        assert!(EngineError::Pipeline(PipelineError::NoUsableFrames { attempted: 2 }).is_caller_error());
        assert!(EngineError::Pipeline(PipelineError::DuplicateIdentity("ana".into())).is_caller_error());
        assert!(EngineError::Pipeline(PipelineError::InvalidShotCount { expected: 3, got: 1 }).is_caller_error());
        assert!(!EngineError::ChannelClosed.is_caller_error());
        assert!(!EngineError::Store(StoreError::UnknownIdentity("x".into())).is_caller_error());
    }

    #[test]
    fn test_missing_image_is_decode_error() {
        let err = load_image(Path::new("/nonexistent/presence/frame.png")).unwrap_err();
        assert!(matches!(err, EngineError::ImageDecode { ref path, .. } if path.ends_with("frame.png")));
        assert!(err.is_caller_error());
    }

    #[tokio::test]
    async fn test_handle_reports_closed_engine() {
        let (tx, rx) = mpsc::channel::<EngineRequest>(1);
        drop(rx);
        let handle = EngineHandle { tx };
        assert!(matches!(handle.status().await, Err(EngineError::ChannelClosed)));
    }
}
