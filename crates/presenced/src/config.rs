use std::path::PathBuf;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

impl BusKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "session" => Some(Self::Session),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity a verification must exceed to match.
    pub similarity_threshold: f32,
    /// Exact number of images an enrollment must supply.
    pub enroll_shots: usize,
    /// Upper bound in seconds on a single engine request.
    pub request_timeout_secs: u64,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("PRESENCE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(presence_core::default_model_dir);

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        let db_path = var("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("presence.db"));

        let bus = match var("PRESENCE_BUS") {
            Some(value) => BusKind::parse(&value).unwrap_or_else(|| {
                tracing::warn!(value, "unknown PRESENCE_BUS; using the session bus");
                BusKind::Session
            }),
            None => BusKind::Session,
        };

        Self {
            model_dir,
            db_path,
            similarity_threshold: parse_or(&var, "PRESENCE_SIMILARITY_THRESHOLD", 0.5),
            enroll_shots: parse_or(&var, "PRESENCE_ENROLL_SHOTS", 3),
            request_timeout_secs: parse_or(&var, "PRESENCE_REQUEST_TIMEOUT_SECS", 30),
            bus,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_path("det_10g.onnx")
    }

    /// Path to the 68-point landmark model.
    pub fn landmark_model_path(&self) -> String {
        self.model_path("landmarks_68.onnx")
    }

    /// Path to the EdgeFace embedding model.
    pub fn embedding_model_path(&self) -> String {
        self.model_path("edgeface.onnx")
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
