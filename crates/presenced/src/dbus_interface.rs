use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use presence_store::EventFilter;
use serde::Serialize;
use zbus::{fdo, interface};

use crate::engine::{EngineError, EngineHandle};

/// D-Bus interface for the Presence attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
pub struct AttendanceService {
    pub engine: EngineHandle,
    pub request_timeout: Duration,
    pub model_dir: String,
    pub db_path: String,
}

impl AttendanceService {
    /// Run an engine request under the configured timeout and encode its result.
    async fn call<T, F>(&self, op: &str, fut: F) -> fdo::Result<String>
    where
        T: Serialize,
        F: Future<Output = Result<T, EngineError>>,
    {
        let value = tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| {
                tracing::warn!(op, timeout_secs = self.request_timeout.as_secs(), "request timed out");
                fdo::Error::Failed(format!("{op} timed out"))
            })?
            .map_err(|err| to_fdo_error(op, err))?;
        to_json(&value)
    }
}

#[interface(name = "org.presence.Attendance1")]
impl AttendanceService {
    /// Enroll a new identity from exactly the configured number of image files.
    async fn enroll(&self, name: &str, paths: Vec<String>) -> fdo::Result<String> {
        tracing::info!(name, shots = paths.len(), "enroll requested");
        let name = name.trim();
        if name.is_empty() {
            return Err(fdo::Error::InvalidArgs("name must not be empty".into()));
        }
        let paths = to_paths(paths);
        self.call("enroll", self.engine.enroll(name.to_string(), paths)).await
    }

    /// Verify a batch of image files; a match records attendance.
    ///
    /// A request that times out while still queued is never run. One that
    /// already started completes on the engine thread, so a timed-out
    /// verify may still have recorded attendance.
    async fn verify(&self, paths: Vec<String>) -> fdo::Result<String> {
        tracing::info!(frames = paths.len(), "verify requested");
        self.call("verify", self.engine.verify(to_paths(paths))).await
    }

    /// Blink signal for a single image.
    async fn detect_blink(&self, path: &str) -> fdo::Result<String> {
        tracing::debug!(path, "detect_blink requested");
        self.call("detect_blink", self.engine.detect_blink(PathBuf::from(path)))
            .await
    }

    async fn list_identities(&self) -> fdo::Result<String> {
        self.call("list_identities", self.engine.list_identities()).await
    }

    /// Remove an identity and its attendance history.
    async fn remove_identity(&self, id: &str) -> fdo::Result<bool> {
        tracing::info!(id, "remove_identity requested");
        let removed = tokio::time::timeout(self.request_timeout, self.engine.remove_identity(id.to_string()))
            .await
            .map_err(|_| fdo::Error::Failed("remove_identity timed out".into()))?
            .map_err(|err| to_fdo_error("remove_identity", err))?;
        Ok(removed)
    }

    /// Attendance events, newest first. Empty arguments do not filter.
    async fn attendance(&self, identity_id: &str, since: &str, until: &str) -> fdo::Result<String> {
        let filter = EventFilter {
            identity_id: non_empty(identity_id).map(str::to_string),
            since: parse_time("since", since)?,
            until: parse_time("until", until)?,
            limit: None,
        };
        self.call("attendance", self.engine.attendance(filter)).await
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = tokio::time::timeout(self.request_timeout, self.engine.status())
            .await
            .map_err(|_| fdo::Error::Failed("status timed out".into()))?
            .map_err(|err| to_fdo_error("status", err))?;
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_dir": self.model_dir,
            "db_path": self.db_path,
            "identities": status.identities,
            "enroll_shots": status.enroll_shots,
            "similarity_threshold": status.similarity_threshold,
        }))
    }
}

fn to_paths(paths: Vec<String>) -> Vec<PathBuf> {
    paths.into_iter().map(PathBuf::from).collect()
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn parse_time(field: &str, value: &str) -> fdo::Result<Option<DateTime<Utc>>> {
    non_empty(value)
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| fdo::Error::InvalidArgs(format!("{field}: not an RFC 3339 timestamp: {e}")))
        })
        .transpose()
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding reply: {e}")))
}

fn to_fdo_error(op: &str, err: EngineError) -> fdo::Error {
    if err.is_caller_error() {
        tracing::info!(op, error = %err, "request rejected");
        fdo::Error::InvalidArgs(err.to_string())
    } else {
        tracing::error!(op, error = %err, "request failed");
        fdo::Error::Failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::PipelineError;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("since", "").unwrap(), None);
        assert_eq!(parse_time("since", "  ").unwrap(), None);
        let t = parse_time("since", "2026-03-01T09:00:00+02:00").unwrap().unwrap();
        assert_eq!(t.to_rfc3339(), "2026-03-01T07:00:00+00:00");
        assert!(matches!(parse_time("until", "yesterday"), Err(fdo::Error::InvalidArgs(_))));
    }

    #[test]
    fn test_error_mapping() {
        let rejected = to_fdo_error("verify", EngineError::Pipeline(PipelineError::NoUsableFrames { attempted: 3 }));
        assert!(matches!(rejected, fdo::Error::InvalidArgs(_)));
        let failed = to_fdo_error("verify", EngineError::ChannelClosed);
        assert!(matches!(failed, fdo::Error::Failed(_)));
    }
}
