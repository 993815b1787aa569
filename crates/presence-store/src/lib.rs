//! presence-store — SQLite persistence for enrolled identities and attendance.
//!
//! Identity vectors are stored as little-endian `f32` blobs exactly as the
//! pipeline aggregated them. Each write is a single statement, so SQLite's
//! own transaction gives the atomicity the pipeline relies on.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use presence_core::{AttendanceEvent, Embedding, IdentityRecord, IdentityStore, StoreError};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    embedding   BLOB NOT NULL,
    model       TEXT,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id  TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    recorded_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS attendance_identity ON attendance(identity_id);
CREATE INDEX IF NOT EXISTS attendance_recorded_at ON attendance(recorded_at);
";

const DEFAULT_EVENT_LIMIT: u32 = 1000;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt embedding for identity {id}: {len} bytes is not a whole number of f32 values")]
    CorruptEmbedding { id: String, len: usize },
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Attendance query filter. `None` fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub identity_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DbError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "identity store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn get_identity(&self, id: &str) -> Result<Option<IdentityRecord>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, embedding, model, created_at FROM identities WHERE id = ?1",
                params![id],
                read_identity_row,
            )
            .optional()?;
        row.map(IdentityRow::into_record).transpose()
    }

    /// Delete an identity and its attendance events. Returns whether it existed.
    pub fn remove_identity(&self, id: &str) -> Result<bool, DbError> {
        let removed = self.conn.execute("DELETE FROM identities WHERE id = ?1", params![id])?;
        if removed > 0 {
            tracing::info!(id, "identity removed");
        }
        Ok(removed > 0)
    }

    /// Attendance events matching `filter`, newest first.
    pub fn list_events(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.id, a.identity_id, i.name, a.recorded_at
             FROM attendance a JOIN identities i ON i.id = a.identity_id
             WHERE (?1 IS NULL OR a.identity_id = ?1)
               AND (?2 IS NULL OR a.recorded_at >= ?2)
               AND (?3 IS NULL OR a.recorded_at <= ?3)
             ORDER BY a.recorded_at DESC, a.id DESC
             LIMIT ?4",
        )?;
        let events = stmt
            .query_map(
                params![
                    filter.identity_id,
                    filter.since.map(format_timestamp),
                    filter.until.map(format_timestamp),
                    filter.limit.unwrap_or(DEFAULT_EVENT_LIMIT),
                ],
                |row| {
                    Ok(AttendanceEvent {
                        id: row.get(0)?,
                        identity_id: row.get(1)?,
                        identity_name: row.get(2)?,
                        recorded_at: row.get(3)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn record_event_at(&self, identity_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = self.conn.execute(
            "INSERT INTO attendance (identity_id, recorded_at) VALUES (?1, ?2)",
            params![identity_id, format_timestamp(at)],
        );
        match result {
            Ok(_) => {
                tracing::info!(identity = identity_id, "attendance recorded");
                Ok(())
            }
            Err(err) if is_constraint_violation(&err) => {
                Err(StoreError::UnknownIdentity(identity_id.to_string()))
            }
            Err(err) => Err(DbError::from(err).into()),
        }
    }
}

impl IdentityStore for SqliteStore {
    fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let load = || -> Result<Vec<IdentityRecord>, DbError> {
            let mut stmt = self
                .conn
                .prepare("SELECT id, name, embedding, model, created_at FROM identities ORDER BY created_at")?;
            let rows = stmt
                .query_map([], read_identity_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(IdentityRow::into_record).collect()
        };
        Ok(load()?)
    }

    fn create_identity(&self, name: &str, embedding: &Embedding) -> Result<IdentityRecord, StoreError> {
        let record = IdentityRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            embedding: embedding.clone(),
            created_at: format_timestamp(Utc::now()),
        };
        let result = self.conn.execute(
            "INSERT INTO identities (id, name, embedding, model, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.name,
                encode_embedding(&embedding.values),
                embedding.model_version,
                record.created_at,
            ],
        );
        match result {
            Ok(_) => {
                tracing::debug!(id = %record.id, name, dim = embedding.dim(), "identity stored");
                Ok(record)
            }
            Err(err) if is_constraint_violation(&err) => Err(StoreError::Duplicate(name.to_string())),
            Err(err) => Err(DbError::from(err).into()),
        }
    }

    fn exists_by_name(&self, name: &str) -> Result<bool, StoreError> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM identities WHERE name = ?1)",
                params![name],
                |row| row.get(0),
            )
            .map_err(DbError::from)?;
        Ok(exists)
    }

    fn record_event(&self, identity_id: &str) -> Result<(), StoreError> {
        self.record_event_at(identity_id, Utc::now())
    }
}

struct IdentityRow {
    id: String,
    name: String,
    embedding: Vec<u8>,
    model: Option<String>,
    created_at: String,
}

impl IdentityRow {
    fn into_record(self) -> Result<IdentityRecord, DbError> {
        let values = decode_embedding(&self.embedding).ok_or_else(|| DbError::CorruptEmbedding {
            id: self.id.clone(),
            len: self.embedding.len(),
        })?;
        Ok(IdentityRecord {
            id: self.id,
            name: self.name,
            embedding: Embedding { values, model_version: self.model },
            created_at: self.created_at,
        })
    }
}

fn read_identity_row(row: &Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok(IdentityRow {
        id: row.get(0)?,
        name: row.get(1)?,
        embedding: row.get(2)?,
        model: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err.sqlite_error_code(), Some(ErrorCode::ConstraintViolation))
}

/// Fixed-width UTC timestamps so lexical order matches time order.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}
