//! The identity store boundary.
//!
//! The pipeline reads enrolled vectors and appends identities and attendance
//! events through this trait. Each write must be atomic on the store side.

use thiserror::Error;

use crate::embedding::Embedding;
use crate::types::IdentityRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("an identity named {0:?} already exists")]
    Duplicate(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("identity store backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub trait IdentityStore {
    /// Every enrolled identity with its stored vector.
    fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    /// Persist a new identity and return it with its assigned id.
    fn create_identity(&self, name: &str, embedding: &Embedding) -> Result<IdentityRecord, StoreError>;

    fn exists_by_name(&self, name: &str) -> Result<bool, StoreError>;

    /// Append one attendance event for the identity.
    fn record_event(&self, identity_id: &str) -> Result<(), StoreError>;
}
