//! Domain errors shared across the store.
//!
//! Components return these typed errors; only the HTTP dispatcher turns them
//! into wire responses.

use crate::path::ResourceKind;
use perch_index::QueryCancelled;
use thiserror::Error;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by collection, holder and document operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// PUT on a database or nested collection name that is already taken.
    #[error("Database already exists")]
    CollectionExists,

    /// Conditional overwrite lost: the supplied timestamp does not match the
    /// document's current modification time.
    #[error("stale timestamp")]
    StaleTimestamp,

    /// The addressed resource does not exist.
    #[error("{0} not found")]
    Absent(ResourceKind),

    /// The body was rejected by the active schema.
    #[error("document did not conform to schema: {0}")]
    SchemaViolation(String),

    /// A range query could not complete a stable pass before cancellation.
    #[error("range query cancelled")]
    Cancelled,

    /// An invariant was violated; never the caller's fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<QueryCancelled> for StoreError {
    fn from(_: QueryCancelled) -> Self {
        StoreError::Cancelled
    }
}
