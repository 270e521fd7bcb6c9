//! Component-internal error types.
//!
//! Callers branch on these; the wiring layer in `main.rs` wraps everything
//! else in `anyhow::Result` with `.context(...)`.

use thiserror::Error;

/// Outcome of a storage gateway write or read.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Insert outcome, distinguishing the idempotent-duplicate case from real errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    Duplicate,
}

/// Errors an ingester can raise. `Fatal` stops the ingester; `Transient`
/// triggers backoff and is otherwise swallowed (logged, counted).
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("authentication failed: {0}")]
    Fatal(String),

    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IngestError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Fatal(_))
    }
}
