//! Store error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by checkpoint store implementations.
///
/// Callers retry transient errors per their retry policy; permanent errors
/// are surfaced to the processor's error handler.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A store call exceeded its per-try timeout.
    #[error("store operation timed out")]
    Timeout,

    /// A persisted record is missing required metadata or carries values
    /// that cannot be parsed.
    #[error("malformed store record: {0}")]
    InvalidRecord(String),

    /// The underlying blob store failed.
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl StoreError {
    /// Whether the error is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout => true,
            StoreError::InvalidRecord(_) => false,
            StoreError::ObjectStore(e) => matches!(e, object_store::Error::Generic { .. }),
        }
    }
}
