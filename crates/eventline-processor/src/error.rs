//! Processor error types.
//!
//! ## Error Categories
//!
//! ### Configuration errors
//! - `Config`: invalid builder input, start while a stop is in progress,
//!   handler mutation while running
//! - `DuplicateHandler` / `MissingHandler`: handler registration rules
//!
//! ### Logic errors
//! - `MissingPosition`: checkpoint requested for an event that carries no
//!   offset or sequence number
//!
//! ### Wrapped errors
//! - `Store`: checkpoint store failure
//! - `Transport`: event hub transport failure
//! - `Processing`: an error returned by the user's event handler

use crate::transport::TransportError;
use eventline_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Error type returned by user event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the event processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Invalid configuration or lifecycle misuse.
    #[error("configuration error: {0}")]
    Config(String),

    /// A handler slot was assigned twice without being cleared.
    #[error("handler already registered: {0}")]
    DuplicateHandler(&'static str),

    /// A mandatory handler was not registered before start.
    #[error("missing mandatory handler: {0}")]
    MissingHandler(&'static str),

    /// Checkpoint requested for an event without a position.
    #[error("event carries no position to checkpoint")]
    MissingPosition,

    /// The checkpoint store failed.
    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),

    /// The event hub transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The user's event handler returned an error.
    #[error("event handler failed: {0}")]
    Processing(#[source] HandlerError),
}

/// The operation an error surfaced from, reported to the error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOperation {
    ListOwnership,
    ClaimOwnership,
    RenewOwnership,
    ListCheckpoints,
    GetPartitionIds,
    ReadEvents,
}

impl std::fmt::Display for ErrorOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorOperation::ListOwnership => "ListOwnership",
            ErrorOperation::ClaimOwnership => "ClaimOwnership",
            ErrorOperation::RenewOwnership => "RenewOwnership",
            ErrorOperation::ListCheckpoints => "ListCheckpoints",
            ErrorOperation::GetPartitionIds => "GetPartitionIds",
            ErrorOperation::ReadEvents => "ReadEvents",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_tags() {
        assert_eq!(ErrorOperation::ListOwnership.to_string(), "ListOwnership");
        assert_eq!(ErrorOperation::RenewOwnership.to_string(), "RenewOwnership");
        assert_eq!(ErrorOperation::ReadEvents.to_string(), "ReadEvents");
    }

    #[test]
    fn test_processing_error_preserves_message() {
        let inner: HandlerError = "bad payload".into();
        let error = ProcessorError::Processing(inner);
        assert!(error.to_string().contains("bad payload"));
    }
}
