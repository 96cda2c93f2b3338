//! Audit error types.

use lodestone_store::{StoreError, TransactionalError};
use thiserror::Error;

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;

/// Errors raised by the audit engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    /// The audit could not run or make progress. Unwinds to the caller as an
    /// expected-control error, never fatally.
    #[error("audit storage failed")]
    Failed,

    /// The audit was cancelled while in flight.
    #[error("audit storage cancelled")]
    Cancelled,

    /// An audit of the requested type is already live with a different
    /// range.
    #[error("audit request limit exceeded for this type")]
    ExceededRequestLimit,

    /// No persisted audit row matches the request.
    #[error("audit not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuditError {
    /// True for definitive answers a control-plane client should see.
    pub fn is_client_visible(&self) -> bool {
        matches!(self, Self::ExceededRequestLimit | Self::NotFound)
    }

    /// True for errors that unwind the audit without being fatal.
    pub fn is_expected_control(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

impl TransactionalError for AuditError {
    fn retryable_store_error(&self) -> Option<&StoreError> {
        match self {
            AuditError::Store(e) if e.is_retryable() => Some(e),
            _ => None,
        }
    }
}
