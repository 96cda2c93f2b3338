//! Store error types.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur against the system keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The read set conflicted with a concurrent commit. Retryable.
    #[error("transaction not committed due to conflict")]
    NotCommitted,

    /// The commit outcome is unknown; it may or may not have applied.
    /// Retryable, but only by idempotent mutators.
    #[error("transaction commit result unknown")]
    CommitUnknown,

    /// The transaction's read version fell out of the conflict window.
    #[error("transaction too old")]
    TransactionTooOld,

    /// A persisted value failed to decode.
    #[error("codec error: {0}")]
    Codec(String),
}

impl StoreError {
    /// True for errors the [`crate::run_transaction`] loop absorbs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotCommitted | Self::CommitUnknown | Self::TransactionTooOld
        )
    }
}
