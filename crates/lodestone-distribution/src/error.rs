//! Distributor error types.

use lodestone_store::{StoreError, TransactionalError};
use thiserror::Error;

/// Result type for distributor operations.
pub type Result<T> = std::result::Result<T, DistributionError>;

/// Errors raised inside the distributor.
///
/// The *expected-control* set unwinds the running instance back to the
/// bootstrap loop; everything else is fatal and kills the distributor so
/// the cluster controller can respawn a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistributionError {
    /// Another instance took the move-keys lock.
    #[error("move keys lock conflict")]
    MoveKeysConflict,

    /// The cluster configuration changed under us.
    #[error("distribution configuration changed")]
    ConfigChanged,

    /// An in-flight data move was cancelled.
    #[error("data move cancelled")]
    DataMoveCancelled,

    /// No healthy destination team could be found for a relocation.
    #[error("destination team not found")]
    DestTeamNotFound,

    /// Graceful shutdown requested through the control channel.
    #[error("distributor halted")]
    Halted,

    /// Invariant violation; always fatal.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DistributionError {
    /// True for errors that restart the bootstrap loop instead of killing
    /// the distributor.
    pub fn is_expected_control(&self) -> bool {
        matches!(
            self,
            Self::MoveKeysConflict
                | Self::ConfigChanged
                | Self::DataMoveCancelled
                | Self::DestTeamNotFound
        )
    }
}

impl TransactionalError for DistributionError {
    fn retryable_store_error(&self) -> Option<&StoreError> {
        match self {
            DistributionError::Store(e) if e.is_retryable() => Some(e),
            _ => None,
        }
    }
}
