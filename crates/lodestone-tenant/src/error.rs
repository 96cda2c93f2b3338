//! Tenant error types.

use lodestone_store::StoreError;
use thiserror::Error;

/// Result type for tenant operations.
pub type Result<T> = std::result::Result<T, TenantError>;

/// Errors surfaced by the tenant lifecycle API.
///
/// Everything except `Store`, `Timeout`, and `Inconsistent` is
/// client-visible: a definitive answer about the requested transition, not
/// a fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenantError {
    #[error("tenant already exists")]
    AlreadyExists,

    #[error("tenant not found")]
    NotFound,

    #[error("tenant is not empty")]
    NotEmpty,

    #[error("tenant is locked by another owner")]
    Locked,

    #[error("invalid tenant name")]
    InvalidName,

    #[error("invalid tenant group name")]
    InvalidGroupName,

    #[error("cluster has no capacity for another tenant")]
    ClusterNoCapacity,

    #[error("tenants are disabled on this cluster")]
    TenantsDisabled,

    #[error("operation not valid for this cluster's metacluster role")]
    InvalidMetaclusterOperation,

    /// The allocated tenant prefix already contains user data.
    #[error("tenant prefix allocator conflict")]
    PrefixAllocatorConflict,

    /// A tombstone for this id blocks re-creation on a data cluster.
    #[error("tenant creation blocked by tombstone")]
    CreationBlocked,

    /// The tombstone-cleanup watermark has passed this id; whether it was
    /// deleted can no longer be determined.
    #[error("tenant creation permanently failed")]
    CreationPermanentlyFailed,

    /// The operation exceeded the driver timeout.
    #[error("tenant operation timed out")]
    Timeout,

    /// The persisted tenant indexes disagree with each other.
    #[error("tenant metadata inconsistent: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TenantError {
    /// True for definitive per-request answers a caller should see.
    pub fn is_client_visible(&self) -> bool {
        !matches!(
            self,
            Self::Store(_) | Self::Timeout | Self::Inconsistent(_)
        )
    }
}
