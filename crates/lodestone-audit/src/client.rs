//! Collaborator interfaces: storage-server RPC and cluster topology.
//!
//! The audit engine drives storage servers but does not own them. Tests
//! satisfy these traits with scripted fakes; the production wiring hands in
//! the real RPC stack.

use std::future::Future;
use std::pin::Pin;

use lodestone_types::{AuditId, AuditType, KeyRange, ServerId, StorageServerMeta};
use thiserror::Error;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One audit task sent to a storage server.
#[derive(Debug, Clone)]
pub struct AuditTaskRequest {
    pub audit_type: AuditType,
    pub audit_id: AuditId,
    /// The range the executor must verify.
    pub range: KeyRange,
    /// Peers the executor compares itself against. Empty for
    /// location-metadata and per-server audits.
    pub targets: Vec<ServerId>,
}

/// How an audit task ended on the storage-server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuditTaskError {
    /// The task ran and found a genuine mismatch.
    #[error("audit task found an inconsistency")]
    Inconsistency,

    /// The task could not run to completion (server busy, moving data,
    /// transient fault). The range is rescheduled.
    #[error("audit task failed")]
    Failed,
}

/// RPC surface of a storage server, as the audit engine sees it.
pub trait StorageServerClient: Send + Sync {
    /// Asks `executor` to verify `request.range`, comparing against
    /// `request.targets` where the audit type calls for peers.
    fn audit_storage(
        &self,
        executor: ServerId,
        request: AuditTaskRequest,
    ) -> BoxFuture<'_, Result<(), AuditTaskError>>;
}

/// Read access to cluster topology.
pub trait ServerDirectory: Send + Sync {
    /// All storage servers currently registered.
    fn servers(&self) -> Vec<StorageServerMeta>;

    /// Whether `id` is still a cluster member. Consulted before counting a
    /// per-server task failure against a server that was removed mid-audit.
    fn server_exists(&self, id: ServerId) -> bool;

    /// The servers holding replicas of `range`.
    fn replicas_for(&self, range: &KeyRange) -> Vec<StorageServerMeta>;
}
