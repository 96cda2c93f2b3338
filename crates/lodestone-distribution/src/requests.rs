//! The distributor's control-plane request surface.
//!
//! Every request is one variant of a tagged union carrying its own reply
//! channel; the main loop dispatches them sequentially. [`DistributorClient`]
//! wraps the channel in a typed async API for callers.

use std::collections::HashMap;

use bytes::Bytes;
use lodestone_types::{
    AuditId, AuditType, DistributorId, KeyRange, ServerId, SnapshotId, TenantId,
};
use tokio::sync::{mpsc, oneshot};

use crate::snapshot::SnapshotError;
use crate::tracker::ShardMetrics;
use crate::wiggle::WigglerState;

/// Per-shard sample returned by the metrics request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSample {
    pub range: KeyRange,
    pub metrics: ShardMetrics,
}

/// Reply to [`DistributorRequest::GetMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsReply {
    Shards(Vec<ShardSample>),
    /// Median shard size in bytes, for `mid_only` requests.
    MedianShardSize(u64),
}

/// Wiggler state across regions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WigglerStates {
    pub primary: WigglerState,
    pub remote: Option<WigglerState>,
}

/// Outcome of a blob-restore admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobRestoreStatus {
    Success,
    /// Another blob restore is already admitted.
    ConflictBlobRestore,
    /// A cluster snapshot is in flight.
    ConflictSnapshot,
}

/// One control-plane request to the distributor.
#[derive(Debug)]
pub enum DistributorRequest {
    /// Graceful shutdown.
    Halt {
        requester: DistributorId,
        reply: oneshot::Sender<()>,
    },
    /// Per-shard metrics over a range, or the median shard size.
    GetMetrics {
        range: KeyRange,
        shard_limit: usize,
        mid_only: bool,
        reply: oneshot::Sender<MetricsReply>,
    },
    /// Drive (or deduplicate) a cluster snapshot.
    Snapshot {
        id: SnapshotId,
        payload: Bytes,
        reply: oneshot::Sender<std::result::Result<(), SnapshotError>>,
    },
    /// Would excluding these addresses leave the cluster healthy?
    ExclusionSafetyCheck {
        addresses: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    GetWigglerState {
        reply: oneshot::Sender<WigglerStates>,
    },
    /// Launch an audit, or cancel one by id.
    TriggerAudit {
        range: KeyRange,
        audit_type: AuditType,
        cancel: Option<AuditId>,
        reply: oneshot::Sender<std::result::Result<AuditId, lodestone_audit::AuditError>>,
    },
    /// Tenants whose recorded usage exceeds their quota.
    TenantsOverQuota {
        usage: HashMap<TenantId, u64>,
        reply: oneshot::Sender<Vec<TenantId>>,
    },
    /// Admit a blob restore; success forces a distributor restart.
    PrepareBlobRestore {
        range: KeyRange,
        requester: DistributorId,
        reply: oneshot::Sender<BlobRestoreStatus>,
    },
    /// Remove a failed storage server: drain its key-ownership rows onto
    /// healthy teams, then restart the distributor without it. Replies with
    /// the number of shards drained.
    RemoveFailedServer {
        id: ServerId,
        reply: oneshot::Sender<std::result::Result<usize, crate::DistributionError>>,
    },
}

/// Typed client over the distributor's request channel.
#[derive(Clone)]
pub struct DistributorClient {
    tx: mpsc::Sender<DistributorRequest>,
}

/// The request channel went away (distributor dead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("distributor unavailable")]
pub struct Unavailable;

impl DistributorClient {
    pub fn new(tx: mpsc::Sender<DistributorRequest>) -> Self {
        Self { tx }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DistributorRequest,
    ) -> Result<T, Unavailable> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| Unavailable)?;
        rx.await.map_err(|_| Unavailable)
    }

    pub async fn halt(&self, requester: DistributorId) -> Result<(), Unavailable> {
        self.call(|reply| DistributorRequest::Halt { requester, reply }).await
    }

    pub async fn get_metrics(
        &self,
        range: KeyRange,
        shard_limit: usize,
        mid_only: bool,
    ) -> Result<MetricsReply, Unavailable> {
        self.call(|reply| DistributorRequest::GetMetrics {
            range,
            shard_limit,
            mid_only,
            reply,
        })
        .await
    }

    pub async fn snapshot(
        &self,
        id: SnapshotId,
        payload: Bytes,
    ) -> Result<std::result::Result<(), SnapshotError>, Unavailable> {
        self.call(|reply| DistributorRequest::Snapshot { id, payload, reply }).await
    }

    pub async fn exclusion_safety_check(
        &self,
        addresses: Vec<String>,
    ) -> Result<bool, Unavailable> {
        self.call(|reply| DistributorRequest::ExclusionSafetyCheck { addresses, reply })
            .await
    }

    pub async fn wiggler_state(&self) -> Result<WigglerStates, Unavailable> {
        self.call(|reply| DistributorRequest::GetWigglerState { reply }).await
    }

    pub async fn trigger_audit(
        &self,
        range: KeyRange,
        audit_type: AuditType,
        cancel: Option<AuditId>,
    ) -> Result<std::result::Result<AuditId, lodestone_audit::AuditError>, Unavailable> {
        self.call(|reply| DistributorRequest::TriggerAudit {
            range,
            audit_type,
            cancel,
            reply,
        })
        .await
    }

    pub async fn tenants_over_quota(
        &self,
        usage: HashMap<TenantId, u64>,
    ) -> Result<Vec<TenantId>, Unavailable> {
        self.call(|reply| DistributorRequest::TenantsOverQuota { usage, reply }).await
    }

    pub async fn prepare_blob_restore(
        &self,
        range: KeyRange,
        requester: DistributorId,
    ) -> Result<BlobRestoreStatus, Unavailable> {
        self.call(|reply| DistributorRequest::PrepareBlobRestore {
            range,
            requester,
            reply,
        })
        .await
    }

    pub async fn remove_failed_server(
        &self,
        id: ServerId,
    ) -> Result<std::result::Result<usize, crate::DistributionError>, Unavailable> {
        self.call(|reply| DistributorRequest::RemoveFailedServer { id, reply }).await
    }
}

/// Resolves excluded addresses to server ids using the registered metadata.
pub fn resolve_addresses(
    addresses: &[String],
    servers: &[lodestone_types::StorageServerMeta],
) -> Vec<ServerId> {
    servers
        .iter()
        .filter(|s| addresses.iter().any(|a| s.addr == *a || s.addr.starts_with(a.as_str())))
        .map(|s| s.id)
        .collect()
}
