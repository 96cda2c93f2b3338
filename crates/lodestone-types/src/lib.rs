//! # lodestone-types: Core types for the Lodestone data distributor
//!
//! This crate contains shared types used across the distributor:
//! - Entity IDs ([`DistributorId`], [`ServerId`], [`MoveId`], [`AuditId`], [`TenantId`])
//! - Key-space types ([`KeyRange`] and the keyspace boundary constants)
//! - Storage-server metadata ([`StorageServerMeta`], [`Locality`], [`StorageEngine`])
//! - Replication teams ([`Team`])
//! - Durable data-move records ([`DataMoveMetadata`])
//! - Audit records ([`AuditState`], [`AuditType`], [`AuditPhase`], [`RangePhase`])
//! - Tenant records ([`TenantMapEntry`], [`TenantGroupEntry`], [`TenantLockState`])
//! - Distributor mode and the move-keys lock ([`DdMode`], [`MoveKeysLock`])
//! - Relocation priorities ([`RelocatePriority`], [`RelocateReason`])

use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod range;

pub use range::KeyRange;

// ============================================================================
// Entity IDs
// ============================================================================

/// Unique identifier for a data-distributor instance.
///
/// A fresh id is minted every time a distributor boots; the move-keys lock
/// records which instance currently owns the shard map.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct DistributorId(Uuid);

impl DistributorId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for DistributorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DistributorId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Stable 128-bit identifier for a storage server process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ServerId(Uuid);

impl ServerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ServerId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Identifier for a durable data move.
///
/// The nil UUID is reserved for *anonymous* moves: shard-map destination
/// entries written by a distributor generation that did not persist a
/// matching data-move record. Anonymous moves cannot be resumed and are
/// re-planned from scratch at bootstrap.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MoveId(Uuid);

impl MoveId {
    /// The anonymous move id (nil UUID).
    pub const ANONYMOUS: MoveId = MoveId(Uuid::nil());

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns true for destination entries with no persisted move record.
    pub fn is_anonymous(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for MoveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MoveId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Identifier for a cluster-wide snapshot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(Uuid);

impl SnapshotId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SnapshotId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Monotonically increasing identifier for an audit, unique per audit type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AuditId(u64);

impl AuditId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The next id in this type's keyspace.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for AuditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for AuditId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Unique identifier for a tenant.
///
/// **Bit layout**: the high 16 bits are a cluster-assigned prefix, the low
/// 48 bits a per-cluster counter. Ids are allocated sequentially from
/// `prefix << 48` so that every data cluster in a metacluster mints ids in
/// its own disjoint band.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TenantId(i64);

impl TenantId {
    /// First id in the band owned by `prefix`.
    pub fn first_in_prefix(prefix: u16) -> Self {
        Self(i64::from(prefix) << 48)
    }

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// The cluster prefix this id was allocated under (high 16 bits).
    pub fn prefix(&self) -> u16 {
        ((self.0 as u64) >> 48) as u16
    }

    /// The byte prefix reserving this tenant's subspace: `\x02` followed by
    /// the big-endian id.
    pub fn key_prefix(&self) -> Bytes {
        let mut out = Vec::with_capacity(9);
        out.push(0x02);
        out.extend_from_slice(&self.0.to_be_bytes());
        Bytes::from(out)
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TenantId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Distributor Mode & Move-Keys Lock
// ============================================================================

/// The persisted distributor mode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DdMode {
    /// Data distribution is disabled; the bootstrap loop parks.
    Disabled = 0,
    /// Normal operation.
    Enabled = 1,
    /// Security quiesce (snapshot in progress); bootstrap parks after taking
    /// the lock.
    SecurityQuiesce = 2,
}

impl DdMode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Disabled),
            1 => Some(Self::Enabled),
            2 => Some(Self::SecurityQuiesce),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The two-key CAS-protected singleton lock over the shard map.
///
/// `prev_owner`/`prev_write` are the values observed when the lock was read;
/// `my_owner` is the id written when it was taken. Every mutating shard-map
/// transaction re-reads both keys and fails with a move-keys conflict if
/// either has changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MoveKeysLock {
    pub prev_owner: DistributorId,
    pub prev_write: Uuid,
    pub my_owner: DistributorId,
}

// ============================================================================
// Storage Servers & Teams
// ============================================================================

/// Fault-domain tags for a storage server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Locality {
    /// Data-center id. Multi-region deployments place primary and remote
    /// teams in distinct data centers.
    pub dc: String,
    /// Failure zone within the data center. Teams never place two replicas
    /// in one zone.
    pub zone: String,
    /// Physical machine id.
    pub machine: String,
}

impl Locality {
    pub fn new(dc: impl Into<String>, zone: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            dc: dc.into(),
            zone: zone.into(),
            machine: machine.into(),
        }
    }
}

/// The storage engine a server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StorageEngine {
    #[default]
    SsdBtreeV2,
    Memory,
    Rocksdb,
    ShardedRocksdb,
}

impl StorageEngine {
    /// Engines that persist shard-location metadata locally and therefore
    /// participate in physical-shard grouping.
    pub fn encodes_location_metadata(self) -> bool {
        matches!(self, Self::ShardedRocksdb)
    }
}

impl Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SsdBtreeV2 => "ssd-btree-v2",
            Self::Memory => "memory",
            Self::Rocksdb => "rocksdb",
            Self::ShardedRocksdb => "sharded-rocksdb",
        };
        write!(f, "{s}")
    }
}

/// Interface record for a storage server, as tracked by the distributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerMeta {
    pub id: ServerId,
    /// Network address, kept opaque to the control plane.
    pub addr: String,
    pub locality: Locality,
    pub engine: StorageEngine,
    /// Unix seconds at which the server joined the cluster.
    pub created_at: u64,
    /// Set when the server's engine disagrees with the configured engine;
    /// such servers are wiggled out first.
    pub wrong_configured: bool,
    /// Testing-storage-server pair member; excluded from per-server audits.
    pub is_tss: bool,
}

/// An ordered set of storage servers co-holding one replica group.
///
/// Size equals the configured replication factor; members are pairwise
/// zone-diverse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Team {
    servers: Vec<ServerId>,
}

impl Team {
    /// Builds a team, normalizing member order so that equal member sets
    /// compare equal.
    pub fn new(mut servers: Vec<ServerId>) -> Self {
        servers.sort_unstable();
        servers.dedup();
        Self { servers }
    }

    pub fn servers(&self) -> &[ServerId] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.servers.binary_search(&id).is_ok()
    }

    /// True if any member of `ids` is on this team.
    pub fn overlaps(&self, ids: &[ServerId]) -> bool {
        ids.iter().any(|id| self.contains(*id))
    }
}

impl Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, s) in self.servers.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{s}")?;
        }
        write!(f, "]")
    }
}

// ============================================================================
// Data Moves
// ============================================================================

/// Durable record of an intended or in-flight shift of key ranges between
/// teams. Survives distributor restart; resumed or cancelled at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMoveMetadata {
    pub id: MoveId,
    /// The ranges this move covers. Every covered shard's destination entry
    /// must carry `id`.
    pub ranges: Vec<KeyRange>,
    /// Destination servers in the primary region.
    pub primary_dest: Vec<ServerId>,
    /// Destination servers in the remote region, empty on single-region
    /// deployments.
    pub remote_dest: Vec<ServerId>,
    /// A cancelled move is unwound, not resumed.
    pub cancelled: bool,
}

impl DataMoveMetadata {
    pub fn new(id: MoveId, ranges: Vec<KeyRange>) -> Self {
        Self {
            id,
            ranges,
            primary_dest: Vec::new(),
            remote_dest: Vec::new(),
            cancelled: false,
        }
    }

    /// An in-flight move: not cancelled and carrying at least one range and
    /// a primary destination.
    pub fn is_valid(&self) -> bool {
        !self.cancelled && !self.ranges.is_empty() && !self.primary_dest.is_empty()
    }
}

// ============================================================================
// Audits
// ============================================================================

/// What an audit verifies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum AuditType {
    /// Replicas of every key within one region are byte-identical.
    ReplicaConsistency = 0,
    /// Replicas across regions are identical.
    HaConsistency = 1,
    /// Authoritative shard-location metadata agrees with storage-server
    /// self-reports.
    LocationMetadata = 2,
    /// Each storage server's local shard map matches the global map.
    PerServerShardMap = 3,
}

impl AuditType {
    pub const ALL: [AuditType; 4] = [
        AuditType::ReplicaConsistency,
        AuditType::HaConsistency,
        AuditType::LocationMetadata,
        AuditType::PerServerShardMap,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::ReplicaConsistency),
            1 => Some(Self::HaConsistency),
            2 => Some(Self::LocationMetadata),
            3 => Some(Self::PerServerShardMap),
            _ => None,
        }
    }

    /// Per-server audits persist progress under the server-based prefix;
    /// every other type uses the range-based prefix.
    pub fn progress_is_per_server(self) -> bool {
        matches!(self, Self::PerServerShardMap)
    }
}

impl Display for AuditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReplicaConsistency => "replica-consistency",
            Self::HaConsistency => "ha-consistency",
            Self::LocationMetadata => "location-metadata",
            Self::PerServerShardMap => "per-server-shard-map",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle phase of an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditPhase {
    /// In flight; owns its progress records. A `Running` row with no live
    /// actor is resumed by the next distributor.
    Running,
    /// Finished without mismatches; progress records cleared.
    Complete,
    /// Gave up after exhausting the retry budget, or cancelled; progress
    /// records retained for post-mortem.
    Failed,
    /// Finished having found at least one inconsistency; progress records
    /// retained.
    Error,
}

impl AuditPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Error)
    }
}

impl Display for AuditPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Durable audit row, persisted under `audit/(type, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditState {
    pub id: AuditId,
    pub audit_type: AuditType,
    pub range: KeyRange,
    pub phase: AuditPhase,
    /// The distributor generation driving this audit. Rewritten on resume.
    pub dd_id: DistributorId,
}

impl AuditState {
    pub fn new(id: AuditId, audit_type: AuditType, range: KeyRange, dd_id: DistributorId) -> Self {
        Self {
            id,
            audit_type,
            range,
            phase: AuditPhase::Running,
            dd_id,
        }
    }
}

/// Per-range progress value for an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RangePhase {
    /// Not yet verified; dispatch picks these up.
    #[default]
    Invalid,
    /// Verified clean.
    Complete,
    /// Verified, mismatch found.
    Error,
}

// ============================================================================
// Relocation Priorities
// ============================================================================

/// Priority of a pending shard relocation. Higher values run first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RelocatePriority(u16);

impl RelocatePriority {
    /// Space reclamation; always yields.
    pub const MERGE: RelocatePriority = RelocatePriority(100);
    /// Load smoothing across teams.
    pub const REBALANCE: RelocatePriority = RelocatePriority(200);
    /// Resumption or re-planning of an interrupted move.
    pub const RECOVER_MOVE: RelocatePriority = RelocatePriority(300);
    /// Oversized shard split.
    pub const SPLIT: RelocatePriority = RelocatePriority(400);
    /// Data on a team that lost a member or violates the replication policy.
    pub const TEAM_UNHEALTHY: RelocatePriority = RelocatePriority(500);
    /// Operator-forced move (failed-server drain, exclusion).
    pub const ENFORCE_MOVE: RelocatePriority = RelocatePriority(600);

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl Display for RelocatePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a relocation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelocateReason {
    Split,
    Merge,
    Rebalance,
    TeamUnhealthy,
    RecoverMove,
    Drain,
}

impl RelocateReason {
    /// The default priority ladder for this reason.
    pub fn priority(self) -> RelocatePriority {
        match self {
            Self::Merge => RelocatePriority::MERGE,
            Self::Rebalance => RelocatePriority::REBALANCE,
            Self::RecoverMove => RelocatePriority::RECOVER_MOVE,
            Self::Split => RelocatePriority::SPLIT,
            Self::TeamUnhealthy => RelocatePriority::TEAM_UNHEALTHY,
            Self::Drain => RelocatePriority::ENFORCE_MOVE,
        }
    }
}

// ============================================================================
// Tenants
// ============================================================================

/// Whether tenants are enforced on this cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TenantMode {
    /// Tenant operations fail.
    #[default]
    Disabled,
    /// Tenants may exist; raw keyspace access is still allowed.
    Optional,
    /// All user data must live inside a tenant.
    Required,
}

/// Role of this cluster in a (possible) metacluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClusterType {
    /// Not part of a metacluster.
    #[default]
    Standalone,
    /// The management tier of a metacluster.
    MetaclusterManagement,
    /// A data cluster within a metacluster. Deletions write tombstones to
    /// block id reanimation.
    MetaclusterData,
}

/// Access lock on a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TenantLockState {
    #[default]
    Unlocked,
    /// Reads allowed, writes rejected.
    ReadOnly,
    /// All access rejected.
    Locked,
}

/// The durable per-tenant record, persisted under `tenant/map/id`.
///
/// Invariant: `lock_owner.is_some() ⇔ lock_state != Unlocked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMapEntry {
    pub id: TenantId,
    pub name: Bytes,
    pub tenant_group: Option<Bytes>,
    pub lock_state: TenantLockState,
    /// Identity of the lock holder; present exactly when locked.
    pub lock_owner: Option<Uuid>,
    /// Bumped on every configure so concurrent configures serialize visibly.
    pub configure_sequence: u64,
    /// Bytes this tenant may store; `None` means unlimited.
    pub storage_quota: Option<u64>,
}

impl TenantMapEntry {
    pub fn new(id: TenantId, name: Bytes) -> Self {
        Self {
            id,
            name,
            tenant_group: None,
            lock_state: TenantLockState::Unlocked,
            lock_owner: None,
            configure_sequence: 0,
            storage_quota: None,
        }
    }

    /// The byte prefix owning this tenant's data.
    pub fn prefix(&self) -> Bytes {
        self.id.key_prefix()
    }

    /// Checks the lock-owner/lock-state pairing invariant.
    pub fn lock_fields_consistent(&self) -> bool {
        self.lock_owner.is_some() == (self.lock_state != TenantLockState::Unlocked)
    }
}

/// Durable per-group record. A group row exists iff at least one tenant
/// references the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TenantGroupEntry {}

#[cfg(test)]
mod tests;
