//! System key layout.
//!
//! All distributor metadata lives under the `\xff` system prefix. Keys are
//! raw ordered bytes; multi-component keys append fixed-width big-endian
//! integers (so lexicographic order matches numeric order) or
//! escape-packed variable-length components.

use bytes::Bytes;
use lodestone_types::{AuditId, AuditType, KeyRange, MoveId, ServerId, TenantId};

/// The persisted distributor-mode byte.
pub const DD_MODE: &[u8] = b"\xff/ddMode";

/// Owner half of the move-keys lock.
pub const MOVE_KEYS_LOCK_OWNER: &[u8] = b"\xff/moveKeysLock/owner";

/// Writer-token half of the move-keys lock.
pub const MOVE_KEYS_LOCK_WRITE: &[u8] = b"\xff/moveKeysLock/write";

/// Set while a cluster snapshot is in flight; cleared when it finishes.
pub const WRITE_RECOVERY: &[u8] = b"\xff/writeRecovery";

/// Version stamped on every tenant mutation.
pub const LAST_TENANT_MODIFICATION: &[u8] = b"\xff/tenant/lastModification";

/// Allocation cursor for tenant ids.
pub const TENANT_LAST_ID: &[u8] = b"\xff/tenant/lastId";

/// Number of live tenants.
pub const TENANT_COUNT: &[u8] = b"\xff/tenant/count";

/// Tombstone-cleanup watermark record.
pub const TENANT_TOMBSTONE_CLEANUP: &[u8] = b"\xff/tenant/tombstoneCleanup";

const SHARD_MAP_PREFIX: &[u8] = b"\xff/shardMap/";
const DATA_MOVE_PREFIX: &[u8] = b"\xff/dataMoves/";
const AUDIT_PREFIX: &[u8] = b"\xff/audits/";
const AUDIT_PROGRESS_RANGE_PREFIX: &[u8] = b"\xff/auditProgress/range/";
const AUDIT_PROGRESS_SERVER_PREFIX: &[u8] = b"\xff/auditProgress/server/";
const TENANT_MAP_PREFIX: &[u8] = b"\xff/tenant/map/";
const TENANT_NAME_PREFIX: &[u8] = b"\xff/tenant/name/";
const TENANT_GROUP_PREFIX: &[u8] = b"\xff/tenant/group/";
const TENANT_GROUP_INDEX_PREFIX: &[u8] = b"\xff/tenant/groupIdx/";
const TENANT_TOMBSTONE_PREFIX: &[u8] = b"\xff/tenant/tombstone/";

// ============================================================================
// Helpers
// ============================================================================

/// The half-open range of all keys starting with `prefix`.
pub fn prefix_range(prefix: &[u8]) -> KeyRange {
    KeyRange::new(Bytes::copy_from_slice(prefix), prefix_end(prefix))
}

/// The first key after all keys starting with `prefix`.
///
/// # Panics
///
/// Panics if `prefix` is empty or all `0xff` (no successor exists).
pub fn prefix_end(prefix: &[u8]) -> Bytes {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last() {
        if *last < 0xff {
            *end.last_mut().expect("non-empty") += 1;
            return Bytes::from(end);
        }
        end.pop();
    }
    panic!("prefix has no successor");
}

/// Escape-packs a variable-length component: `0x00` becomes `0x00 0xff`,
/// and the component is terminated with `0x00`. Preserves lexicographic
/// order and keeps adjacent components unambiguous.
fn pack_component(out: &mut Vec<u8>, component: &[u8]) {
    for b in component {
        out.push(*b);
        if *b == 0 {
            out.push(0xff);
        }
    }
    out.push(0);
}

fn concat(parts: &[&[u8]]) -> Bytes {
    let len = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(len);
    for p in parts {
        out.extend_from_slice(p);
    }
    Bytes::from(out)
}

// ============================================================================
// Shard Map & Data Moves
// ============================================================================

/// Shard-map row for the shard beginning at `begin`.
pub fn shard_map_key(begin: &[u8]) -> Bytes {
    concat(&[SHARD_MAP_PREFIX, begin])
}

/// The whole shard-map subspace.
pub fn shard_map_range() -> KeyRange {
    prefix_range(SHARD_MAP_PREFIX)
}

/// Recovers the shard begin key from a shard-map row key.
pub fn shard_map_key_suffix(key: &[u8]) -> Option<&[u8]> {
    key.strip_prefix(SHARD_MAP_PREFIX)
}

/// Durable record for one data move.
pub fn data_move_key(id: MoveId) -> Bytes {
    concat(&[DATA_MOVE_PREFIX, id.as_uuid().as_bytes()])
}

/// The whole data-move subspace.
pub fn data_move_range() -> KeyRange {
    prefix_range(DATA_MOVE_PREFIX)
}

// ============================================================================
// Audits
// ============================================================================

/// Durable audit row, ordered by `(type, id)`.
pub fn audit_key(audit_type: AuditType, id: AuditId) -> Bytes {
    concat(&[
        AUDIT_PREFIX,
        &[audit_type.as_byte()],
        b"/",
        &id.as_u64().to_be_bytes(),
    ])
}

/// All audit rows of one type, in id order.
pub fn audit_type_range(audit_type: AuditType) -> KeyRange {
    let prefix = concat(&[AUDIT_PREFIX, &[audit_type.as_byte()], b"/"]);
    prefix_range(&prefix)
}

/// The whole audit subspace. Must fit in one system-range read.
pub fn audit_range() -> KeyRange {
    prefix_range(AUDIT_PREFIX)
}

/// Recovers the audit id from an audit row key.
pub fn audit_key_id(key: &[u8]) -> Option<AuditId> {
    let rest = key.strip_prefix(AUDIT_PREFIX)?;
    let id_bytes: [u8; 8] = rest.get(2..10)?.try_into().ok()?;
    Some(AuditId::new(u64::from_be_bytes(id_bytes)))
}

fn audit_progress_range_subprefix(audit_type: AuditType, id: AuditId) -> Bytes {
    concat(&[
        AUDIT_PROGRESS_RANGE_PREFIX,
        &[audit_type.as_byte()],
        b"/",
        &id.as_u64().to_be_bytes(),
        b"/",
    ])
}

/// Range-based progress row: keyed by the verified range's begin key.
pub fn audit_progress_range_key(audit_type: AuditType, id: AuditId, begin: &[u8]) -> Bytes {
    concat(&[&audit_progress_range_subprefix(audit_type, id), begin])
}

/// All range-based progress rows for one audit.
pub fn audit_progress_range_space(audit_type: AuditType, id: AuditId) -> KeyRange {
    prefix_range(&audit_progress_range_subprefix(audit_type, id))
}

/// Recovers the range begin key from a range-based progress row key.
pub fn audit_progress_range_suffix<'k>(
    audit_type: AuditType,
    id: AuditId,
    key: &'k [u8],
) -> Option<&'k [u8]> {
    key.strip_prefix(audit_progress_range_subprefix(audit_type, id).as_ref())
}

fn audit_progress_server_subprefix(audit_type: AuditType, id: AuditId, server: ServerId) -> Bytes {
    concat(&[
        AUDIT_PROGRESS_SERVER_PREFIX,
        &[audit_type.as_byte()],
        b"/",
        &id.as_u64().to_be_bytes(),
        b"/",
        server.as_uuid().as_bytes(),
        b"/",
    ])
}

/// Server-based progress row for per-server audits.
pub fn audit_progress_server_key(
    audit_type: AuditType,
    id: AuditId,
    server: ServerId,
    begin: &[u8],
) -> Bytes {
    concat(&[&audit_progress_server_subprefix(audit_type, id, server), begin])
}

/// All server-based progress rows for one audit, across all servers.
pub fn audit_progress_server_space(audit_type: AuditType, id: AuditId) -> KeyRange {
    let prefix = concat(&[
        AUDIT_PROGRESS_SERVER_PREFIX,
        &[audit_type.as_byte()],
        b"/",
        &id.as_u64().to_be_bytes(),
        b"/",
    ]);
    prefix_range(&prefix)
}

/// Every progress row for one audit, regardless of namespace.
pub fn audit_progress_space(audit_type: AuditType, id: AuditId) -> [KeyRange; 2] {
    [
        audit_progress_range_space(audit_type, id),
        audit_progress_server_space(audit_type, id),
    ]
}

// ============================================================================
// Tenants
// ============================================================================

/// Primary tenant row, keyed by id.
pub fn tenant_map_key(id: TenantId) -> Bytes {
    concat(&[TENANT_MAP_PREFIX, &id.as_i64().to_be_bytes()])
}

/// The whole tenant-map subspace, in id order.
pub fn tenant_map_range() -> KeyRange {
    prefix_range(TENANT_MAP_PREFIX)
}

/// Secondary index: tenant name to id.
pub fn tenant_name_key(name: &[u8]) -> Bytes {
    concat(&[TENANT_NAME_PREFIX, name])
}

/// The whole name-index subspace, in name order.
pub fn tenant_name_range() -> KeyRange {
    prefix_range(TENANT_NAME_PREFIX)
}

/// Recovers the tenant name from a name-index row key.
pub fn tenant_name_suffix(key: &[u8]) -> Option<&[u8]> {
    key.strip_prefix(TENANT_NAME_PREFIX)
}

/// Tenant-group row, keyed by group name.
pub fn tenant_group_key(group: &[u8]) -> Bytes {
    concat(&[TENANT_GROUP_PREFIX, group])
}

/// The whole group subspace.
pub fn tenant_group_range() -> KeyRange {
    prefix_range(TENANT_GROUP_PREFIX)
}

/// Recovers the group name from a group row key.
pub fn tenant_group_suffix(key: &[u8]) -> Option<&[u8]> {
    key.strip_prefix(TENANT_GROUP_PREFIX)
}

/// Group-membership index row for `(group, name)`; the value carries the id.
pub fn tenant_group_index_key(group: &[u8], name: &[u8]) -> Bytes {
    let mut out = TENANT_GROUP_INDEX_PREFIX.to_vec();
    pack_component(&mut out, group);
    pack_component(&mut out, name);
    Bytes::from(out)
}

/// All membership rows of one group.
pub fn tenant_group_index_range(group: &[u8]) -> KeyRange {
    let mut prefix = TENANT_GROUP_INDEX_PREFIX.to_vec();
    pack_component(&mut prefix, group);
    prefix_range(&prefix)
}

/// Tombstone marking a deleted tenant id on a data cluster.
pub fn tenant_tombstone_key(id: TenantId) -> Bytes {
    concat(&[TENANT_TOMBSTONE_PREFIX, &id.as_i64().to_be_bytes()])
}

/// The whole tombstone subspace, in id order.
pub fn tenant_tombstone_range() -> KeyRange {
    prefix_range(TENANT_TOMBSTONE_PREFIX)
}

/// Tombstones for all ids at or below `id`, used by watermark cleanup.
pub fn tenant_tombstone_range_through(id: TenantId) -> KeyRange {
    KeyRange::new(
        Bytes::copy_from_slice(TENANT_TOMBSTONE_PREFIX),
        tenant_tombstone_key(TenantId::new(id.as_i64() + 1)),
    )
}
