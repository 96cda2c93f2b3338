//! # lodestone-tenant: transactional tenant lifecycle
//!
//! A tenant is a logical, byte-prefixed subspace of the keyspace with its
//! own identity, optional group membership, and lockable access state.
//! This crate implements the tenant state machine: create, delete,
//! configure, rename, and lock transitions, each mediated by one
//! conflict-detecting transaction so that concurrent mutators on the same
//! tenant serialize to some valid interleaving, never a torn state.
//!
//! # Metaclusters
//!
//! A cluster is standalone, the management tier of a metacluster, or a data
//! cluster within one. Data clusters receive tenant ids assigned by the
//! management tier and write *tombstones* on deletion so a racing creation
//! with a recycled id cannot reanimate dead data.
//!
//! # Invariants (checked at every commit boundary)
//!
//! - the by-name index and the by-id map agree,
//! - a group row exists iff at least one tenant references the group,
//! - `lock_owner` is present iff `lock_state != Unlocked`,
//! - the live-tenant count matches the map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use lodestone_config::{DatabaseConfiguration, Knobs};
use lodestone_store::{keys, run_transaction, SystemStore, Transaction, TransactionalError};
use lodestone_types::{
    ClusterType, KeyRange, TenantGroupEntry, TenantId, TenantLockState, TenantMapEntry, TenantMode,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod error;

pub use error::{Result, TenantError};

impl TransactionalError for TenantError {
    fn retryable_store_error(&self) -> Option<&lodestone_store::StoreError> {
        match self {
            TenantError::Store(e) if e.is_retryable() => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// How a created tenant gets its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdAssignment {
    /// Allocate the next id from this cluster's band. Valid on standalone
    /// and management clusters.
    Allocate,
    /// Use an id assigned by the management tier. Valid on data clusters.
    Assigned(TenantId),
}

/// Field updates applied by [`TenantManager::configure`]. `None` leaves the
/// field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct TenantConfigUpdate {
    pub tenant_group: Option<Option<Bytes>>,
    pub storage_quota: Option<Option<u64>>,
}

/// Durable tombstone-cleanup bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
struct TombstoneCleanupData {
    /// Ids at or below this are permanently unavailable for creation.
    watermark: i64,
    /// Unix seconds of the last watermark advance.
    last_cleanup: u64,
}

// ============================================================================
// Manager
// ============================================================================

type ClockFn = dyn Fn() -> u64 + Send + Sync;

/// The tenant lifecycle API, bound to one cluster's store and configuration.
#[derive(Clone)]
pub struct TenantManager {
    store: SystemStore,
    cluster_type: ClusterType,
    tenant_mode: TenantMode,
    tenant_id_prefix: u16,
    max_tenants: u64,
    tombstone_cleanup_interval: u64,
    op_timeout: Duration,
    id_skew_max: u64,
    clock: Arc<ClockFn>,
}

impl TenantManager {
    pub fn new(store: SystemStore, db: &DatabaseConfiguration, knobs: &Knobs) -> Self {
        Self {
            store,
            cluster_type: db.cluster_type,
            tenant_mode: db.tenant_mode,
            tenant_id_prefix: db.tenant_id_prefix,
            max_tenants: db.max_tenants_per_cluster,
            tombstone_cleanup_interval: knobs.tenant_tombstone_cleanup_interval_sec,
            op_timeout: Duration::from_secs(knobs.tenant_op_timeout_sec),
            id_skew_max: knobs.tenant_id_skew_max,
            clock: Arc::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs())
            }),
        }
    }

    /// Replaces the wall clock, for tombstone-interval tests.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    /// Creates a tenant. Returns the committed entry.
    pub async fn create(
        &self,
        name: impl Into<Bytes>,
        group: Option<Bytes>,
        assignment: IdAssignment,
    ) -> Result<TenantMapEntry> {
        let name = name.into();
        validate_tenant_name(&name)?;
        if let Some(group) = &group {
            validate_group_name(group)?;
        }
        self.check_assignment(assignment)?;

        let now = (self.clock)();
        let manager = self.clone();
        let entry = self
            .with_timeout(run_transaction(&self.store, move |tx| {
                manager.check_mode()?;
                manager.create_in_tx(tx, &name, group.as_ref(), assignment, now)
            }))
            .await?;
        tracing::info!(tenant = %entry.id, "tenant created");
        Ok(entry)
    }

    /// Deletes a tenant by name. `expected_id`, when given, guards against
    /// deleting a tenant that was concurrently recreated under the same name.
    pub async fn delete(&self, name: impl Into<Bytes>, expected_id: Option<TenantId>) -> Result<()> {
        let name = name.into();
        let now = (self.clock)();
        let manager = self.clone();
        let id = self
            .with_timeout(run_transaction(&self.store, move |tx| {
                manager.check_mode()?;
                manager.delete_in_tx(tx, &name, expected_id, now)
            }))
            .await?;
        tracing::info!(tenant = %id, "tenant deleted");
        Ok(())
    }

    /// Applies configuration updates to a tenant in place.
    pub async fn configure(
        &self,
        name: impl Into<Bytes>,
        update: TenantConfigUpdate,
    ) -> Result<TenantMapEntry> {
        let name = name.into();
        if let Some(Some(group)) = &update.tenant_group {
            validate_group_name(group)?;
        }
        let manager = self.clone();
        self.with_timeout(run_transaction(&self.store, move |tx| {
            manager.check_mode()?;
            let mut entry = read_entry_by_name(tx, &name)?;
            apply_group_change(tx, &mut entry, &update)?;
            if let Some(quota) = update.storage_quota {
                entry.storage_quota = quota;
            }
            entry.configure_sequence += 1;
            write_entry(tx, &entry)?;
            tx.set_versionstamp(keys::LAST_TENANT_MODIFICATION);
            Ok(entry)
        }))
        .await
    }

    /// Renames a tenant. Idempotent across a retried commit: if `old` is
    /// gone and `new` exists, the rename is considered already applied.
    pub async fn rename(&self, old: impl Into<Bytes>, new: impl Into<Bytes>) -> Result<()> {
        let old = old.into();
        let new = new.into();
        validate_tenant_name(&new)?;
        let manager = self.clone();
        self.with_timeout(run_transaction(&self.store, move |tx| {
            manager.check_mode()?;
            manager.rename_in_tx(tx, &old, &new)
        }))
        .await
    }

    /// Transitions a tenant's lock state.
    ///
    /// A no-op if the requested `(state, owner)` pair is already in place.
    /// Fails with [`TenantError::Locked`] when a different owner holds the
    /// lock.
    pub async fn change_lock_state(
        &self,
        name: impl Into<Bytes>,
        state: TenantLockState,
        requester: Uuid,
    ) -> Result<()> {
        let name = name.into();
        let manager = self.clone();
        self.with_timeout(run_transaction(&self.store, move |tx| {
            manager.check_mode()?;
            let mut entry = read_entry_by_name(tx, &name)?;
            let desired_owner = (state != TenantLockState::Unlocked).then_some(requester);
            if entry.lock_state == state && entry.lock_owner == desired_owner {
                return Ok(());
            }
            if let Some(owner) = entry.lock_owner {
                if owner != requester {
                    return Err(TenantError::Locked);
                }
            }
            entry.lock_state = state;
            entry.lock_owner = desired_owner;
            entry.configure_sequence += 1;
            debug_assert!(entry.lock_fields_consistent());
            write_entry(tx, &entry)?;
            tx.set_versionstamp(keys::LAST_TENANT_MODIFICATION);
            Ok(())
        }))
        .await
    }

    // ========================================================================
    // Readers
    // ========================================================================

    /// Looks a tenant up by name.
    pub async fn get(&self, name: impl Into<Bytes>) -> Result<TenantMapEntry> {
        let name = name.into();
        run_transaction(&self.store, move |tx| read_entry_by_name(tx, &name)).await
    }

    /// Looks a tenant up by id.
    pub async fn get_by_id(&self, id: TenantId) -> Result<TenantMapEntry> {
        run_transaction(&self.store, move |tx| {
            tx.get_typed::<TenantMapEntry>(keys::tenant_map_key(id))?
                .ok_or(TenantError::NotFound)
        })
        .await
    }

    /// Lists up to `limit` tenants in name order.
    pub async fn list(&self, limit: usize) -> Result<Vec<TenantMapEntry>> {
        run_transaction(&self.store, move |tx| {
            let rows = tx.get_range(&keys::tenant_name_range(), limit)?;
            let mut out = Vec::with_capacity(rows.len());
            for (key, raw) in rows {
                let id: TenantId = decode(&raw)?;
                let name = keys::tenant_name_suffix(&key)
                    .ok_or_else(|| TenantError::Inconsistent("malformed name index key".into()))?;
                let entry = tx
                    .get_typed::<TenantMapEntry>(keys::tenant_map_key(id))?
                    .ok_or_else(|| {
                        TenantError::Inconsistent(format!(
                            "name index references missing tenant {id}"
                        ))
                    })?;
                if entry.name.as_ref() != name {
                    return Err(TenantError::Inconsistent(format!(
                        "tenant {id} name disagrees with its index entry"
                    )));
                }
                out.push(entry);
            }
            Ok(out)
        })
        .await
    }

    /// Lists up to `limit` tenant groups in name order.
    pub async fn list_groups(&self, limit: usize) -> Result<Vec<Bytes>> {
        run_transaction(&self.store, move |tx| {
            let rows = tx.get_range(&keys::tenant_group_range(), limit)?;
            rows.iter()
                .map(|(key, _)| {
                    keys::tenant_group_suffix(key)
                        .map(Bytes::copy_from_slice)
                        .ok_or_else(|| TenantError::Inconsistent("malformed group key".into()))
                })
                .collect()
        })
        .await
    }

    /// Looks a tenant group up by name.
    pub async fn get_group(&self, group: impl Into<Bytes>) -> Result<Option<TenantGroupEntry>> {
        let group = group.into();
        run_transaction(&self.store, move |tx| {
            Ok(tx.get_typed::<TenantGroupEntry>(keys::tenant_group_key(&group))?)
        })
        .await
    }

    /// Lists up to `limit` members of a group as `(name, id)` pairs.
    pub async fn tenants_in_group(
        &self,
        group: impl Into<Bytes>,
        limit: usize,
    ) -> Result<Vec<(Bytes, TenantId)>> {
        let group = group.into();
        run_transaction(&self.store, move |tx| {
            let rows = tx.get_range(&keys::tenant_group_index_range(&group), limit)?;
            rows.iter()
                .map(|(_, raw)| {
                    let id: TenantId = decode(raw)?;
                    tx.get_typed::<TenantMapEntry>(keys::tenant_map_key(id))?
                        .map(|entry| (entry.name, id))
                        .ok_or_else(|| {
                            TenantError::Inconsistent(format!(
                                "group index references missing tenant {id}"
                            ))
                        })
                })
                .collect()
        })
        .await
    }

    /// Number of live tenants.
    pub async fn count(&self) -> Result<u64> {
        run_transaction(&self.store, |tx| Ok(read_count(tx)?)).await
    }

    /// Tenants whose recorded usage exceeds their configured quota.
    pub async fn tenants_over_quota(
        &self,
        usage: &HashMap<TenantId, u64>,
    ) -> Result<Vec<TenantId>> {
        let mut over = Vec::new();
        for entry in self.list(usize::MAX).await? {
            if let (Some(quota), Some(used)) = (entry.storage_quota, usage.get(&entry.id)) {
                if *used > quota {
                    over.push(entry.id);
                }
            }
        }
        Ok(over)
    }

    // ========================================================================
    // Transaction Bodies
    // ========================================================================

    fn check_mode(&self) -> Result<()> {
        if self.cluster_type == ClusterType::Standalone && self.tenant_mode == TenantMode::Disabled
        {
            return Err(TenantError::TenantsDisabled);
        }
        Ok(())
    }

    fn check_assignment(&self, assignment: IdAssignment) -> Result<()> {
        match (self.cluster_type, assignment) {
            (ClusterType::MetaclusterData, IdAssignment::Allocate)
            | (ClusterType::Standalone | ClusterType::MetaclusterManagement, IdAssignment::Assigned(_)) => {
                Err(TenantError::InvalidMetaclusterOperation)
            }
            _ => Ok(()),
        }
    }

    fn create_in_tx(
        &self,
        tx: &mut Transaction,
        name: &Bytes,
        group: Option<&Bytes>,
        assignment: IdAssignment,
        now: u64,
    ) -> Result<TenantMapEntry> {
        let id = match assignment {
            IdAssignment::Allocate => self.allocate_id(tx)?,
            IdAssignment::Assigned(id) => id,
        };

        if self.cluster_type == ClusterType::MetaclusterData {
            self.check_tombstones(tx, id, now)?;
        }

        if tx.get(keys::tenant_name_key(name))?.is_some() {
            return Err(TenantError::AlreadyExists);
        }

        let prefix = id.key_prefix();
        let prefix_space = KeyRange::new(prefix.clone(), keys::prefix_end(&prefix));
        if !tx.range_is_empty(&prefix_space)? {
            return Err(TenantError::PrefixAllocatorConflict);
        }

        let count = read_count(tx)? + 1;
        if count > self.max_tenants {
            return Err(TenantError::ClusterNoCapacity);
        }
        tx.set_typed(keys::TENANT_COUNT, &count)?;

        let mut entry = TenantMapEntry::new(id, name.clone());
        entry.tenant_group = group.cloned();
        write_entry(tx, &entry)?;
        tx.set_typed(keys::tenant_name_key(name), &id)?;
        if let Some(group) = group {
            insert_group_membership(tx, group, name, id)?;
        }
        tx.set_versionstamp(keys::LAST_TENANT_MODIFICATION);
        Ok(entry)
    }

    fn allocate_id(&self, tx: &mut Transaction) -> Result<TenantId> {
        let last = tx
            .get_typed::<i64>(keys::TENANT_LAST_ID)?
            .unwrap_or_else(|| TenantId::first_in_prefix(self.tenant_id_prefix).as_i64());
        let skew = if self.id_skew_max == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.id_skew_max) as i64
        };
        let id = TenantId::new(last + 1 + skew);
        tx.set_typed(keys::TENANT_LAST_ID, &id.as_i64())?;
        Ok(id)
    }

    fn check_tombstones(&self, tx: &mut Transaction, id: TenantId, _now: u64) -> Result<()> {
        let cleanup = tx
            .get_typed::<TombstoneCleanupData>(keys::TENANT_TOMBSTONE_CLEANUP)?
            .unwrap_or_default();
        if id.as_i64() <= cleanup.watermark {
            return Err(TenantError::CreationPermanentlyFailed);
        }
        if tx.get(keys::tenant_tombstone_key(id))?.is_some() {
            return Err(TenantError::CreationBlocked);
        }
        Ok(())
    }

    fn delete_in_tx(
        &self,
        tx: &mut Transaction,
        name: &Bytes,
        expected_id: Option<TenantId>,
        now: u64,
    ) -> Result<TenantId> {
        let entry = read_entry_by_name(tx, name)?;
        if let Some(expected) = expected_id {
            if entry.id != expected {
                return Err(TenantError::NotFound);
            }
        }

        let prefix = entry.prefix();
        let prefix_space = KeyRange::new(prefix.clone(), keys::prefix_end(&prefix));
        if !tx.range_is_empty(&prefix_space)? {
            return Err(TenantError::NotEmpty);
        }

        tx.clear(keys::tenant_map_key(entry.id));
        tx.clear(keys::tenant_name_key(name));
        let count = read_count(tx)?.saturating_sub(1);
        tx.set_typed(keys::TENANT_COUNT, &count)?;
        if let Some(group) = &entry.tenant_group {
            remove_group_membership(tx, group, name)?;
        }

        if self.cluster_type == ClusterType::MetaclusterData {
            self.write_tombstone(tx, entry.id, now)?;
        }
        tx.set_versionstamp(keys::LAST_TENANT_MODIFICATION);
        Ok(entry.id)
    }

    /// Tombstones the deleted id and opportunistically advances the cleanup
    /// watermark once per cleanup interval.
    fn write_tombstone(&self, tx: &mut Transaction, id: TenantId, now: u64) -> Result<()> {
        let mut cleanup = tx
            .get_typed::<TombstoneCleanupData>(keys::TENANT_TOMBSTONE_CLEANUP)?
            .unwrap_or_default();

        if now.saturating_sub(cleanup.last_cleanup) >= self.tombstone_cleanup_interval {
            let tombstones = tx.get_range(&keys::tenant_tombstone_range(), usize::MAX)?;
            if let Some((last_key, _)) = tombstones.last() {
                // All currently recorded tombstones become permanent: ids at
                // or below the watermark can never be created again.
                let raw: [u8; 8] = last_key[last_key.len() - 8..]
                    .try_into()
                    .map_err(|_| TenantError::Inconsistent("malformed tombstone key".into()))?;
                let max_id = TenantId::new(i64::from_be_bytes(raw));
                tx.clear_range(&keys::tenant_tombstone_range_through(max_id));
                cleanup.watermark = max_id.as_i64();
            }
            cleanup.last_cleanup = now;
            tx.set_typed(keys::TENANT_TOMBSTONE_CLEANUP, &cleanup)?;
        }

        if id.as_i64() > cleanup.watermark && id.prefix() == self.tenant_id_prefix {
            tx.set(keys::tenant_tombstone_key(id), Bytes::new());
        }
        Ok(())
    }

    fn rename_in_tx(&self, tx: &mut Transaction, old: &Bytes, new: &Bytes) -> Result<()> {
        let old_id = tx.get_typed::<TenantId>(keys::tenant_name_key(old))?;
        let Some(id) = old_id else {
            // Retried after a commit of unknown fate: if the new name is
            // indexed the rename already applied.
            return if tx.get(keys::tenant_name_key(new))?.is_some() {
                Ok(())
            } else {
                Err(TenantError::NotFound)
            };
        };

        if tx.get(keys::tenant_name_key(new))?.is_some() {
            return Err(TenantError::AlreadyExists);
        }

        let mut entry = tx
            .get_typed::<TenantMapEntry>(keys::tenant_map_key(id))?
            .ok_or_else(|| {
                TenantError::Inconsistent(format!("name index references missing tenant {id}"))
            })?;
        if entry.name != *old {
            return Err(TenantError::Inconsistent(format!(
                "tenant {id} name disagrees with its index entry"
            )));
        }

        entry.name = new.clone();
        write_entry(tx, &entry)?;
        tx.set_typed(keys::tenant_name_key(new), &id)?;
        tx.clear(keys::tenant_name_key(old));
        if let Some(group) = &entry.tenant_group {
            tx.clear(keys::tenant_group_index_key(group, old));
            tx.set_typed(keys::tenant_group_index_key(group, new), &id)?;
        }
        tx.set_versionstamp(keys::LAST_TENANT_MODIFICATION);
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        op: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| TenantError::Timeout)?
    }
}

// ============================================================================
// Shared Transaction Helpers
// ============================================================================

fn decode<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T> {
    postcard::from_bytes(raw)
        .map_err(|e| TenantError::Store(lodestone_store::StoreError::Codec(e.to_string())))
}

fn read_count(tx: &mut Transaction) -> Result<u64> {
    Ok(tx.get_typed::<u64>(keys::TENANT_COUNT)?.unwrap_or(0))
}

fn read_entry_by_name(tx: &mut Transaction, name: &Bytes) -> Result<TenantMapEntry> {
    let id = tx
        .get_typed::<TenantId>(keys::tenant_name_key(name))?
        .ok_or(TenantError::NotFound)?;
    tx.get_typed::<TenantMapEntry>(keys::tenant_map_key(id))?
        .ok_or_else(|| TenantError::Inconsistent(format!("name index references missing tenant {id}")))
}

fn write_entry(tx: &mut Transaction, entry: &TenantMapEntry) -> Result<()> {
    debug_assert!(entry.lock_fields_consistent());
    tx.set_typed(keys::tenant_map_key(entry.id), entry)?;
    Ok(())
}

fn insert_group_membership(
    tx: &mut Transaction,
    group: &Bytes,
    name: &Bytes,
    id: TenantId,
) -> Result<()> {
    tx.set_typed(keys::tenant_group_index_key(group, name), &id)?;
    if tx.get(keys::tenant_group_key(group))?.is_none() {
        tx.set_typed(keys::tenant_group_key(group), &TenantGroupEntry::default())?;
    }
    Ok(())
}

/// Removes `(group, name)` from the membership index, dropping the group row
/// when the last member leaves.
fn remove_group_membership(tx: &mut Transaction, group: &Bytes, name: &Bytes) -> Result<()> {
    tx.clear(keys::tenant_group_index_key(group, name));
    let remaining = tx.get_range(&keys::tenant_group_index_range(group), 2)?;
    let only_self = remaining
        .iter()
        .all(|(k, _)| *k == keys::tenant_group_index_key(group, name));
    if only_self {
        tx.clear(keys::tenant_group_key(group));
    }
    Ok(())
}

fn apply_group_change(
    tx: &mut Transaction,
    entry: &mut TenantMapEntry,
    update: &TenantConfigUpdate,
) -> Result<()> {
    let Some(new_group) = &update.tenant_group else {
        return Ok(());
    };
    if entry.tenant_group == *new_group {
        return Ok(());
    }
    if let Some(old) = &entry.tenant_group {
        remove_group_membership(tx, old, &entry.name)?;
    }
    if let Some(new) = new_group {
        insert_group_membership(tx, new, &entry.name, entry.id)?;
    }
    entry.tenant_group = new_group.clone();
    Ok(())
}

// ============================================================================
// Name Validation
// ============================================================================

fn validate_tenant_name(name: &[u8]) -> Result<()> {
    // The empty name is allowed; names in the system prefix are not.
    if name.first() == Some(&0xff) {
        return Err(TenantError::InvalidName);
    }
    Ok(())
}

fn validate_group_name(name: &[u8]) -> Result<()> {
    if name.first() == Some(&0xff) {
        return Err(TenantError::InvalidGroupName);
    }
    Ok(())
}

#[cfg(test)]
mod tests;
