//! The coalesced shard map and durable data-move records.
//!
//! The map partitions the user keyspace into contiguous shards, each owned
//! by one primary (and optionally one remote) replica team. Rows are keyed
//! by shard begin; a shard ends where its successor begins, and the last
//! shard ends at the user-keyspace boundary. Every mutation runs under the
//! move-keys lock.

use std::collections::BTreeMap;

use bytes::Bytes;
use lodestone_store::{keys, run_transaction, SystemStore, Transaction};
use lodestone_types::{
    DataMoveMetadata, KeyRange, MoveId, MoveKeysLock, ServerId, Team,
};
use serde::{Deserialize, Serialize};

use crate::lock::check_move_keys_lock;
use crate::{DistributionError, Result};

/// Durable per-shard row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShardEntry {
    /// Servers currently holding this shard in the primary region.
    pub src: Vec<ServerId>,
    /// Servers currently holding this shard in the remote region.
    pub remote_src: Vec<ServerId>,
    /// Destination servers while a move is in flight.
    pub dest: Vec<ServerId>,
    /// The move the destination belongs to. [`MoveId::ANONYMOUS`] marks a
    /// destination written without a surviving data-move record.
    pub dest_move: Option<MoveId>,
}

impl ShardEntry {
    pub fn has_destination(&self) -> bool {
        !self.dest.is_empty()
    }
}

/// One shard with its resolved bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub range: KeyRange,
    pub entry: ShardEntry,
}

/// In-memory snapshot of the shard map.
#[derive(Debug, Clone, Default)]
pub struct ShardMap {
    /// Shard begin key to entry; bounds are derived from adjacency.
    shards: BTreeMap<Bytes, ShardEntry>,
}

impl ShardMap {
    /// Loads the whole map in one snapshot read.
    pub async fn load(store: &SystemStore) -> Result<Self> {
        run_transaction(store, |tx| {
            let rows = tx.get_range(&keys::shard_map_range(), usize::MAX)?;
            let mut shards = BTreeMap::new();
            for (key, raw) in rows {
                let begin = keys::shard_map_key_suffix(&key).ok_or_else(|| {
                    DistributionError::Internal("malformed shard map key".into())
                })?;
                let entry: ShardEntry = postcard::from_bytes(&raw)
                    .map_err(|e| lodestone_store::StoreError::Codec(e.to_string()))?;
                shards.insert(Bytes::copy_from_slice(begin), entry);
            }
            Ok(Self { shards })
        })
        .await
    }

    /// Writes a single shard covering the whole user keyspace, owned by
    /// `team`. Used when bootstrapping an empty cluster.
    pub async fn initialize(
        store: &SystemStore,
        lock: &MoveKeysLock,
        team: &Team,
        remote: Option<&Team>,
    ) -> Result<()> {
        let entry = ShardEntry {
            src: team.servers().to_vec(),
            remote_src: remote.map(|t| t.servers().to_vec()).unwrap_or_default(),
            dest: Vec::new(),
            dest_move: None,
        };
        let lock = *lock;
        run_transaction(store, move |tx| {
            check_move_keys_lock(tx, &lock, true)?;
            if !tx.range_is_empty(&keys::shard_map_range())? {
                return Err(DistributionError::Internal(
                    "shard map already initialized".into(),
                ));
            }
            tx.set_typed(keys::shard_map_key(b""), &entry)?;
            Ok(())
        })
        .await
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// All shards in key order, with resolved bounds.
    pub fn iter(&self) -> impl Iterator<Item = Shard> + '_ {
        let ends = self
            .shards
            .keys()
            .skip(1)
            .cloned()
            .chain(std::iter::once(KeyRange::all_user_keys().end));
        self.shards.iter().zip(ends).map(|((begin, entry), end)| Shard {
            range: KeyRange::new(begin.clone(), end),
            entry: entry.clone(),
        })
    }

    /// Shards intersecting `range`.
    pub fn overlapping(&self, range: &KeyRange) -> Vec<Shard> {
        self.iter().filter(|s| s.range.intersects(range)).collect()
    }

    /// The map tiles the user keyspace with no two adjacent identical
    /// entries.
    pub fn validate_coalesced(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(DistributionError::Internal("shard map is empty".into()));
        }
        if self.shards.keys().next().map(Bytes::as_ref) != Some(&b""[..]) {
            return Err(DistributionError::Internal(
                "shard map does not begin at the first key".into(),
            ));
        }
        let mut prev: Option<&ShardEntry> = None;
        for entry in self.shards.values() {
            if prev == Some(entry) {
                return Err(DistributionError::Internal(
                    "adjacent shards with identical entries".into(),
                ));
            }
            prev = Some(entry);
        }
        Ok(())
    }

    /// Every shard covered by `data_move` must carry its id as destination,
    /// and destinations claiming the move must be covered by it.
    pub fn validate_move(&self, data_move: &DataMoveMetadata) -> Result<()> {
        for range in &data_move.ranges {
            for shard in self.overlapping(range) {
                if shard.entry.dest_move != Some(data_move.id) {
                    return Err(DistributionError::Internal(format!(
                        "shard {} not annotated with move {}",
                        shard.range, data_move.id
                    )));
                }
            }
        }
        for shard in self.iter() {
            if shard.entry.dest_move == Some(data_move.id)
                && !data_move.ranges.iter().any(|r| r.intersects(&shard.range))
            {
                return Err(DistributionError::Internal(format!(
                    "shard {} annotated with move {} outside its ranges",
                    shard.range, data_move.id
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Durable Mutations
// ============================================================================

/// Splits the shard containing `at` so that a shard boundary exists at `at`.
pub async fn split_shard(store: &SystemStore, lock: &MoveKeysLock, at: Bytes) -> Result<()> {
    let lock = *lock;
    run_transaction(store, move |tx| {
        check_move_keys_lock(tx, &lock, true)?;
        if at.is_empty() || tx.get(keys::shard_map_key(&at))?.is_some() {
            return Ok(()); // boundary already present
        }
        let entry = entry_containing(tx, &at)?;
        tx.set_typed(keys::shard_map_key(&at), &entry)?;
        Ok(())
    })
    .await
}

/// Merges all shard boundaries strictly inside `range`, leaving the shard
/// beginning at `range.begin` to cover it entirely.
pub async fn merge_shards(store: &SystemStore, lock: &MoveKeysLock, range: KeyRange) -> Result<()> {
    let lock = *lock;
    run_transaction(store, move |tx| {
        check_move_keys_lock(tx, &lock, true)?;
        let inner = KeyRange::new(
            keys::shard_map_key(&range.begin),
            keys::shard_map_key(&range.end),
        );
        let rows = tx.get_range(&inner, usize::MAX)?;
        for (key, _) in rows.iter().skip(1) {
            tx.clear(key.clone());
        }
        Ok(())
    })
    .await
}

/// Persists a new data move and annotates every covered shard with its
/// destination, in one transaction.
pub async fn start_move(
    store: &SystemStore,
    lock: &MoveKeysLock,
    data_move: DataMoveMetadata,
) -> Result<()> {
    let lock = *lock;
    run_transaction(store, move |tx| {
        check_move_keys_lock(tx, &lock, true)?;
        tx.set_typed(keys::data_move_key(data_move.id), &data_move)?;
        for range in &data_move.ranges {
            annotate_covered(tx, range, |entry| {
                entry.dest = data_move.primary_dest.clone();
                entry.dest_move = Some(data_move.id);
            })?;
        }
        Ok(())
    })
    .await
}

/// Completes a move: destinations become sources, the annotation is cleared,
/// and the move record is deleted.
pub async fn finish_move(
    store: &SystemStore,
    lock: &MoveKeysLock,
    data_move: DataMoveMetadata,
) -> Result<()> {
    let lock = *lock;
    run_transaction(store, move |tx| {
        check_move_keys_lock(tx, &lock, true)?;
        for range in &data_move.ranges {
            annotate_covered(tx, range, |entry| {
                entry.src = data_move.primary_dest.clone();
                if !data_move.remote_dest.is_empty() {
                    entry.remote_src = data_move.remote_dest.clone();
                }
                entry.dest = Vec::new();
                entry.dest_move = None;
            })?;
        }
        tx.clear(keys::data_move_key(data_move.id));
        Ok(())
    })
    .await
}

/// Cancels a move: clears its shard annotations and tombstones the record.
pub async fn cancel_move(store: &SystemStore, lock: &MoveKeysLock, id: MoveId) -> Result<()> {
    let lock = *lock;
    run_transaction(store, move |tx| {
        check_move_keys_lock(tx, &lock, true)?;
        let Some(mut data_move) = tx.get_typed::<DataMoveMetadata>(keys::data_move_key(id))? else {
            return Ok(());
        };
        for range in &data_move.ranges {
            annotate_covered(tx, range, |entry| {
                if entry.dest_move == Some(id) {
                    entry.dest = Vec::new();
                    entry.dest_move = None;
                }
            })?;
        }
        data_move.cancelled = true;
        tx.set_typed(keys::data_move_key(id), &data_move)?;
        Ok(())
    })
    .await
}

/// Loads every persisted data move in one snapshot read.
pub async fn load_data_moves(store: &SystemStore) -> Result<Vec<DataMoveMetadata>> {
    run_transaction(store, |tx| {
        let rows = tx.get_range(&keys::data_move_range(), usize::MAX)?;
        rows.iter()
            .map(|(_, raw)| {
                postcard::from_bytes(raw)
                    .map_err(|e| lodestone_store::StoreError::Codec(e.to_string()).into())
            })
            .collect::<Result<Vec<DataMoveMetadata>>>()
    })
    .await
}

/// Clears a tombstoned move record once its cancellation has been executed.
pub async fn clear_move_record(store: &SystemStore, lock: &MoveKeysLock, id: MoveId) -> Result<()> {
    let lock = *lock;
    run_transaction(store, move |tx| {
        check_move_keys_lock(tx, &lock, true)?;
        tx.clear(keys::data_move_key(id));
        Ok(())
    })
    .await
}

/// Applies `mutate` to every shard row covered by `range`, splitting at the
/// range bounds first so annotations never bleed into neighbors.
fn annotate_covered(
    tx: &mut Transaction,
    range: &KeyRange,
    mutate: impl Fn(&mut ShardEntry),
) -> Result<()> {
    ensure_boundary(tx, &range.begin)?;
    ensure_boundary(tx, &range.end)?;
    let inner = KeyRange::new(
        keys::shard_map_key(&range.begin),
        keys::shard_map_key(&range.end),
    );
    let rows = tx.get_range(&inner, usize::MAX)?;
    for (key, raw) in rows {
        let mut entry: ShardEntry = postcard::from_bytes(&raw)
            .map_err(|e| lodestone_store::StoreError::Codec(e.to_string()))?;
        mutate(&mut entry);
        tx.set_typed(key, &entry)?;
    }
    Ok(())
}

fn ensure_boundary(tx: &mut Transaction, at: &Bytes) -> Result<()> {
    if at.is_empty() || at.as_ref() >= KeyRange::all_user_keys().end.as_ref() {
        return Ok(());
    }
    if tx.get(keys::shard_map_key(at))?.is_none() {
        let entry = entry_containing(tx, at)?;
        tx.set_typed(keys::shard_map_key(at), &entry)?;
    }
    Ok(())
}

/// The entry of the shard containing `key` (the greatest row at or before
/// it).
fn entry_containing(tx: &mut Transaction, key: &Bytes) -> Result<ShardEntry> {
    // Bound just past the row for `key` itself, excluding longer keys that
    // sort after it.
    let mut end = keys::shard_map_key(key).to_vec();
    end.push(0);
    let up_to = KeyRange::new(keys::shard_map_key(b""), Bytes::from(end));
    let rows = tx.get_range(&up_to, usize::MAX)?;
    let (_, raw) = rows.last().ok_or_else(|| {
        DistributionError::Internal("shard map has no row covering key".into())
    })?;
    postcard::from_bytes(raw)
        .map_err(|e| DistributionError::Store(lodestone_store::StoreError::Codec(e.to_string())))
}
