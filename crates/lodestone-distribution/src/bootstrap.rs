//! Bootstrap helpers: distribution mode, resume-from-shards, and
//! resume-from-data-moves.

use lodestone_config::DatabaseConfiguration;
use lodestone_store::{keys, run_transaction, SystemStore};
use lodestone_types::{DataMoveMetadata, DdMode, RelocateReason, Team};

use crate::queue::RelocateShard;
use crate::shard_map::ShardMap;
use crate::teams::TeamCollection;
use crate::tracker::ShardTracker;
use crate::{DistributionError, Result};

// ============================================================================
// Distribution Mode
// ============================================================================

/// Reads the persisted mode byte; absent means enabled.
pub async fn read_mode(store: &SystemStore) -> Result<DdMode> {
    run_transaction(store, |tx| {
        let raw = tx.get(keys::DD_MODE)?;
        let mode = match raw.as_deref() {
            None => DdMode::Enabled,
            Some([b]) => DdMode::from_byte(*b).ok_or_else(|| {
                DistributionError::Internal(format!("unknown distribution mode byte {b}"))
            })?,
            Some(other) => {
                return Err(DistributionError::Internal(format!(
                    "malformed distribution mode value of {} bytes",
                    other.len()
                )))
            }
        };
        Ok(mode)
    })
    .await
}

/// Persists the mode byte. The operator surface for enabling and disabling
/// data distribution.
pub async fn set_mode(store: &SystemStore, mode: DdMode) -> Result<()> {
    run_transaction(store, move |tx| {
        tx.set(keys::DD_MODE, bytes::Bytes::copy_from_slice(&[mode.as_byte()]));
        Ok::<_, DistributionError>(())
    })
    .await?;
    tracing::info!(?mode, "distribution mode set");
    Ok(())
}

/// Parks until the mode byte is `Enabled`.
pub async fn wait_enabled(store: &SystemStore) -> Result<()> {
    let mut watch = store.watch(bytes::Bytes::copy_from_slice(keys::DD_MODE));
    loop {
        watch.borrow_and_update();
        if read_mode(store).await? == DdMode::Enabled {
            return Ok(());
        }
        tracing::info!("data distribution disabled; waiting");
        if watch.changed().await.is_err() {
            return Err(DistributionError::Internal("mode watch closed".into()));
        }
    }
}

/// Parks until the mode byte is anything but `SecurityQuiesce`.
pub async fn wait_not_quiesce(store: &SystemStore) -> Result<()> {
    let mut watch = store.watch(bytes::Bytes::copy_from_slice(keys::DD_MODE));
    loop {
        watch.borrow_and_update();
        if read_mode(store).await? != DdMode::SecurityQuiesce {
            return Ok(());
        }
        tracing::info!("security quiesce in progress; waiting");
        if watch.changed().await.is_err() {
            return Err(DistributionError::Internal("mode watch closed".into()));
        }
    }
}

// ============================================================================
// Resume
// ============================================================================

/// Walks the loaded shard map: registers every shard with the tracker and
/// emits one recovery relocation per shard that is mis-replicated or
/// carries an anonymous in-flight destination.
pub fn resume_from_shards(
    map: &ShardMap,
    db: &DatabaseConfiguration,
    tracker: &mut ShardTracker,
) -> Vec<RelocateShard> {
    let mut out = Vec::new();
    for shard in map.iter() {
        tracker.register_shard(&shard.range);

        let mis_replicated = shard.entry.src.len() != db.replication_factor
            || (db.usable_regions > 1
                && shard.entry.remote_src.len() != db.replication_factor);
        let anonymous_move = shard.entry.has_destination()
            && shard.entry.dest_move.is_none_or(|m| m.is_anonymous());

        if mis_replicated || anonymous_move {
            let mut relocation =
                RelocateShard::new(shard.range.clone(), RelocateReason::RecoverMove);
            relocation.data_move = shard.entry.dest_move;
            out.push(relocation);
        }
    }
    tracing::info!(
        shards = map.len(),
        relocations = out.len(),
        "resumed from shards"
    );
    out
}

/// Walks the persisted data moves: cancelled or invalid moves become
/// cancellation relocations, live ones register their destination team and
/// re-emit their relocation. Runs after [`resume_from_shards`].
pub fn resume_from_data_moves(
    map: &ShardMap,
    moves: Vec<DataMoveMetadata>,
    teams: &mut TeamCollection,
) -> Result<Vec<RelocateShard>> {
    let mut out = Vec::new();
    for data_move in moves {
        if data_move.cancelled || !data_move.is_valid() {
            tracing::info!(data_move = %data_move.id, "unwinding cancelled data move");
            for range in &data_move.ranges {
                let mut relocation =
                    RelocateShard::new(range.clone(), RelocateReason::RecoverMove);
                relocation.cancelled = true;
                relocation.data_move = Some(data_move.id);
                out.push(relocation);
            }
            continue;
        }

        map.validate_move(&data_move)?;
        teams.note_assignment(&Team::new(data_move.primary_dest.clone()));
        for range in &data_move.ranges {
            let mut relocation = RelocateShard::new(range.clone(), RelocateReason::RecoverMove);
            relocation.data_move = Some(data_move.id);
            out.push(relocation);
        }
    }
    Ok(out)
}
