//! Relocation execution.
//!
//! Turns a dequeued [`RelocateShard`] into durable shard-map mutations:
//! splits, merges, cancellation unwinds, and team-to-team moves. Every
//! mutation runs under the move-keys lock.

use bytes::Bytes;
use lodestone_types::{
    DataMoveMetadata, KeyRange, MoveId, MoveKeysLock, RelocateReason, ServerId, Team,
};

use crate::context::DistributionContext;
use crate::queue::RelocateShard;
use crate::shard_map;
use crate::{DistributionError, Result};

/// Executes one relocation to completion.
///
/// Data transfer itself belongs to the storage servers; from the control
/// plane's perspective a move is the pair of durable transitions around it,
/// and the destination servers fetch the data between them.
pub async fn execute_relocation(
    ctx: &DistributionContext,
    lock: &MoveKeysLock,
    relocation: RelocateShard,
) -> Result<()> {
    if relocation.cancelled {
        let id = relocation.data_move.ok_or_else(|| {
            DistributionError::Internal("cancellation relocation without a move id".into())
        })?;
        shard_map::cancel_move(&ctx.store, lock, id).await?;
        shard_map::clear_move_record(&ctx.store, lock, id).await?;
        ctx.reload_shard_map().await?;
        return Ok(());
    }

    match relocation.reason {
        RelocateReason::Merge => execute_merge(ctx, lock, &relocation.keys).await,
        RelocateReason::Split => execute_split(ctx, lock, &relocation.keys).await,
        RelocateReason::Rebalance
        | RelocateReason::TeamUnhealthy
        | RelocateReason::RecoverMove
        | RelocateReason::Drain => execute_move(ctx, lock, &relocation).await,
    }
}

async fn execute_merge(
    ctx: &DistributionContext,
    lock: &MoveKeysLock,
    range: &KeyRange,
) -> Result<()> {
    shard_map::merge_shards(&ctx.store, lock, range.clone()).await?;
    {
        let mut tracker = ctx.tracker.lock().expect("tracker poisoned");
        tracker.forget_range(range);
        tracker.register_shard(range);
    }
    ctx.physical_shards
        .lock()
        .expect("physical shards poisoned")
        .forget_range(range);
    ctx.reload_shard_map().await?;
    tracing::info!(range = %range, "shards merged");
    Ok(())
}

async fn execute_split(
    ctx: &DistributionContext,
    lock: &MoveKeysLock,
    range: &KeyRange,
) -> Result<()> {
    let Some(at) = split_point(range) else {
        tracing::debug!(range = %range, "range too narrow to split");
        return Ok(());
    };
    shard_map::split_shard(&ctx.store, lock, at.clone()).await?;
    {
        let mut tracker = ctx.tracker.lock().expect("tracker poisoned");
        tracker.register_shard(&KeyRange::new(range.begin.clone(), at.clone()));
        tracker.register_shard(&KeyRange::new(at.clone(), range.end.clone()));
    }
    ctx.reload_shard_map().await?;
    tracing::info!(range = %range, "shard split");
    Ok(())
}

async fn execute_move(
    ctx: &DistributionContext,
    lock: &MoveKeysLock,
    relocation: &RelocateShard,
) -> Result<()> {
    // Resuming a persisted move re-executes it with its recorded
    // destinations; everything else plans a fresh one.
    let existing = match relocation.data_move {
        Some(id) if !id.is_anonymous() => ctx.persisted_move(id).await?,
        _ => None,
    };

    let data_move = match existing {
        Some(m) => m,
        None => plan_move(ctx, relocation)?,
    };

    let old_teams: Vec<Team> = {
        let map = ctx.shard_map.lock().expect("shard map poisoned");
        let mut teams: Vec<Team> = data_move
            .ranges
            .iter()
            .flat_map(|range| map.overlapping(range))
            .map(|s| Team::new(s.entry.src))
            .collect();
        teams.dedup();
        teams
    };

    let primary_team = Team::new(data_move.primary_dest.clone());
    shard_map::start_move(&ctx.store, lock, data_move.clone()).await?;
    // Destination servers fetch the range here; completion hands ownership
    // to the new team.
    shard_map::finish_move(&ctx.store, lock, data_move.clone()).await?;

    {
        let mut teams = ctx.teams.lock().expect("teams poisoned");
        teams.note_assignment(&primary_team);
        for old in old_teams {
            teams.note_removal(&old);
        }
    }
    if ctx.knobs.shard_encode_location_metadata && ctx.knobs.enable_dd_physical_shard {
        let mut physical = ctx.physical_shards.lock().expect("physical shards poisoned");
        for range in &data_move.ranges {
            physical.note_range(range);
        }
    }
    ctx.reload_shard_map().await?;
    tracing::info!(
        data_move = %data_move.id,
        range = %relocation.keys,
        team = %primary_team,
        reason = ?relocation.reason,
        "relocation complete"
    );
    Ok(())
}

/// Plans a fresh move for `relocation`: picks destination teams avoiding
/// the current owners.
fn plan_move(ctx: &DistributionContext, relocation: &RelocateShard) -> Result<DataMoveMetadata> {
    let avoid = current_owners(ctx, &relocation.keys);
    let primary = {
        let teams = ctx.teams.lock().expect("teams poisoned");
        // Rebalancing away from the current owners is the point; for
        // recovery the old team may simply be gone.
        teams
            .pick_destination(&avoid)
            .or_else(|_| teams.pick_destination(&[]))?
    };
    let remote = match &ctx.remote_teams {
        Some(remote_teams) => {
            let teams = remote_teams.lock().expect("teams poisoned");
            Some(teams.pick_destination(&avoid).or_else(|_| teams.pick_destination(&[]))?)
        }
        None => None,
    };

    let mut data_move = DataMoveMetadata::new(MoveId::random(), vec![relocation.keys.clone()]);
    data_move.primary_dest = primary.servers().to_vec();
    data_move.remote_dest = remote.map(|t| t.servers().to_vec()).unwrap_or_default();
    Ok(data_move)
}

/// Drains every shard owned by `server` onto healthy teams. Used before
/// removing a failed server and by the wiggler. Callers mark the server
/// failed or excluded first so its teams stop being destinations.
pub async fn drain_server(
    ctx: &DistributionContext,
    lock: &MoveKeysLock,
    server: ServerId,
) -> Result<usize> {
    let owned: Vec<KeyRange> = {
        let map = ctx.shard_map.lock().expect("shard map poisoned");
        map.iter()
            .filter(|s| s.entry.src.contains(&server) || s.entry.remote_src.contains(&server))
            .map(|s| s.range)
            .collect()
    };
    let drained = owned.len();
    for range in owned {
        let mut relocation = RelocateShard::new(range, RelocateReason::Drain);
        relocation.data_move = None;
        execute_move(ctx, lock, &relocation).await?;
    }
    tracing::info!(server = %server, shards = drained, "server drained");
    Ok(drained)
}

/// How far apart the most- and least-loaded teams may drift before a
/// rebalance move is planned.
const REBALANCE_LOAD_GAP: usize = 2;

/// Plans one load-smoothing relocation: a shard on the most-loaded team is
/// offered to the queue when the load gap to the least-loaded team is wide
/// enough. Returns `None` while the cluster is balanced.
pub fn plan_rebalance(ctx: &DistributionContext) -> Option<RelocateShard> {
    let loads = ctx.teams.lock().expect("teams poisoned").team_loads();
    let (_, lightest) = loads.first()?;
    let (busiest, heaviest) = loads.last()?;
    if heaviest - lightest < REBALANCE_LOAD_GAP {
        return None;
    }
    let map = ctx.shard_map.lock().expect("shard map poisoned");
    let shard = map
        .iter()
        .find(|s| !s.entry.has_destination() && Team::new(s.entry.src.clone()) == *busiest)?;
    Some(RelocateShard::new(shard.range, RelocateReason::Rebalance))
}

fn current_owners(ctx: &DistributionContext, range: &KeyRange) -> Vec<ServerId> {
    let map = ctx.shard_map.lock().expect("shard map poisoned");
    let mut owners = Vec::new();
    for shard in map.overlapping(range) {
        owners.extend(shard.entry.src.iter().copied());
    }
    owners.sort_unstable();
    owners.dedup();
    owners
}

/// A key strictly inside the range to split at. Prefers extending the begin
/// key, which always sorts inside a non-degenerate range.
fn split_point(range: &KeyRange) -> Option<Bytes> {
    let mut candidate = range.begin.to_vec();
    candidate.push(0x7f);
    let candidate = Bytes::from(candidate);
    (candidate > range.begin && candidate < range.end).then_some(candidate)
}
