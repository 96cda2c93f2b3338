//! Unit tests for the distributor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lodestone_audit::{AuditTaskError, AuditTaskRequest, BoxFuture, StorageServerClient};
use lodestone_config::{DatabaseConfiguration, Knobs, LodestoneConfig};
use lodestone_store::{keys, SystemStore};
use lodestone_types::{
    AuditType, DistributorId, KeyRange, Locality, MoveId, RelocatePriority, RelocateReason,
    ServerId, SnapshotId, StorageEngine, StorageServerMeta, Team,
};

use crate::bootstrap::{resume_from_shards, set_mode};
use crate::lock::{check_move_keys_lock, take_move_keys_lock};
use crate::queue::{RelocateShard, RelocationQueue};
use crate::requests::MetricsReply;
use crate::shard_map::{self, ShardEntry, ShardMap};
use crate::snapshot::{ClusterProcesses, ProcessRole, SnapshotManager};
use crate::teams::TeamCollection;
use crate::tracker::{ShardMetrics, ShardTracker};
use crate::wiggle::StorageWiggler;
use crate::{
    Collaborators, DataDistributor, DistributionContext, DistributionError,
};

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn r(begin: &str, end: &str) -> KeyRange {
    KeyRange::new(b(begin), b(end))
}

fn server(dc: &str, zone: &str) -> StorageServerMeta {
    StorageServerMeta {
        id: ServerId::random(),
        addr: format!("{dc}-{zone}:4500"),
        locality: Locality::new(dc, zone, "m"),
        engine: StorageEngine::SsdBtreeV2,
        created_at: 0,
        wrong_configured: false,
        is_tss: false,
    }
}

// ============================================================================
// Move-Keys Lock Exchange
// ============================================================================

#[tokio::test]
async fn lock_exchange_evicts_the_previous_holder() {
    let store = SystemStore::new();
    let id_a = DistributorId::random();
    let id_b = DistributorId::random();

    // A takes and claims the lock.
    let lock_a = take_move_keys_lock(&store, id_a).await.unwrap();
    let mut tx = store.begin();
    check_move_keys_lock(&mut tx, &lock_a, true).unwrap();
    tx.commit().unwrap();

    // B observes (owner=A, writer=W1) and takes over.
    let lock_b = take_move_keys_lock(&store, id_b).await.unwrap();
    assert_eq!(lock_b.prev_owner, id_a);
    let mut tx = store.begin();
    check_move_keys_lock(&mut tx, &lock_b, true).unwrap();
    tx.commit().unwrap();

    // A's next guarded write observes (B, *) and must conflict.
    let mut tx = store.begin();
    let err = check_move_keys_lock(&mut tx, &lock_a, true).unwrap_err();
    assert_eq!(err, DistributionError::MoveKeysConflict);
}

#[tokio::test]
async fn stale_writer_token_conflicts() {
    let store = SystemStore::new();
    let id_a = DistributorId::random();
    let id_b = DistributorId::random();

    let lock_a = take_move_keys_lock(&store, id_a).await.unwrap();
    let mut tx = store.begin();
    check_move_keys_lock(&mut tx, &lock_a, true).unwrap();
    tx.commit().unwrap();

    // B snapshots (A, W1) ...
    let lock_b = take_move_keys_lock(&store, id_b).await.unwrap();

    // ... then A refreshes its writer token ...
    let mut tx = store.begin();
    check_move_keys_lock(&mut tx, &lock_a, true).unwrap();
    tx.commit().unwrap();

    // ... so B's takeover sees a changed token and must conflict.
    let mut tx = store.begin();
    let err = check_move_keys_lock(&mut tx, &lock_b, true).unwrap_err();
    assert_eq!(err, DistributionError::MoveKeysConflict);
}

// ============================================================================
// Resume From Shards
// ============================================================================

#[tokio::test]
async fn resume_emits_one_recovery_per_anonymous_destination() {
    let store = SystemStore::new();
    let db = DatabaseConfiguration::default(); // replication factor 3
    let team: Vec<ServerId> = (0..3).map(|_| ServerId::random()).collect();
    let dest: Vec<ServerId> = (0..3).map(|_| ServerId::random()).collect();

    const SHARDS: usize = 20;
    const WITH_DEST: usize = 5;
    let boundary = |i: usize| -> Bytes {
        if i == 0 {
            Bytes::new()
        } else {
            Bytes::from(format!("{i:08}"))
        }
    };

    let mut tx = store.begin();
    for i in 0..SHARDS {
        let entry = ShardEntry {
            src: team.clone(),
            remote_src: Vec::new(),
            dest: if i < WITH_DEST { dest.clone() } else { Vec::new() },
            dest_move: None,
        };
        tx.set_typed(keys::shard_map_key(&boundary(i)), &entry).unwrap();
    }
    tx.commit().unwrap();

    let map = ShardMap::load(&store).await.unwrap();
    let mut tracker = ShardTracker::new(&Knobs::default());
    let relocations = resume_from_shards(&map, &db, &mut tracker);

    assert_eq!(relocations.len(), WITH_DEST);
    assert_eq!(tracker.tracked_count(), SHARDS);
    for (i, relocation) in relocations.iter().enumerate() {
        assert_eq!(relocation.priority, RelocatePriority::RECOVER_MOVE);
        assert!(!relocation.cancelled);
        assert_eq!(relocation.keys.begin, boundary(i));
        assert_eq!(relocation.keys.end, boundary(i + 1));
    }
}

#[tokio::test]
async fn resume_emits_recovery_for_under_replicated_shards() {
    let store = SystemStore::new();
    let db = DatabaseConfiguration::default();

    let mut tx = store.begin();
    let entry = ShardEntry {
        src: vec![ServerId::random()], // one replica of a required three
        ..ShardEntry::default()
    };
    tx.set_typed(keys::shard_map_key(b""), &entry).unwrap();
    tx.commit().unwrap();

    let map = ShardMap::load(&store).await.unwrap();
    let mut tracker = ShardTracker::new(&Knobs::default());
    let relocations = resume_from_shards(&map, &db, &mut tracker);
    assert_eq!(relocations.len(), 1);
    assert_eq!(relocations[0].reason, RelocateReason::RecoverMove);
}

// ============================================================================
// Wiggler Dispatch Order
// ============================================================================

#[test]
fn wiggler_yields_wrong_configured_oldest_first() {
    let min_age = 100;
    let now = 1_000_000;
    let mut wiggler = StorageWiggler::new(min_age);

    let mut seed = |age: u64, engine: StorageEngine, wrong: bool| -> ServerId {
        let mut meta = server("dc1", "z");
        meta.engine = engine;
        meta.created_at = now - age;
        meta.wrong_configured = wrong;
        wiggler.add_server(&meta, now);
        meta.id
    };

    let s1 = seed(min_age + 40, StorageEngine::SsdBtreeV2, false);
    let s2 = seed(min_age + 30, StorageEngine::Memory, true);
    let s3 = seed(min_age + 20, StorageEngine::Rocksdb, true);
    let s4 = seed(min_age + 10, StorageEngine::SsdBtreeV2, false);

    let order: Vec<ServerId> =
        std::iter::from_fn(|| wiggler.next_server_id(now, true)).collect();
    assert_eq!(order, vec![s2, s3, s1, s4]);
    assert_eq!(wiggler.next_server_id(now, true), None);
}

#[test]
fn young_servers_are_held_back_unless_wrong_configured() {
    let now = 1_000_000;
    let mut wiggler = StorageWiggler::new(100);

    let mut young = server("dc1", "z1");
    young.created_at = now - 10;
    wiggler.add_server(&young, now);
    assert_eq!(wiggler.next_server_id(now, true), None);

    let mut young_wrong = server("dc1", "z2");
    young_wrong.created_at = now - 10;
    young_wrong.wrong_configured = true;
    wiggler.add_server(&young_wrong, now);
    assert_eq!(wiggler.next_server_id(now, true), Some(young_wrong.id));

    // Without the age gate the young server is eligible.
    assert_eq!(wiggler.next_server_id(now, false), Some(young.id));
}

// ============================================================================
// Relocation Queue
// ============================================================================

#[test_case::test_case(RelocateReason::Merge => RelocatePriority::MERGE)]
#[test_case::test_case(RelocateReason::Rebalance => RelocatePriority::REBALANCE)]
#[test_case::test_case(RelocateReason::RecoverMove => RelocatePriority::RECOVER_MOVE)]
#[test_case::test_case(RelocateReason::Split => RelocatePriority::SPLIT)]
#[test_case::test_case(RelocateReason::TeamUnhealthy => RelocatePriority::TEAM_UNHEALTHY)]
#[test_case::test_case(RelocateReason::Drain => RelocatePriority::ENFORCE_MOVE)]
fn reason_maps_to_its_priority(reason: RelocateReason) -> RelocatePriority {
    reason.priority()
}

#[test]
fn queue_orders_by_priority_then_fifo() {
    let mut queue = RelocationQueue::new(10);
    queue.enqueue(RelocateShard::new(r("a", "b"), RelocateReason::Merge));
    queue.enqueue(RelocateShard::new(r("c", "d"), RelocateReason::TeamUnhealthy));
    queue.enqueue(RelocateShard::new(r("e", "f"), RelocateReason::Split));
    queue.enqueue(RelocateShard::new(r("g", "h"), RelocateReason::TeamUnhealthy));

    let launched = queue.launch_ready();
    let reasons: Vec<(RelocateReason, KeyRange)> =
        launched.into_iter().map(|l| (l.reason, l.keys)).collect();
    assert_eq!(
        reasons,
        vec![
            (RelocateReason::TeamUnhealthy, r("c", "d")),
            (RelocateReason::TeamUnhealthy, r("g", "h")),
            (RelocateReason::Split, r("e", "f")),
            (RelocateReason::Merge, r("a", "b")),
        ]
    );
}

#[test]
fn queue_admits_one_move_per_range() {
    let mut queue = RelocationQueue::new(10);
    queue.enqueue(RelocateShard::new(r("a", "m"), RelocateReason::Rebalance));
    queue.enqueue(RelocateShard::new(r("g", "z"), RelocateReason::Rebalance));

    let launched = queue.launch_ready();
    assert_eq!(launched.len(), 1);
    queue.note_launched(MoveId::random(), launched[0].clone());

    // The overlapping relocation stays queued while the first is in flight.
    assert!(queue.launch_ready().is_empty());
    assert_eq!(queue.pending_len(), 1);
}

#[test]
fn queue_bounds_parallelism_and_requeues_failures() {
    let mut queue = RelocationQueue::new(2);
    for i in 0..4 {
        queue.enqueue(RelocateShard::new(
            r(&format!("{i}a"), &format!("{i}z")),
            RelocateReason::Rebalance,
        ));
    }
    let launched = queue.launch_ready();
    assert_eq!(launched.len(), 2);
    let id = MoveId::random();
    queue.note_launched(id, launched[0].clone());
    queue.note_launched(MoveId::random(), launched[1].clone());
    assert!(queue.launch_ready().is_empty());

    queue.retry(id);
    assert_eq!(queue.pending_len(), 3);
    assert_eq!(queue.in_flight_len(), 1);
    assert_eq!(queue.launch_ready().len(), 1);
}

// ============================================================================
// Teams
// ============================================================================

fn collection_with_zones(zones: usize, per_zone: usize) -> (TeamCollection, Vec<ServerId>) {
    let mut teams = TeamCollection::new(None, 3);
    let mut ids = Vec::new();
    for z in 0..zones {
        for _ in 0..per_zone {
            let meta = server("dc1", &format!("z{z}"));
            ids.push(meta.id);
            teams.register_server(meta);
        }
    }
    teams.build_teams();
    (teams, ids)
}

#[test]
fn teams_are_zone_diverse() {
    let (teams, _) = collection_with_zones(3, 2);
    assert!(teams.team_count() >= 1);
    for team in teams.healthy_teams() {
        let zones: std::collections::HashSet<String> = team
            .servers()
            .iter()
            .map(|id| teams.server(*id).unwrap().locality.zone.clone())
            .collect();
        assert_eq!(zones.len(), team.len());
    }
}

#[test]
fn destination_avoids_requested_servers() {
    let (teams, ids) = collection_with_zones(4, 1);
    let avoid = vec![ids[0]];
    let team = teams.pick_destination(&avoid).unwrap();
    assert!(!team.overlaps(&avoid));
}

#[test]
fn failed_server_poisons_its_teams() {
    let (mut teams, ids) = collection_with_zones(3, 1);
    assert_eq!(teams.healthy_teams().len(), teams.team_count());
    teams.report_server_failure(ids[0]);
    assert!(teams.healthy_teams().is_empty());
    assert!(matches!(
        teams.pick_destination(&[]),
        Err(DistributionError::DestTeamNotFound)
    ));
}

#[test]
fn exclusion_safety_requires_two_surviving_teams() {
    let (teams, ids) = collection_with_zones(3, 2);
    // Removing nothing is safe iff at least two teams exist at all.
    assert_eq!(teams.exclusion_is_safe(&[]), teams.healthy_teams().len() >= 2);
    // Removing every server is never safe.
    assert!(!teams.exclusion_is_safe(&ids));
}

// ============================================================================
// Tracker
// ============================================================================

#[test]
fn oversized_shard_splits_after_debounce() {
    let knobs = Knobs {
        metrics_debounce_sec: 10.0,
        ..Knobs::default()
    };
    let mut tracker = ShardTracker::new(&knobs);
    let range = r("a", "m");
    tracker.register_shard(&range);

    let big = ShardMetrics {
        bytes: knobs.shard_max_bytes + 1,
        ..ShardMetrics::default()
    };
    assert_eq!(tracker.note_metrics(&range, big, 100), None);
    // Still inside the debounce window.
    assert_eq!(tracker.note_metrics(&range, big, 105), None);
    let decision = tracker.note_metrics(&range, big, 111).unwrap();
    assert_eq!(decision.reason, RelocateReason::Split);
    assert_eq!(decision.keys, range);
}

#[test]
fn small_adjacent_shards_merge() {
    let knobs = Knobs {
        metrics_debounce_sec: 0.0,
        ..Knobs::default()
    };
    let mut tracker = ShardTracker::new(&knobs);
    tracker.register_shard(&r("a", "m"));
    tracker.register_shard(&r("m", "z"));

    let tiny = ShardMetrics {
        bytes: 1,
        ..ShardMetrics::default()
    };
    tracker.note_metrics(&r("m", "z"), tiny, 50);
    let decision = tracker.note_metrics(&r("a", "m"), tiny, 100).unwrap();
    assert_eq!(decision.reason, RelocateReason::Merge);
    assert_eq!(decision.keys, r("a", "z"));
}

#[test]
fn healthy_shard_triggers_nothing() {
    let knobs = Knobs::default();
    let mut tracker = ShardTracker::new(&knobs);
    let range = r("a", "m");
    let fine = ShardMetrics {
        bytes: (knobs.shard_min_bytes + knobs.shard_max_bytes) / 2,
        ..ShardMetrics::default()
    };
    assert_eq!(tracker.note_metrics(&range, fine, 0), None);
    assert_eq!(tracker.note_metrics(&range, fine, 1_000), None);
}

// ============================================================================
// Shard Map & Moves
// ============================================================================

async fn claimed_lock(store: &SystemStore) -> lodestone_types::MoveKeysLock {
    let lock = take_move_keys_lock(store, DistributorId::random()).await.unwrap();
    let mut tx = store.begin();
    check_move_keys_lock(&mut tx, &lock, true).unwrap();
    tx.commit().unwrap();
    lock
}

#[tokio::test]
async fn start_and_finish_move_maintain_the_shard_invariant() {
    let store = SystemStore::new();
    let lock = claimed_lock(&store).await;
    let team = Team::new((0..3).map(|_| ServerId::random()).collect());
    ShardMap::initialize(&store, &lock, &team, None).await.unwrap();

    let new_team: Vec<ServerId> = (0..3).map(|_| ServerId::random()).collect();
    let mut data_move = lodestone_types::DataMoveMetadata::new(
        MoveId::random(),
        vec![r("f", "m")],
    );
    data_move.primary_dest = new_team.clone();

    shard_map::start_move(&store, &lock, data_move.clone()).await.unwrap();
    let map = ShardMap::load(&store).await.unwrap();
    // Every shard covered by the move carries its id, and vice versa.
    map.validate_move(&data_move).unwrap();
    map.validate_coalesced().unwrap();

    shard_map::finish_move(&store, &lock, data_move.clone()).await.unwrap();
    let map = ShardMap::load(&store).await.unwrap();
    map.validate_coalesced().unwrap();
    for shard in map.overlapping(&r("f", "m")) {
        assert_eq!(shard.entry.src, new_team);
        assert!(!shard.entry.has_destination());
    }
    // The record is gone once the move completes.
    let mut tx = store.begin();
    assert!(tx.get(keys::data_move_key(data_move.id)).unwrap().is_none());
}

#[tokio::test]
async fn cancel_move_unwinds_destinations() {
    let store = SystemStore::new();
    let lock = claimed_lock(&store).await;
    let team = Team::new((0..3).map(|_| ServerId::random()).collect());
    ShardMap::initialize(&store, &lock, &team, None).await.unwrap();

    let mut data_move =
        lodestone_types::DataMoveMetadata::new(MoveId::random(), vec![r("f", "m")]);
    data_move.primary_dest = (0..3).map(|_| ServerId::random()).collect();
    shard_map::start_move(&store, &lock, data_move.clone()).await.unwrap();

    shard_map::cancel_move(&store, &lock, data_move.id).await.unwrap();
    let map = ShardMap::load(&store).await.unwrap();
    for shard in map.overlapping(&r("f", "m")) {
        assert!(!shard.entry.has_destination());
        assert_eq!(shard.entry.src, team.servers());
    }
    let mut tx = store.begin();
    let record: lodestone_types::DataMoveMetadata = postcard::from_bytes(
        &tx.get(keys::data_move_key(data_move.id)).unwrap().unwrap(),
    )
    .unwrap();
    assert!(record.cancelled);
}

// ============================================================================
// Snapshot Deduplication
// ============================================================================

struct FakeProcesses {
    snap_calls: AtomicUsize,
}

impl ClusterProcesses for FakeProcesses {
    fn processes(&self, _role: ProcessRole) -> Vec<ServerId> {
        vec![ServerId::random()]
    }

    fn quiesce_tlogs(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }

    fn resume_tlogs(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }

    fn snapshot_process(
        &self,
        _role: ProcessRole,
        _id: ServerId,
        _snapshot: SnapshotId,
        _payload: &[u8],
    ) -> BoxFuture<'_, bool> {
        self.snap_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { true })
    }
}

#[tokio::test]
async fn duplicate_snapshot_requests_reuse_the_result() {
    let store = SystemStore::new();
    let knobs = Knobs {
        snap_minimum_time_gap_sec: 1,
        ..Knobs::default()
    };
    let processes = Arc::new(FakeProcesses {
        snap_calls: AtomicUsize::new(0),
    });
    let manager = SnapshotManager::new(store, &knobs, processes.clone());

    let uid = SnapshotId::random();
    manager.handle(uid, b"payload").await.unwrap();
    let after_first = processes.snap_calls.load(Ordering::SeqCst);
    assert_eq!(after_first, 3); // one storage, one tlog, one coordinator

    // Back-to-back duplicate observes the cached result.
    manager.handle(uid, b"payload").await.unwrap();
    assert_eq!(processes.snap_calls.load(Ordering::SeqCst), after_first);

    // Past the minimum gap the same uid may drive a fresh snapshot.
    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
    manager.handle(uid, b"payload").await.unwrap();
    assert_eq!(processes.snap_calls.load(Ordering::SeqCst), after_first * 2);
}

// ============================================================================
// End To End
// ============================================================================

struct OkAuditClient;

impl StorageServerClient for OkAuditClient {
    fn audit_storage(
        &self,
        _executor: ServerId,
        _request: AuditTaskRequest,
    ) -> BoxFuture<'_, Result<(), AuditTaskError>> {
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn distributor_boots_serves_requests_and_halts() {
    let store = SystemStore::new();
    set_mode(&store, lodestone_types::DdMode::Enabled).await.unwrap();

    let servers: Vec<StorageServerMeta> = (0..3).map(|z| server("dc1", &format!("z{z}"))).collect();
    let config = LodestoneConfig::default();
    let (distributor, handles) = DataDistributor::new(
        store.clone(),
        config,
        servers,
        Collaborators {
            audit_client: Arc::new(OkAuditClient),
            processes: Arc::new(FakeProcesses {
                snap_calls: AtomicUsize::new(0),
            }),
        },
    );
    let requester = distributor.id();
    let running = tokio::spawn(distributor.run());

    // The initialized map has one all-keys shard.
    let metrics = handles
        .client
        .get_metrics(KeyRange::all_user_keys(), 100, false)
        .await
        .unwrap();
    match metrics {
        MetricsReply::Shards(shards) => {
            assert_eq!(shards.len(), 1);
            assert_eq!(shards[0].range, KeyRange::all_user_keys());
        }
        MetricsReply::MedianShardSize(_) => panic!("asked for full samples"),
    }

    let state = handles.client.wiggler_state().await.unwrap();
    assert_eq!(state.primary.wiggling, None);
    assert!(state.remote.is_none());

    let audit_id = handles
        .client
        .trigger_audit(KeyRange::all_user_keys(), AuditType::LocationMetadata, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(audit_id.as_u64(), 1);

    let safe = handles
        .client
        .exclusion_safety_check(vec!["unknown:1".into()])
        .await
        .unwrap();
    // A three-server cluster has a single team; losing nothing still
    // leaves fewer than two teams.
    assert!(!safe);

    handles.client.halt(requester).await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn removing_a_failed_server_drains_it_and_restarts() {
    let store = SystemStore::new();
    set_mode(&store, lodestone_types::DdMode::Enabled).await.unwrap();

    // Four zones so a three-way team survives losing one server.
    let servers: Vec<StorageServerMeta> = (0..4).map(|z| server("dc1", &format!("z{z}"))).collect();
    let (distributor, handles) = DataDistributor::new(
        store.clone(),
        LodestoneConfig::default(),
        servers,
        Collaborators {
            audit_client: Arc::new(OkAuditClient),
            processes: Arc::new(FakeProcesses {
                snap_calls: AtomicUsize::new(0),
            }),
        },
    );
    let requester = distributor.id();
    let running = tokio::spawn(distributor.run());

    // Wait for bootstrap, then pick a server that owns the initial shard.
    handles
        .client
        .get_metrics(KeyRange::all_user_keys(), 10, false)
        .await
        .unwrap();
    let victim = ShardMap::load(&store).await.unwrap().iter().next().unwrap().entry.src[0];

    let drained = handles
        .client
        .remove_failed_server(victim)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(drained, 1);

    // The distributor restarted; once it serves again, the shard map must
    // not reference the removed server anywhere.
    handles
        .client
        .get_metrics(KeyRange::all_user_keys(), 10, false)
        .await
        .unwrap();
    let map = ShardMap::load(&store).await.unwrap();
    map.validate_coalesced().unwrap();
    for shard in map.iter() {
        assert!(!shard.entry.src.contains(&victim));
        assert!(!shard.entry.remote_src.contains(&victim));
    }

    handles.client.halt(requester).await.unwrap();
    running.await.unwrap().unwrap();
}

// ============================================================================
// Relocation Execution
// ============================================================================

#[tokio::test]
async fn rebalance_hands_the_range_to_a_fresh_team() {
    let store = SystemStore::new();
    let lock = claimed_lock(&store).await;
    let servers: Vec<StorageServerMeta> = (0..6).map(|z| server("dc1", &format!("z{z}"))).collect();
    let ctx = DistributionContext::new(
        store.clone(),
        Knobs::default(),
        DatabaseConfiguration::default(),
        DistributorId::random(),
        &servers,
    );

    let first_team = {
        let teams = ctx.teams.lock().unwrap();
        teams.pick_destination(&[]).unwrap()
    };
    ShardMap::initialize(&store, &lock, &first_team, None).await.unwrap();
    ctx.reload_shard_map().await.unwrap();

    let relocation = RelocateShard::new(r("f", "m"), RelocateReason::Rebalance);
    crate::relocation::execute_relocation(&ctx, &lock, relocation).await.unwrap();

    let map = ctx.shard_map.lock().unwrap();
    map.validate_coalesced().unwrap();
    for shard in map.overlapping(&r("f", "m")) {
        assert_ne!(shard.entry.src, first_team.servers());
        assert!(!shard.entry.has_destination());
    }
    // Outside the moved range the original team still owns the data.
    for shard in map.overlapping(&r("n", "z")) {
        assert_eq!(shard.entry.src, first_team.servers());
    }
}

#[tokio::test]
async fn load_gap_produces_a_rebalance_relocation() {
    let store = SystemStore::new();
    let lock = claimed_lock(&store).await;
    let servers: Vec<StorageServerMeta> = (0..6).map(|z| server("dc1", &format!("z{z}"))).collect();
    let ctx = DistributionContext::new(
        store.clone(),
        Knobs::default(),
        DatabaseConfiguration::default(),
        DistributorId::random(),
        &servers,
    );

    let busy = {
        let teams = ctx.teams.lock().unwrap();
        teams.pick_destination(&[]).unwrap()
    };
    ShardMap::initialize(&store, &lock, &busy, None).await.unwrap();
    ctx.reload_shard_map().await.unwrap();

    // Balanced cluster: nothing to do.
    assert!(crate::relocation::plan_rebalance(&ctx).is_none());

    {
        let mut teams = ctx.teams.lock().unwrap();
        teams.note_assignment(&busy);
        teams.note_assignment(&busy);
    }
    let relocation = crate::relocation::plan_rebalance(&ctx).unwrap();
    assert_eq!(relocation.reason, RelocateReason::Rebalance);
    let map = ctx.shard_map.lock().unwrap();
    assert!(map
        .overlapping(&relocation.keys)
        .iter()
        .all(|s| s.entry.src == busy.servers()));
}

// ============================================================================
// Property-Based Tests
// ============================================================================

use proptest::prelude::*;

proptest! {
    /// Launched relocations are pairwise disjoint and respect the
    /// parallelism cap, whatever the enqueue order.
    #[test]
    fn prop_launched_relocations_never_overlap(
        ranges in prop::collection::vec((0u8..26, 1u8..6), 1..20),
        parallelism in 1usize..8,
    ) {
        let mut queue = RelocationQueue::new(parallelism);
        for (start, width) in ranges {
            let begin = vec![b'a' + start];
            let end = vec![b'a' + (start + width).min(26)];
            queue.enqueue(RelocateShard::new(
                KeyRange::new(begin, end),
                RelocateReason::Rebalance,
            ));
        }

        let launched = queue.launch_ready();
        prop_assert!(launched.len() <= parallelism);
        for (i, a) in launched.iter().enumerate() {
            for other in &launched[i + 1..] {
                prop_assert!(!a.keys.intersects(&other.keys));
            }
        }
    }

    /// Every wrong-configured server is wiggled before any correctly
    /// configured one.
    #[test]
    fn prop_wrong_configured_servers_drain_first(
        ages in prop::collection::vec((1_000u64..100_000, any::<bool>()), 1..16),
    ) {
        let now = 1_000_000u64;
        let mut wiggler = StorageWiggler::new(0);
        let mut wrong = std::collections::HashSet::new();
        for (age, is_wrong) in &ages {
            let mut meta = server("dc1", "z");
            meta.created_at = now - age;
            meta.wrong_configured = *is_wrong;
            if *is_wrong {
                wrong.insert(meta.id);
            }
            wiggler.add_server(&meta, now);
        }

        let order: Vec<ServerId> =
            std::iter::from_fn(|| wiggler.next_server_id(now, true)).collect();
        prop_assert_eq!(order.len(), ages.len());
        let first_correct = order
            .iter()
            .position(|id| !wrong.contains(id))
            .unwrap_or(order.len());
        prop_assert!(order[first_correct..].iter().all(|id| !wrong.contains(id)));
    }
}
