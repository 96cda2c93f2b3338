//! Unit tests for the tenant lifecycle state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lodestone_config::{DatabaseConfiguration, Knobs};
use lodestone_store::{keys, SystemStore};
use lodestone_types::{ClusterType, TenantId, TenantLockState, TenantMode};
use uuid::Uuid;

use crate::{IdAssignment, TenantConfigUpdate, TenantError, TenantManager};

fn standalone_manager(store: &SystemStore) -> TenantManager {
    let db = DatabaseConfiguration {
        tenant_mode: TenantMode::Optional,
        ..DatabaseConfiguration::default()
    };
    TenantManager::new(store.clone(), &db, &Knobs::default())
}

fn data_cluster_manager(store: &SystemStore, clock: Arc<AtomicU64>) -> TenantManager {
    let db = DatabaseConfiguration {
        tenant_mode: TenantMode::Required,
        cluster_type: ClusterType::MetaclusterData,
        tenant_id_prefix: 1,
        ..DatabaseConfiguration::default()
    };
    TenantManager::new(store.clone(), &db, &Knobs::default())
        .with_clock(move || clock.load(Ordering::SeqCst))
}

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn create_allocates_sequential_ids() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    let t1 = mgr.create(b("alpha"), None, IdAssignment::Allocate).await.unwrap();
    let t2 = mgr.create(b("beta"), None, IdAssignment::Allocate).await.unwrap();

    assert_eq!(t2.id.as_i64(), t1.id.as_i64() + 1);
    assert_eq!(mgr.count().await.unwrap(), 2);
    assert_eq!(mgr.get(b("alpha")).await.unwrap().id, t1.id);
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    mgr.create(b("t"), None, IdAssignment::Allocate).await.unwrap();
    let err = mgr.create(b("t"), None, IdAssignment::Allocate).await.unwrap_err();
    assert_eq!(err, TenantError::AlreadyExists);
    assert_eq!(mgr.count().await.unwrap(), 1);
}

#[tokio::test]
async fn tenants_disabled_rejects_mutations() {
    let store = SystemStore::new();
    let db = DatabaseConfiguration::default(); // tenant_mode: Disabled
    let mgr = TenantManager::new(store, &db, &Knobs::default());

    let err = mgr.create(b("t"), None, IdAssignment::Allocate).await.unwrap_err();
    assert_eq!(err, TenantError::TenantsDisabled);
}

#[tokio::test]
async fn empty_name_is_allowed_system_prefix_is_not() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    mgr.create(b(""), None, IdAssignment::Allocate).await.unwrap();

    let err = mgr
        .create(Bytes::from_static(b"\xffsys"), None, IdAssignment::Allocate)
        .await
        .unwrap_err();
    assert_eq!(err, TenantError::InvalidName);

    let err = mgr
        .create(b("t"), Some(Bytes::from_static(b"\xffgroup")), IdAssignment::Allocate)
        .await
        .unwrap_err();
    assert_eq!(err, TenantError::InvalidGroupName);
}

#[tokio::test]
async fn capacity_limit_is_enforced() {
    let store = SystemStore::new();
    let db = DatabaseConfiguration {
        tenant_mode: TenantMode::Optional,
        max_tenants_per_cluster: 1,
        ..DatabaseConfiguration::default()
    };
    let mgr = TenantManager::new(store, &db, &Knobs::default());

    mgr.create(b("one"), None, IdAssignment::Allocate).await.unwrap();
    let err = mgr.create(b("two"), None, IdAssignment::Allocate).await.unwrap_err();
    assert_eq!(err, TenantError::ClusterNoCapacity);
    assert_eq!(mgr.count().await.unwrap(), 1);
}

#[tokio::test]
async fn occupied_prefix_is_rejected() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    // User data squatting where the next allocated tenant would live.
    let next_id = TenantId::new(TenantId::first_in_prefix(0).as_i64() + 1);
    let mut tx = store.begin();
    let mut squatter = next_id.key_prefix().to_vec();
    squatter.push(b'x');
    tx.set(Bytes::from(squatter), b("data"));
    tx.commit().unwrap();

    let err = mgr.create(b("t"), None, IdAssignment::Allocate).await.unwrap_err();
    assert_eq!(err, TenantError::PrefixAllocatorConflict);
}

#[tokio::test]
async fn assignment_policy_must_match_cluster_role() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);
    let err = mgr
        .create(b("t"), None, IdAssignment::Assigned(TenantId::new(7)))
        .await
        .unwrap_err();
    assert_eq!(err, TenantError::InvalidMetaclusterOperation);

    let clock = Arc::new(AtomicU64::new(1_000));
    let data = data_cluster_manager(&store, clock);
    let err = data.create(b("t"), None, IdAssignment::Allocate).await.unwrap_err();
    assert_eq!(err, TenantError::InvalidMetaclusterOperation);
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn delete_then_recreate_succeeds_on_standalone() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    let first = mgr.create(b("t"), None, IdAssignment::Allocate).await.unwrap();
    mgr.delete(b("t"), None).await.unwrap();
    let second = mgr.create(b("t"), None, IdAssignment::Allocate).await.unwrap();
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn delete_rejects_nonempty_tenant() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    let entry = mgr.create(b("t"), None, IdAssignment::Allocate).await.unwrap();
    let mut tx = store.begin();
    let mut key = entry.prefix().to_vec();
    key.push(b'k');
    tx.set(Bytes::from(key), b("v"));
    tx.commit().unwrap();

    let err = mgr.delete(b("t"), None).await.unwrap_err();
    assert_eq!(err, TenantError::NotEmpty);
}

#[tokio::test]
async fn delete_with_wrong_expected_id_fails() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    mgr.create(b("t"), None, IdAssignment::Allocate).await.unwrap();
    let err = mgr
        .delete(b("t"), Some(TenantId::new(999)))
        .await
        .unwrap_err();
    assert_eq!(err, TenantError::NotFound);
}

// ============================================================================
// Groups
// ============================================================================

#[tokio::test]
async fn group_row_exists_iff_nonempty() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    let a = mgr.create(b("a"), Some(b("g")), IdAssignment::Allocate).await.unwrap();
    let b_entry = mgr.create(b("b"), Some(b("g")), IdAssignment::Allocate).await.unwrap();
    assert_eq!(mgr.list_groups(10).await.unwrap(), vec![b("g")]);
    assert!(mgr.get_group(b("g")).await.unwrap().is_some());
    assert_eq!(
        mgr.tenants_in_group(b("g"), 10).await.unwrap(),
        vec![(b("a"), a.id), (b("b"), b_entry.id)]
    );

    mgr.delete(b("a"), None).await.unwrap();
    assert_eq!(mgr.list_groups(10).await.unwrap(), vec![b("g")]);

    mgr.delete(b("b"), None).await.unwrap();
    assert!(mgr.list_groups(10).await.unwrap().is_empty());
    assert!(mgr.get_group(b("g")).await.unwrap().is_none());
}

#[tokio::test]
async fn configure_moves_tenant_between_groups() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    mgr.create(b("t"), Some(b("old")), IdAssignment::Allocate).await.unwrap();
    let entry = mgr
        .configure(
            b("t"),
            TenantConfigUpdate {
                tenant_group: Some(Some(b("new"))),
                ..TenantConfigUpdate::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(entry.tenant_group, Some(b("new")));
    assert_eq!(entry.configure_sequence, 1);
    assert_eq!(mgr.list_groups(10).await.unwrap(), vec![b("new")]);
}

// ============================================================================
// Rename
// ============================================================================

#[tokio::test]
async fn rename_round_trip_restores_entry() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    let before = mgr.create(b("a"), Some(b("g")), IdAssignment::Allocate).await.unwrap();
    mgr.rename(b("a"), b("b")).await.unwrap();
    mgr.rename(b("b"), b("a")).await.unwrap();

    let after = mgr.get(b("a")).await.unwrap();
    assert_eq!(before, after);
    assert!(matches!(
        mgr.get(b("b")).await.unwrap_err(),
        TenantError::NotFound
    ));
}

#[tokio::test]
async fn rename_is_idempotent_across_commit_unknown() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    mgr.create(b("a"), None, IdAssignment::Allocate).await.unwrap();
    store.fail_next_commit_with_unknown();
    // First attempt applies but reports unknown; the retry observes the new
    // name in place and succeeds silently.
    mgr.rename(b("a"), b("b")).await.unwrap();
    assert!(mgr.get(b("b")).await.is_ok());
}

#[tokio::test]
async fn rename_missing_tenant_fails() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);
    assert_eq!(
        mgr.rename(b("ghost"), b("b")).await.unwrap_err(),
        TenantError::NotFound
    );
}

#[tokio::test]
async fn rename_onto_existing_name_fails() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);
    mgr.create(b("a"), None, IdAssignment::Allocate).await.unwrap();
    mgr.create(b("b"), None, IdAssignment::Allocate).await.unwrap();
    assert_eq!(
        mgr.rename(b("a"), b("b")).await.unwrap_err(),
        TenantError::AlreadyExists
    );
}

// ============================================================================
// Lock State
// ============================================================================

#[tokio::test]
async fn lock_transitions() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);
    mgr.create(b("t"), None, IdAssignment::Allocate).await.unwrap();

    let owner = Uuid::new_v4();
    let other = Uuid::new_v4();

    mgr.change_lock_state(b("t"), TenantLockState::Locked, owner).await.unwrap();
    let entry = mgr.get(b("t")).await.unwrap();
    assert_eq!(entry.lock_state, TenantLockState::Locked);
    assert_eq!(entry.lock_owner, Some(owner));
    assert!(entry.lock_fields_consistent());

    // Same pair: no-op, sequence unchanged.
    let seq = entry.configure_sequence;
    mgr.change_lock_state(b("t"), TenantLockState::Locked, owner).await.unwrap();
    assert_eq!(mgr.get(b("t")).await.unwrap().configure_sequence, seq);

    // A different requester is rejected.
    assert_eq!(
        mgr.change_lock_state(b("t"), TenantLockState::ReadOnly, other)
            .await
            .unwrap_err(),
        TenantError::Locked
    );

    mgr.change_lock_state(b("t"), TenantLockState::Unlocked, owner).await.unwrap();
    let entry = mgr.get(b("t")).await.unwrap();
    assert_eq!(entry.lock_owner, None);
    assert!(entry.lock_fields_consistent());
}

// ============================================================================
// Tombstones (data cluster)
// ============================================================================

#[tokio::test]
async fn tombstone_blocks_recreation_within_window() {
    let store = SystemStore::new();
    let clock = Arc::new(AtomicU64::new(1_000));
    let mgr = data_cluster_manager(&store, clock.clone());

    let id = TenantId::new(TenantId::first_in_prefix(1).as_i64() + 5);
    mgr.create(b("t"), None, IdAssignment::Assigned(id)).await.unwrap();
    mgr.delete(b("t"), None).await.unwrap();

    let err = mgr
        .create(b("t2"), None, IdAssignment::Assigned(id))
        .await
        .unwrap_err();
    assert_eq!(err, TenantError::CreationBlocked);
}

#[tokio::test]
async fn watermark_makes_old_ids_permanently_unavailable() {
    let store = SystemStore::new();
    let clock = Arc::new(AtomicU64::new(1_000));
    let mgr = data_cluster_manager(&store, clock.clone());

    let band = TenantId::first_in_prefix(1).as_i64();
    let id1 = TenantId::new(band + 1);
    mgr.create(b("t1"), None, IdAssignment::Assigned(id1)).await.unwrap();
    mgr.delete(b("t1"), None).await.unwrap();

    // Past the cleanup interval, the next deletion advances the watermark
    // over the recorded tombstones.
    clock.fetch_add(3_600, Ordering::SeqCst);
    let id2 = TenantId::new(band + 2);
    mgr.create(b("t2"), None, IdAssignment::Assigned(id2)).await.unwrap();
    mgr.delete(b("t2"), None).await.unwrap();

    let err = mgr
        .create(b("back"), None, IdAssignment::Assigned(id1))
        .await
        .unwrap_err();
    assert_eq!(err, TenantError::CreationPermanentlyFailed);
}

// ============================================================================
// Quota
// ============================================================================

#[tokio::test]
async fn tenants_over_quota_compares_usage() {
    let store = SystemStore::new();
    let mgr = standalone_manager(&store);

    let a = mgr.create(b("a"), None, IdAssignment::Allocate).await.unwrap();
    let b_entry = mgr.create(b("b"), None, IdAssignment::Allocate).await.unwrap();
    mgr.configure(
        b("a"),
        TenantConfigUpdate {
            storage_quota: Some(Some(100)),
            ..TenantConfigUpdate::default()
        },
    )
    .await
    .unwrap();

    let mut usage = HashMap::new();
    usage.insert(a.id, 150u64);
    usage.insert(b_entry.id, u64::MAX); // no quota configured
    assert_eq!(mgr.tenants_over_quota(&usage).await.unwrap(), vec![a.id]);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn concurrent_creates_serialize_to_one_winner() {
    let store = SystemStore::new();
    let mgr1 = standalone_manager(&store);
    let mgr2 = standalone_manager(&store);

    let (r1, r2) = tokio::join!(
        mgr1.create(b("t"), Some(b("g")), IdAssignment::Allocate),
        mgr2.create(b("t"), Some(b("g")), IdAssignment::Allocate),
    );

    let outcomes = [r1, r2];
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    let losers = outcomes
        .iter()
        .filter(|r| matches!(r, Err(TenantError::AlreadyExists)))
        .count();
    assert_eq!((winners, losers), (1, 1));
    assert_eq!(mgr1.count().await.unwrap(), 1);
    assert_eq!(mgr1.list_groups(10).await.unwrap(), vec![b("g")]);
}

#[tokio::test]
async fn concurrent_rename_and_delete_never_tear() {
    let store = SystemStore::new();
    let mgr1 = standalone_manager(&store);
    let mgr2 = standalone_manager(&store);
    mgr1.create(b("t"), None, IdAssignment::Allocate).await.unwrap();

    let (rename, delete) = tokio::join!(
        mgr1.rename(b("t"), b("u")),
        mgr2.delete(b("t"), None),
    );

    // Either order is a valid serialization; the surviving state must be
    // internally consistent.
    match (rename, delete) {
        (Ok(()), Ok(())) => {
            // Rename then delete cannot both succeed against one tenant.
            panic!("rename and delete both succeeded");
        }
        (Ok(()), Err(_)) => {
            assert!(mgr1.get(b("u")).await.is_ok());
            assert_eq!(mgr1.count().await.unwrap(), 1);
        }
        (Err(_), Ok(())) => {
            assert!(mgr1.get(b("t")).await.is_err());
            assert_eq!(mgr1.count().await.unwrap(), 0);
        }
        (Err(rename_err), Err(delete_err)) => {
            panic!("both failed: {rename_err:?} / {delete_err:?}");
        }
    }

    // The name index never points at a missing entry.
    let mut tx = store.begin();
    let rows = tx.get_range(&keys::tenant_name_range(), 10).unwrap();
    for (_, raw) in rows {
        let id: TenantId = postcard::from_bytes(&raw).unwrap();
        assert!(tx
            .get_typed::<lodestone_types::TenantMapEntry>(keys::tenant_map_key(id))
            .unwrap()
            .is_some());
    }
}
