//! Unit tests for the system store.

use bytes::Bytes;
use lodestone_types::KeyRange;

use crate::{run_transaction, StoreError, SystemStore};

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

// ============================================================================
// Basic Read / Write
// ============================================================================

#[test]
fn read_your_writes() {
    let store = SystemStore::new();
    let mut tx = store.begin();
    tx.set(b("k"), b("v"));
    assert_eq!(tx.get(b("k")).unwrap(), Some(b("v")));
    tx.commit().unwrap();

    let mut tx = store.begin();
    assert_eq!(tx.get(b("k")).unwrap(), Some(b("v")));
}

#[test]
fn clear_range_hides_committed_and_buffered_keys() {
    let store = SystemStore::new();
    let mut tx = store.begin();
    tx.set(b("a"), b("1"));
    tx.set(b("b"), b("2"));
    tx.commit().unwrap();

    let mut tx = store.begin();
    tx.set(b("c"), b("3"));
    tx.clear_range(&KeyRange::new(b("a"), b("z")));
    assert_eq!(tx.get(b("a")).unwrap(), None);
    assert_eq!(tx.get(b("c")).unwrap(), None);
    assert!(tx.range_is_empty(&KeyRange::new(b("a"), b("z"))).unwrap());
}

#[test]
fn get_range_merges_overlay_in_order() {
    let store = SystemStore::new();
    let mut tx = store.begin();
    tx.set(b("b"), b("committed"));
    tx.set(b("d"), b("committed"));
    tx.commit().unwrap();

    let mut tx = store.begin();
    tx.set(b("a"), b("buffered"));
    tx.set(b("d"), b("overwritten"));
    let rows = tx.get_range(&KeyRange::new(b("a"), b("z")), 10).unwrap();
    let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(keys, vec![b("a"), b("b"), b("d")]);
    assert_eq!(rows[2].1, b("overwritten"));
}

// ============================================================================
// Conflict Detection
// ============================================================================

#[test]
fn conflicting_write_aborts_reader() {
    let store = SystemStore::new();

    let mut reader = store.begin();
    let _ = reader.get(b("k")).unwrap();
    reader.set(b("out"), b("x"));

    let mut writer = store.begin();
    writer.set(b("k"), b("new"));
    writer.commit().unwrap();

    assert_eq!(reader.commit().unwrap_err(), StoreError::NotCommitted);
}

#[test]
fn range_read_conflicts_with_insert_into_range() {
    let store = SystemStore::new();

    let mut reader = store.begin();
    assert!(reader.range_is_empty(&KeyRange::new(b("a"), b("m"))).unwrap());
    reader.set(b("z"), b("derived"));

    let mut writer = store.begin();
    writer.set(b("c"), b("intruder"));
    writer.commit().unwrap();

    assert_eq!(reader.commit().unwrap_err(), StoreError::NotCommitted);
}

#[test]
fn disjoint_transactions_both_commit() {
    let store = SystemStore::new();

    let mut a = store.begin();
    let _ = a.get(b("a")).unwrap();
    a.set(b("a"), b("1"));

    let mut b_tx = store.begin();
    let _ = b_tx.get(b("b")).unwrap();
    b_tx.set(b("b"), b("2"));

    a.commit().unwrap();
    b_tx.commit().unwrap();
}

#[test]
fn blind_writes_do_not_conflict() {
    let store = SystemStore::new();

    let mut a = store.begin();
    a.set(b("k"), b("1"));

    let mut b_tx = store.begin();
    b_tx.set(b("k"), b("2"));
    b_tx.commit().unwrap();

    // No reads, so nothing to invalidate.
    a.commit().unwrap();
}

#[test]
fn explicit_read_conflict_range_is_honored() {
    let store = SystemStore::new();

    let mut guard = store.begin();
    guard.add_read_conflict_range(&KeyRange::new(b("lock"), b("lock\x00")));
    guard.set(b("derived"), b("x"));

    let mut intruder = store.begin();
    intruder.set(b("lock"), b("taken"));
    intruder.commit().unwrap();

    assert_eq!(guard.commit().unwrap_err(), StoreError::NotCommitted);
}

// ============================================================================
// Versionstamps & Watches
// ============================================================================

#[test]
fn versionstamp_writes_commit_version() {
    let store = SystemStore::new();
    let mut tx = store.begin();
    tx.set_versionstamp(b("stamp"));
    let version = tx.commit().unwrap();

    let mut tx = store.begin();
    let raw = tx.get(b("stamp")).unwrap().unwrap();
    assert_eq!(raw.as_ref(), version.to_be_bytes());
}

#[tokio::test]
async fn watch_fires_on_modification() {
    let store = SystemStore::new();
    let mut rx = store.watch(b("mode"));
    let seen = *rx.borrow_and_update();

    let mut tx = store.begin();
    tx.set(b("mode"), b("1"));
    tx.commit().unwrap();

    rx.changed().await.unwrap();
    assert!(*rx.borrow() > seen);
}

#[tokio::test]
async fn watch_fires_on_range_clear() {
    let store = SystemStore::new();
    let mut tx = store.begin();
    tx.set(b("mode"), b("1"));
    tx.commit().unwrap();

    let mut rx = store.watch(b("mode"));
    rx.borrow_and_update();

    let mut tx = store.begin();
    tx.clear_range(&KeyRange::new(b("a"), b("z")));
    tx.commit().unwrap();

    rx.changed().await.unwrap();
}

// ============================================================================
// Retry Loop
// ============================================================================

#[tokio::test]
async fn run_transaction_retries_after_commit_unknown() {
    let store = SystemStore::new();
    store.fail_next_commit_with_unknown();

    let mut attempts = 0;
    run_transaction(&store, |tx| {
        attempts += 1;
        // Idempotent body: safe to re-run after CommitUnknown.
        tx.set(b("k"), b("v"));
        Ok::<_, StoreError>(())
    })
    .await
    .unwrap();

    assert_eq!(attempts, 2);
    let mut tx = store.begin();
    assert_eq!(tx.get(b("k")).unwrap(), Some(b("v")));
}

#[tokio::test]
async fn run_transaction_surfaces_non_retryable_errors() {
    let store = SystemStore::new();
    let result: Result<(), _> = run_transaction(&store, |_tx| {
        Err(StoreError::Codec("bad record".into()))
    })
    .await;
    assert!(matches!(result, Err(StoreError::Codec(_))));
}

#[test]
fn typed_round_trip() {
    let store = SystemStore::new();
    let mut tx = store.begin();
    tx.set_typed(b("n"), &42u64).unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin();
    assert_eq!(tx.get_typed::<u64>(b("n")).unwrap(), Some(42));
}

// ============================================================================
// Property-Based Tests
// ============================================================================

use proptest::prelude::*;

proptest! {
    /// Committed state always matches a plain map driven by the same
    /// operations.
    #[test]
    fn committed_state_matches_model(
        ops in prop::collection::vec((0u8..8, prop::option::of(any::<u8>())), 0..40),
    ) {
        let store = SystemStore::new();
        let mut model = std::collections::BTreeMap::new();

        for (key_byte, value) in ops {
            let key = Bytes::copy_from_slice(&[key_byte]);
            let mut tx = store.begin();
            match value {
                Some(v) => {
                    tx.set(key.clone(), Bytes::copy_from_slice(&[v]));
                    model.insert(key, Bytes::copy_from_slice(&[v]));
                }
                None => {
                    tx.clear(key.clone());
                    model.remove(&key);
                }
            }
            tx.commit().unwrap();
        }

        let mut tx = store.begin();
        let rows = tx
            .get_range(&KeyRange::new(Bytes::new(), Bytes::from_static(b"\xff")), usize::MAX)
            .unwrap();
        let observed: std::collections::BTreeMap<Bytes, Bytes> = rows.into_iter().collect();
        prop_assert_eq!(observed, model);
    }

    /// A range clear leaves nothing behind inside its bounds.
    #[test]
    fn clear_range_is_total(
        seeds in prop::collection::vec(0u8..16, 1..20),
        lo in 0u8..16,
        hi in 0u8..16,
    ) {
        let store = SystemStore::new();
        let mut tx = store.begin();
        for k in &seeds {
            tx.set(Bytes::copy_from_slice(&[*k]), Bytes::from_static(b"v"));
        }
        tx.commit().unwrap();

        let (lo, hi) = (lo.min(hi), lo.max(hi));
        let range = KeyRange::new(
            Bytes::copy_from_slice(&[lo]),
            Bytes::copy_from_slice(&[hi]),
        );
        let mut tx = store.begin();
        tx.clear_range(&range);
        tx.commit().unwrap();

        let mut tx = store.begin();
        prop_assert!(tx.range_is_empty(&range).unwrap());
    }
}
