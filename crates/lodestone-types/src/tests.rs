//! Unit tests for lodestone-types.

use bytes::Bytes;
use proptest::prelude::*;

use crate::{
    AuditType, DataMoveMetadata, KeyRange, MoveId, RelocatePriority, ServerId, Team,
    TenantId, TenantLockState, TenantMapEntry,
};

// ============================================================================
// KeyRange Tests
// ============================================================================

#[test]
fn empty_range_contains_nothing() {
    let r = KeyRange::new(&b"b"[..], &b"b"[..]);
    assert!(r.is_empty());
    assert!(!r.contains_key(b"b"));

    let inverted = KeyRange::new(&b"c"[..], &b"a"[..]);
    assert!(inverted.is_empty());
}

#[test]
fn range_contains_begin_not_end() {
    let r = KeyRange::new(&b"a"[..], &b"c"[..]);
    assert!(r.contains_key(b"a"));
    assert!(r.contains_key(b"b"));
    assert!(!r.contains_key(b"c"));
}

#[test]
fn intersection_of_disjoint_ranges_is_empty() {
    let a = KeyRange::new(&b"a"[..], &b"b"[..]);
    let b = KeyRange::new(&b"c"[..], &b"d"[..]);
    assert!(!a.intersects(&b));
    assert!(a.intersection(&b).is_empty());
}

#[test]
fn user_keyspace_excludes_system_keys() {
    let user = KeyRange::all_user_keys();
    assert!(user.contains_key(b""));
    assert!(user.contains_key(b"zzz"));
    assert!(!user.contains_key(b"\xff"));
    assert!(KeyRange::system_keys().contains_key(b"\xff"));
}

// ============================================================================
// Team Tests
// ============================================================================

#[test]
fn team_normalizes_member_order() {
    let a = ServerId::random();
    let b = ServerId::random();
    assert_eq!(Team::new(vec![a, b]), Team::new(vec![b, a]));
}

#[test]
fn team_overlap_detection() {
    let a = ServerId::random();
    let b = ServerId::random();
    let c = ServerId::random();
    let team = Team::new(vec![a, b]);
    assert!(team.overlaps(&[c, a]));
    assert!(!team.overlaps(&[c]));
}

// ============================================================================
// Data Move Tests
// ============================================================================

#[test]
fn cancelled_move_is_not_valid() {
    let mut m = DataMoveMetadata::new(
        MoveId::random(),
        vec![KeyRange::new(&b"a"[..], &b"b"[..])],
    );
    m.primary_dest = vec![ServerId::random()];
    assert!(m.is_valid());
    m.cancelled = true;
    assert!(!m.is_valid());
}

#[test]
fn anonymous_move_id_is_nil() {
    assert!(MoveId::ANONYMOUS.is_anonymous());
    assert!(!MoveId::random().is_anonymous());
}

// ============================================================================
// Tenant Tests
// ============================================================================

#[test]
fn tenant_id_band_allocation() {
    let first = TenantId::first_in_prefix(3);
    assert_eq!(first.prefix(), 3);
    assert_eq!(first.as_i64(), 3i64 << 48);
    assert_eq!(TenantId::new(first.as_i64() + 17).prefix(), 3);
}

#[test]
fn tenant_key_prefix_layout() {
    let id = TenantId::new(0x0102_0304);
    let prefix = id.key_prefix();
    assert_eq!(prefix[0], 0x02);
    assert_eq!(&prefix[1..], &0x0102_0304i64.to_be_bytes());
}

#[test]
fn lock_fields_invariant() {
    let mut entry = TenantMapEntry::new(TenantId::new(1), Bytes::from_static(b"t"));
    assert!(entry.lock_fields_consistent());

    entry.lock_state = TenantLockState::Locked;
    assert!(!entry.lock_fields_consistent());

    entry.lock_owner = Some(uuid::Uuid::new_v4());
    assert!(entry.lock_fields_consistent());
}

// ============================================================================
// Priority & Audit Tests
// ============================================================================

#[test]
fn priority_ladder_ordering() {
    assert!(RelocatePriority::MERGE < RelocatePriority::REBALANCE);
    assert!(RelocatePriority::REBALANCE < RelocatePriority::RECOVER_MOVE);
    assert!(RelocatePriority::RECOVER_MOVE < RelocatePriority::SPLIT);
    assert!(RelocatePriority::SPLIT < RelocatePriority::TEAM_UNHEALTHY);
    assert!(RelocatePriority::TEAM_UNHEALTHY < RelocatePriority::ENFORCE_MOVE);
}

#[test]
fn audit_type_byte_round_trip() {
    for t in AuditType::ALL {
        assert_eq!(AuditType::from_byte(t.as_byte()), Some(t));
    }
    assert_eq!(AuditType::from_byte(9), None);
}

// ============================================================================
// Property-Based Tests
// ============================================================================

proptest! {
    /// Intersection is contained in both operands.
    #[test]
    fn prop_intersection_is_contained(
        a_begin in prop::collection::vec(any::<u8>(), 0..6),
        a_end in prop::collection::vec(any::<u8>(), 0..6),
        b_begin in prop::collection::vec(any::<u8>(), 0..6),
        b_end in prop::collection::vec(any::<u8>(), 0..6),
    ) {
        let a = KeyRange::new(a_begin, a_end);
        let b = KeyRange::new(b_begin, b_end);
        let i = a.intersection(&b);
        prop_assert!(a.contains_range(&i));
        prop_assert!(b.contains_range(&i));
    }

    /// Tenant ids round-trip through their byte prefix.
    #[test]
    fn prop_tenant_prefix_preserves_order(lo in 0i64..1_000_000, hi in 1_000_000i64..2_000_000) {
        let a = TenantId::new(lo).key_prefix();
        let b = TenantId::new(hi).key_prefix();
        prop_assert!(a < b);
    }

    /// Persisted records survive a postcard round trip.
    #[test]
    fn prop_audit_state_postcard_round_trip(id in any::<u64>()) {
        let state = crate::AuditState::new(
            crate::AuditId::new(id),
            AuditType::ReplicaConsistency,
            KeyRange::all_user_keys(),
            crate::DistributorId::random(),
        );
        let bytes = postcard::to_allocvec(&state).unwrap();
        let back: crate::AuditState = postcard::from_bytes(&bytes).unwrap();
        prop_assert_eq!(state, back);
    }
}
