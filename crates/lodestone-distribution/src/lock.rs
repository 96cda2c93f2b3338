//! The move-keys lock.
//!
//! A two-key CAS-protected singleton lock admitting exactly one distributor
//! instance to mutate the shard map, the data-move subspace, and the audit
//! rows. The *owner* key names the instance, the *writer* key carries a
//! token refreshed on every guarded write; a takeover by another instance
//! changes both, so any stale holder fails its next guarded transaction
//! with a move-keys conflict.

use lodestone_store::{keys, run_transaction, SystemStore, Transaction};
use lodestone_types::{DistributorId, MoveKeysLock};
use uuid::Uuid;

use crate::{DistributionError, Result};

/// Reads the current lock state and prepares a takeover by `my_id`.
///
/// The returned lock records the observed `(owner, writer)` pair; the
/// takeover itself happens on the first guarded write through
/// [`check_move_keys_lock`].
pub async fn take_move_keys_lock(store: &SystemStore, my_id: DistributorId) -> Result<MoveKeysLock> {
    let lock = run_transaction(store, move |tx| {
        let prev_owner = tx
            .get_typed::<DistributorId>(keys::MOVE_KEYS_LOCK_OWNER)?
            .unwrap_or_default();
        let prev_write = tx.get_typed::<Uuid>(keys::MOVE_KEYS_LOCK_WRITE)?.unwrap_or(Uuid::nil());
        Ok::<_, lodestone_store::StoreError>(MoveKeysLock {
            prev_owner,
            prev_write,
            my_owner: my_id,
        })
    })
    .await?;
    tracing::debug!(owner = %lock.prev_owner, me = %my_id, "move-keys lock observed");
    Ok(lock)
}

/// Verifies the lock inside a mutating transaction and, on a write, claims
/// or refreshes it.
///
/// - observed owner equals the snapshot's prior owner: the writer token
///   must be unchanged since the snapshot, then ownership transfers to
///   `lock.my_owner` with a fresh token;
/// - observed owner is already `lock.my_owner`: only the writer token is
///   refreshed, keeping the lock alive against concurrent takeovers;
/// - any other owner: [`DistributionError::MoveKeysConflict`].
pub fn check_move_keys_lock(
    tx: &mut Transaction,
    lock: &MoveKeysLock,
    is_write: bool,
) -> Result<()> {
    let owner = tx
        .get_typed::<DistributorId>(keys::MOVE_KEYS_LOCK_OWNER)?
        .unwrap_or_default();
    if owner == lock.my_owner {
        if is_write {
            tx.set_typed(keys::MOVE_KEYS_LOCK_WRITE, &Uuid::new_v4())?;
        }
        return Ok(());
    }
    if owner == lock.prev_owner {
        let write = tx.get_typed::<Uuid>(keys::MOVE_KEYS_LOCK_WRITE)?.unwrap_or(Uuid::nil());
        if write != lock.prev_write {
            tracing::warn!(owner = %owner, "writer token changed since lock snapshot");
            return Err(DistributionError::MoveKeysConflict);
        }
        if is_write {
            tx.set_typed(keys::MOVE_KEYS_LOCK_OWNER, &lock.my_owner)?;
            tx.set_typed(keys::MOVE_KEYS_LOCK_WRITE, &Uuid::new_v4())?;
        }
        return Ok(());
    }
    tracing::warn!(observed = %owner, me = %lock.my_owner, "move-keys lock held by another instance");
    Err(DistributionError::MoveKeysConflict)
}
