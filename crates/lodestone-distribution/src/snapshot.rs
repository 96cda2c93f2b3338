//! Cluster snapshot driver.
//!
//! Quiesces the write pipeline, snapshots storage, tlog, and coordinator
//! processes within the configured fault-tolerance bounds, and resumes.
//! Requests are deduplicated by snapshot id; a finished result keeps
//! answering duplicates for the minimum time gap before a fresh drive is
//! allowed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lodestone_audit::BoxFuture;
use lodestone_config::Knobs;
use lodestone_store::{keys, run_transaction, SystemStore};
use lodestone_types::{ServerId, SnapshotId};
use thiserror::Error;
use tokio::sync::watch;

use crate::Result;

/// Process roles a snapshot must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Storage,
    Tlog,
    Coordinator,
}

/// The cluster processes a snapshot touches.
pub trait ClusterProcesses: Send + Sync {
    fn processes(&self, role: ProcessRole) -> Vec<ServerId>;

    /// Stops the tlogs accepting commits. Returns false on failure.
    fn quiesce_tlogs(&self) -> BoxFuture<'_, bool>;

    /// Resumes the tlogs. Returns false on failure.
    fn resume_tlogs(&self) -> BoxFuture<'_, bool>;

    /// Snapshots one process. Returns false on failure.
    fn snapshot_process(
        &self,
        role: ProcessRole,
        id: ServerId,
        snapshot: SnapshotId,
        payload: &[u8],
    ) -> BoxFuture<'_, bool>;
}

/// Snapshot failure modes surfaced to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// More processes failed than the fault-tolerance knobs allow.
    #[error("snapshot exceeded fault tolerance")]
    ExceededFaultTolerance,

    /// The drive overran its overall deadline.
    #[error("snapshot timed out")]
    Timeout,

    /// The write pipeline could not be quiesced or resumed.
    #[error("snapshot could not quiesce the cluster")]
    QuiesceFailed,
}

enum SnapState {
    InFlight(watch::Receiver<Option<std::result::Result<(), SnapshotError>>>),
    Finished {
        at: Instant,
        result: std::result::Result<(), SnapshotError>,
    },
}

/// Deduplicating snapshot driver.
pub struct SnapshotManager {
    store: SystemStore,
    processes: std::sync::Arc<dyn ClusterProcesses>,
    storage_fault_tolerance: usize,
    coordinator_fault_tolerance: usize,
    min_gap: Duration,
    max_timeout: Duration,
    state: Mutex<HashMap<SnapshotId, SnapState>>,
}

impl SnapshotManager {
    pub fn new(
        store: SystemStore,
        knobs: &Knobs,
        processes: std::sync::Arc<dyn ClusterProcesses>,
    ) -> Self {
        Self {
            store,
            processes,
            storage_fault_tolerance: knobs.max_storage_snapshot_fault_tolerance,
            coordinator_fault_tolerance: knobs.max_coordinator_snapshot_fault_tolerance,
            min_gap: Duration::from_secs(knobs.snap_minimum_time_gap_sec),
            max_timeout: Duration::from_secs(knobs.snap_create_max_timeout_sec),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// True while any snapshot is being driven.
    pub fn in_progress(&self) -> bool {
        self.state
            .lock()
            .expect("snapshot state poisoned")
            .values()
            .any(|s| matches!(s, SnapState::InFlight(_)))
    }

    /// Handles one snapshot request, deduplicating by id.
    pub async fn handle(
        &self,
        id: SnapshotId,
        payload: &[u8],
    ) -> std::result::Result<(), SnapshotError> {
        // Admission: cached result, piggyback on an in-flight drive, or
        // start a fresh one.
        enum Admission {
            Cached(std::result::Result<(), SnapshotError>),
            Wait(watch::Receiver<Option<std::result::Result<(), SnapshotError>>>),
            Fresh(watch::Sender<Option<std::result::Result<(), SnapshotError>>>),
        }
        let admission = {
            let mut state = self.state.lock().expect("snapshot state poisoned");
            let known = match state.get(&id) {
                Some(SnapState::Finished { at, result }) if at.elapsed() < self.min_gap => {
                    Some(Admission::Cached(*result))
                }
                Some(SnapState::InFlight(rx)) => Some(Admission::Wait(rx.clone())),
                _ => None,
            };
            known.unwrap_or_else(|| {
                let (tx, rx) = watch::channel(None);
                state.insert(id, SnapState::InFlight(rx));
                Admission::Fresh(tx)
            })
        };

        let tx = match admission {
            Admission::Cached(result) => {
                tracing::debug!(snapshot = %id, "returning cached snapshot result");
                return result;
            }
            Admission::Wait(mut rx) => loop {
                if let Some(result) = *rx.borrow_and_update() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(SnapshotError::Timeout);
                }
            },
            Admission::Fresh(tx) => tx,
        };

        let result = match tokio::time::timeout(self.max_timeout, self.drive(id, payload)).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::Timeout),
        };

        let mut state = self.state.lock().expect("snapshot state poisoned");
        state.insert(
            id,
            SnapState::Finished {
                at: Instant::now(),
                result,
            },
        );
        let _ = tx.send(Some(result));
        result
    }

    async fn drive(
        &self,
        id: SnapshotId,
        payload: &[u8],
    ) -> std::result::Result<(), SnapshotError> {
        tracing::info!(snapshot = %id, "driving cluster snapshot");

        // Mark the recovery fence so a crash mid-snapshot is visible.
        self.set_recovery_fence(true)
            .await
            .map_err(|_| SnapshotError::QuiesceFailed)?;

        let outcome = self.drive_fenced(id, payload).await;

        // Always resume and clear the fence, even on failure.
        if !self.processes.resume_tlogs().await {
            tracing::error!(snapshot = %id, "tlog resume failed after snapshot");
        }
        if self.set_recovery_fence(false).await.is_err() {
            tracing::error!(snapshot = %id, "failed to clear recovery fence");
        }
        match &outcome {
            Ok(()) => tracing::info!(snapshot = %id, "cluster snapshot complete"),
            Err(err) => tracing::warn!(snapshot = %id, error = %err, "cluster snapshot failed"),
        }
        outcome
    }

    async fn drive_fenced(
        &self,
        id: SnapshotId,
        payload: &[u8],
    ) -> std::result::Result<(), SnapshotError> {
        if !self.processes.quiesce_tlogs().await {
            return Err(SnapshotError::QuiesceFailed);
        }

        self.snapshot_role(ProcessRole::Storage, id, payload, self.storage_fault_tolerance)
            .await?;
        // Tlogs hold the uncommitted tail; every one must snapshot.
        self.snapshot_role(ProcessRole::Tlog, id, payload, 0).await?;
        self.snapshot_role(
            ProcessRole::Coordinator,
            id,
            payload,
            self.coordinator_fault_tolerance,
        )
        .await?;
        Ok(())
    }

    async fn snapshot_role(
        &self,
        role: ProcessRole,
        id: SnapshotId,
        payload: &[u8],
        fault_tolerance: usize,
    ) -> std::result::Result<(), SnapshotError> {
        let mut failures = 0usize;
        for process in self.processes.processes(role) {
            if !self.processes.snapshot_process(role, process, id, payload).await {
                failures += 1;
                tracing::warn!(snapshot = %id, ?role, %process, "process snapshot failed");
                if failures > fault_tolerance {
                    return Err(SnapshotError::ExceededFaultTolerance);
                }
            }
        }
        Ok(())
    }

    async fn set_recovery_fence(&self, fenced: bool) -> Result<()> {
        run_transaction(&self.store, move |tx| {
            if fenced {
                tx.set(keys::WRITE_RECOVERY, bytes::Bytes::from_static(b"1"));
            } else {
                tx.clear(keys::WRITE_RECOVERY);
            }
            Ok::<_, crate::DistributionError>(())
        })
        .await
    }
}
