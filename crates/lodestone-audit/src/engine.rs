//! The audit engine: launch, dispatch, retry, resume, cancel.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lodestone_config::{DatabaseConfiguration, Knobs};
use lodestone_store::{keys, run_transaction, SystemStore};
use lodestone_types::{
    AuditId, AuditPhase, AuditState, AuditType, DistributorId, KeyRange, RangePhase, ServerId,
    StorageServerMeta,
};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::budget::TaskBudget;
use crate::client::{AuditTaskError, AuditTaskRequest, ServerDirectory, StorageServerClient};
use crate::progress;
use crate::{AuditError, Result};

/// Why an audit actor is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditContext {
    /// Fresh launch through the control channel.
    Launch,
    /// Picked up from a persisted `Running` row at distributor bootstrap.
    Resume,
    /// Restarted after a failed dispatch round.
    Retry,
}

/// In-memory state of one live audit.
pub struct LiveAudit {
    state: Mutex<AuditState>,
    budget: TaskBudget,
    retry_count: AtomicU32,
    found_error: AtomicBool,
    any_child_failed: AtomicBool,
    issued_count: AtomicU64,
    completed_count: AtomicU64,
    cancelled: AtomicBool,
    root: Mutex<Option<JoinHandle<()>>>,
}

impl LiveAudit {
    fn new(state: AuditState, budget_max: usize) -> Self {
        Self {
            state: Mutex::new(state),
            budget: TaskBudget::new(budget_max),
            retry_count: AtomicU32::new(0),
            found_error: AtomicBool::new(false),
            any_child_failed: AtomicBool::new(false),
            issued_count: AtomicU64::new(0),
            completed_count: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            root: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AuditState {
        self.state.lock().expect("audit state poisoned").clone()
    }

    pub fn budget(&self) -> &TaskBudget {
        &self.budget
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn issued_count(&self) -> u64 {
        self.issued_count.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::SeqCst)
    }
}

struct EngineInner {
    store: SystemStore,
    dd_id: DistributorId,
    directory: Arc<dyn ServerDirectory>,
    client: Arc<dyn StorageServerClient>,
    budget_max: usize,
    retry_max: u32,
    persist_finish_count: usize,
    task_failure_window: Duration,
    primary_dc: Option<String>,
    remote_dcs: Vec<String>,
    /// `audits[type][id]`; launch admits at most one live audit per type.
    audits: Mutex<HashMap<AuditType, BTreeMap<AuditId, Arc<LiveAudit>>>>,
    /// Serializes admission and id allocation so concurrent launches cannot
    /// both slip past the one-per-type check.
    launch_lock: tokio::sync::Mutex<()>,
    metadata_loaded: watch::Sender<bool>,
}

/// The audit subsystem of one distributor instance.
#[derive(Clone)]
pub struct AuditEngine {
    inner: Arc<EngineInner>,
}

impl AuditEngine {
    pub fn new(
        store: SystemStore,
        dd_id: DistributorId,
        knobs: &Knobs,
        db: &DatabaseConfiguration,
        directory: Arc<dyn ServerDirectory>,
        client: Arc<dyn StorageServerClient>,
    ) -> Self {
        let (metadata_loaded, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                store,
                dd_id,
                directory,
                client,
                budget_max: knobs.concurrent_audit_task_count_max,
                retry_max: knobs.audit_retry_count_max,
                persist_finish_count: knobs.persist_finish_audit_count,
                task_failure_window: Duration::from_secs_f64(knobs.audit_task_failure_window_sec),
                primary_dc: db.primary_dc().map(str::to_owned),
                remote_dcs: db.remote_dcs().iter().map(|s| (*s).to_owned()).collect(),
                audits: Mutex::new(HashMap::new()),
                launch_lock: tokio::sync::Mutex::new(()),
                metadata_loaded,
            }),
        }
    }

    // ========================================================================
    // Resume
    // ========================================================================

    /// Scans the audit subspace at bootstrap: deletes finished audits beyond
    /// the retention threshold, re-adopts `Running` rows under this
    /// distributor's id, and restarts their actors.
    pub async fn init_metadata(&self) -> Result<()> {
        let dd_id = self.inner.dd_id;
        let retained = self.inner.persist_finish_count;
        let resumable = run_transaction(&self.inner.store, move |tx| {
            // The audit subspace must fit in one system-range read.
            let rows = tx.get_range(&keys::audit_range(), usize::MAX)?;
            let mut by_type: HashMap<AuditType, Vec<AuditState>> = HashMap::new();
            for (_, raw) in rows {
                let state: AuditState = postcard::from_bytes(&raw)
                    .map_err(|e| lodestone_store::StoreError::Codec(e.to_string()))?;
                by_type.entry(state.audit_type).or_default().push(state);
            }

            let mut resumable = Vec::new();
            for (audit_type, mut states) in by_type {
                states.sort_by_key(|s| s.id);
                let finished: Vec<&AuditState> =
                    states.iter().filter(|s| s.phase.is_finished()).collect();
                let excess = finished.len().saturating_sub(retained);
                for doomed in &finished[..excess] {
                    tx.clear(keys::audit_key(audit_type, doomed.id));
                    if doomed.phase != AuditPhase::Complete {
                        progress::clear_progress(tx, audit_type, doomed.id);
                    }
                }
                for state in &states {
                    if state.phase == AuditPhase::Running {
                        let mut adopted = state.clone();
                        adopted.dd_id = dd_id;
                        tx.set_typed(keys::audit_key(audit_type, adopted.id), &adopted)?;
                        resumable.push(adopted);
                    }
                }
            }
            Ok::<_, lodestone_store::StoreError>(resumable)
        })
        .await?;

        for state in resumable {
            tracing::info!(audit = %state.id, audit_type = %state.audit_type, "resuming audit");
            self.insert_and_start(state, AuditContext::Resume);
        }
        let _ = self.inner.metadata_loaded.send(true);
        Ok(())
    }

    // ========================================================================
    // Launch
    // ========================================================================

    /// Launches an audit over `range`, or returns the id of a live audit of
    /// the same type already covering it.
    pub async fn launch(&self, range: KeyRange, audit_type: AuditType) -> Result<AuditId> {
        if range.is_empty() {
            return Err(AuditError::Failed);
        }
        self.wait_metadata_loaded().await;
        let _launching = self.inner.launch_lock.lock().await;

        // Admission: one live audit per type.
        {
            let audits = self.inner.audits.lock().expect("audit map poisoned");
            if let Some(live) = audits.get(&audit_type) {
                for (id, audit) in live {
                    if audit.state().range.contains_range(&range) {
                        return Ok(*id);
                    }
                }
                if !live.is_empty() {
                    return Err(AuditError::ExceededRequestLimit);
                }
            }
        }

        let dd_id = self.inner.dd_id;
        let new_range = range.clone();
        let state = run_transaction(&self.inner.store, move |tx| {
            let rows = tx.get_range(&keys::audit_type_range(audit_type), usize::MAX)?;
            let last_id = rows
                .last()
                .and_then(|(key, _)| keys::audit_key_id(key))
                .unwrap_or_default();
            let state = AuditState::new(last_id.next(), audit_type, new_range.clone(), dd_id);
            tx.set_typed(keys::audit_key(audit_type, state.id), &state)?;
            Ok::<_, lodestone_store::StoreError>(state)
        })
        .await?;

        tracing::info!(audit = %state.id, audit_type = %audit_type, range = %state.range, "audit launched");

        // Trim old finished audits in the background.
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.sweep_finished(audit_type).await {
                tracing::warn!(error = %err, "audit sweep failed");
            }
        });

        let id = state.id;
        self.insert_and_start(state, AuditContext::Launch);
        Ok(id)
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    /// Transactionally fails the audit row, clears its progress, and tears
    /// down the live actor if one exists.
    pub async fn cancel(&self, audit_type: AuditType, id: AuditId) -> Result<()> {
        run_transaction(&self.inner.store, move |tx| {
            let mut state = tx
                .get_typed::<AuditState>(keys::audit_key(audit_type, id))?
                .ok_or(AuditError::NotFound)?;
            state.phase = AuditPhase::Failed;
            tx.set_typed(keys::audit_key(audit_type, id), &state)?;
            progress::clear_progress(tx, audit_type, id);
            Ok::<(), AuditError>(())
        })
        .await?;

        let removed = {
            let mut audits = self.inner.audits.lock().expect("audit map poisoned");
            audits.get_mut(&audit_type).and_then(|m| m.remove(&id))
        };
        if let Some(audit) = removed {
            audit.cancelled.store(true, Ordering::SeqCst);
            if let Some(root) = audit.root.lock().expect("audit root poisoned").take() {
                root.abort();
            }
        }
        tracing::info!(audit = %id, audit_type = %audit_type, "audit cancelled");
        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// The live audit of `(type, id)`, if any.
    pub fn live_audit(&self, audit_type: AuditType, id: AuditId) -> Option<Arc<LiveAudit>> {
        self.inner
            .audits
            .lock()
            .expect("audit map poisoned")
            .get(&audit_type)
            .and_then(|m| m.get(&id).cloned())
    }

    /// Waits for the audit's actor to settle. Returns immediately if it is
    /// not (or no longer) live.
    pub async fn await_audit(&self, audit_type: AuditType, id: AuditId) {
        let handle = self
            .live_audit(audit_type, id)
            .and_then(|a| a.root.lock().expect("audit root poisoned").take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// The persisted audit row.
    pub async fn persisted_state(
        &self,
        audit_type: AuditType,
        id: AuditId,
    ) -> Result<Option<AuditState>> {
        run_transaction(&self.inner.store, move |tx| {
            Ok::<_, lodestone_store::StoreError>(
                tx.get_typed::<AuditState>(keys::audit_key(audit_type, id))?,
            )
        })
        .await
        .map_err(AuditError::from)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn wait_metadata_loaded(&self) {
        let mut rx = self.inner.metadata_loaded.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn insert_and_start(&self, state: AuditState, context: AuditContext) {
        let audit = Arc::new(LiveAudit::new(state.clone(), self.inner.budget_max));
        {
            let mut audits = self.inner.audits.lock().expect("audit map poisoned");
            audits
                .entry(state.audit_type)
                .or_default()
                .insert(state.id, audit.clone());
        }
        let inner = self.inner.clone();
        let core = audit.clone();
        let handle = tokio::spawn(async move {
            audit_core(inner, core, context).await;
        });
        *audit.root.lock().expect("audit root poisoned") = Some(handle);
    }

    async fn sweep_finished(&self, audit_type: AuditType) -> Result<()> {
        let retained = self.inner.persist_finish_count;
        run_transaction(&self.inner.store, move |tx| {
            let rows = tx.get_range(&keys::audit_type_range(audit_type), usize::MAX)?;
            let mut finished = Vec::new();
            for (key, raw) in rows {
                let state: AuditState = postcard::from_bytes(&raw)
                    .map_err(|e| lodestone_store::StoreError::Codec(e.to_string()))?;
                if state.phase.is_finished() {
                    finished.push((key, state));
                }
            }
            let excess = finished.len().saturating_sub(retained);
            for (key, state) in &finished[..excess] {
                tx.clear(key.clone());
                if state.phase != AuditPhase::Complete {
                    progress::clear_progress(tx, audit_type, state.id);
                }
            }
            Ok::<_, lodestone_store::StoreError>(())
        })
        .await
        .map_err(AuditError::from)
    }

    fn remove_live(&self, audit_type: AuditType, id: AuditId) {
        let mut audits = self.inner.audits.lock().expect("audit map poisoned");
        if let Some(m) = audits.get_mut(&audit_type) {
            m.remove(&id);
        }
    }
}

// ============================================================================
// Audit Core
// ============================================================================

async fn audit_core(inner: Arc<EngineInner>, audit: Arc<LiveAudit>, context: AuditContext) {
    let state = audit.state();
    tracing::debug!(
        audit = %state.id,
        audit_type = %state.audit_type,
        ?context,
        "audit core started"
    );

    let final_phase = drive_audit(&inner, &audit).await;

    // Persist the outcome. If this fails the row stays Running on disk and
    // the next distributor resumes the audit from it.
    let persist = persist_final_phase(&inner, &state, final_phase).await;
    match persist {
        Ok(()) => tracing::info!(
            audit = %state.id,
            audit_type = %state.audit_type,
            phase = %final_phase,
            issued = audit.issued_count(),
            completed = audit.completed_count(),
            "audit finished"
        ),
        Err(err) => tracing::warn!(
            audit = %state.id,
            audit_type = %state.audit_type,
            error = %err,
            "failed to persist audit outcome; next distributor will resume it"
        ),
    }

    let engine = AuditEngine { inner };
    engine.remove_live(state.audit_type, state.id);
}

/// Runs dispatch rounds until the audit reaches a final phase.
async fn drive_audit(inner: &Arc<EngineInner>, audit: &Arc<LiveAudit>) -> AuditPhase {
    loop {
        if audit.cancelled.load(Ordering::SeqCst) {
            return AuditPhase::Failed;
        }
        audit.any_child_failed.store(false, Ordering::SeqCst);

        if let Err(err) = dispatch_round(inner, audit).await {
            tracing::warn!(error = %err, "audit dispatch failed");
            return AuditPhase::Failed;
        }

        if audit.found_error.load(Ordering::SeqCst) {
            return AuditPhase::Error;
        }
        if audit.any_child_failed.load(Ordering::SeqCst) {
            // Any child failure retries the whole dispatch unconditionally,
            // bounded by the shared retry budget.
            if audit.retry_count.fetch_add(1, Ordering::SeqCst) < inner.retry_max {
                tracing::debug!(retry = audit.retry_count(), "audit retrying after child failure");
                continue;
            }
            return AuditPhase::Failed;
        }

        let state = audit.state();
        if state.audit_type.progress_is_per_server() {
            return AuditPhase::Complete;
        }

        // Re-read persisted progress: the audit is complete only when the
        // requested range is fully covered.
        let coverage = run_transaction(&inner.store, |tx| {
            progress::read_range_progress(tx, state.audit_type, state.id, &state.range)
        })
        .await;
        match coverage {
            Ok(tiling) if tiling.iter().all(|(_, p)| *p == RangePhase::Complete) => {
                return AuditPhase::Complete;
            }
            Ok(_) => {
                if audit.retry_count.fetch_add(1, Ordering::SeqCst) < inner.retry_max {
                    continue;
                }
                return AuditPhase::Failed;
            }
            Err(err) => {
                tracing::warn!(error = %err, "audit progress re-read failed");
                return AuditPhase::Failed;
            }
        }
    }
}

/// One dispatch round: splits remaining work by persisted progress, issues
/// tasks under the budget, and joins every child.
async fn dispatch_round(
    inner: &Arc<EngineInner>,
    audit: &Arc<LiveAudit>,
) -> Result<()> {
    let state = audit.state();
    let mut children: JoinSet<()> = JoinSet::new();

    if state.audit_type.progress_is_per_server() {
        for server in inner.directory.servers() {
            if server.is_tss {
                continue;
            }
            schedule_server_tasks(inner, audit, &state, server.id, &mut children).await?;
        }
    } else {
        schedule_range_tasks(inner, audit, &state, &mut children).await?;
    }

    while let Some(joined) = children.join_next().await {
        if joined.is_err() {
            audit.any_child_failed.store(true, Ordering::SeqCst);
        }
    }
    Ok(())
}

async fn schedule_server_tasks(
    inner: &Arc<EngineInner>,
    audit: &Arc<LiveAudit>,
    state: &AuditState,
    server: ServerId,
    children: &mut JoinSet<()>,
) -> Result<()> {
    let audit_type = state.audit_type;
    let id = state.id;
    let request = state.range.clone();
    let tiling = run_transaction(&inner.store, move |tx| {
        progress::read_server_progress(tx, audit_type, id, server, &request)
    })
    .await?;

    for (range, phase) in tiling {
        match phase {
            RangePhase::Complete => {}
            RangePhase::Error => {
                audit.found_error.store(true, Ordering::SeqCst);
            }
            RangePhase::Invalid => {
                let guard = audit.budget.acquire().await;
                audit.issued_count.fetch_add(1, Ordering::SeqCst);
                let inner = inner.clone();
                let audit = audit.clone();
                let state = state.clone();
                children.spawn(async move {
                    run_task(
                        &inner,
                        &audit,
                        &state,
                        TaskSpec::PerServer { server, range },
                        guard,
                    )
                    .await;
                });
            }
        }
    }
    Ok(())
}

async fn schedule_range_tasks(
    inner: &Arc<EngineInner>,
    audit: &Arc<LiveAudit>,
    state: &AuditState,
    children: &mut JoinSet<()>,
) -> Result<()> {
    let audit_type = state.audit_type;
    let id = state.id;
    let request = state.range.clone();
    let tiling = run_transaction(&inner.store, move |tx| {
        progress::read_range_progress(tx, audit_type, id, &request)
    })
    .await?;

    for (range, phase) in tiling {
        match phase {
            RangePhase::Complete => {}
            RangePhase::Error => {
                audit.found_error.store(true, Ordering::SeqCst);
            }
            RangePhase::Invalid => {
                let guard = audit.budget.acquire().await;
                audit.issued_count.fetch_add(1, Ordering::SeqCst);
                let inner = inner.clone();
                let audit = audit.clone();
                let state = state.clone();
                children.spawn(async move {
                    run_task(&inner, &audit, &state, TaskSpec::Range { range }, guard).await;
                });
            }
        }
    }
    Ok(())
}

// ============================================================================
// Per-Task Execution
// ============================================================================

enum TaskSpec {
    Range { range: KeyRange },
    PerServer { server: ServerId, range: KeyRange },
}

enum Selection {
    /// Executor plus comparison targets.
    Run {
        executor: ServerId,
        targets: Vec<ServerId>,
    },
    /// Not enough replicas for a meaningful comparison; trivially complete.
    Skip,
    /// No eligible executor right now; counts as a child failure.
    NoServer,
}

/// Picks the executing server and comparison targets for a range task.
fn select_servers(inner: &EngineInner, audit_type: AuditType, range: &KeyRange) -> Selection {
    let replicas = inner.directory.replicas_for(range);
    let in_primary = |s: &&StorageServerMeta| match &inner.primary_dc {
        Some(dc) => s.locality.dc == *dc,
        None => true,
    };

    match audit_type {
        AuditType::HaConsistency => {
            let Some(executor) = replicas.iter().find(in_primary) else {
                return Selection::NoServer;
            };
            // One comparison target per remote data center.
            let mut targets = Vec::new();
            for dc in &inner.remote_dcs {
                if let Some(remote) = replicas.iter().find(|s| s.locality.dc == *dc) {
                    targets.push(remote.id);
                }
            }
            if targets.is_empty() {
                return Selection::Skip;
            }
            Selection::Run {
                executor: executor.id,
                targets,
            }
        }
        AuditType::ReplicaConsistency => {
            let primary: Vec<&StorageServerMeta> = replicas.iter().filter(in_primary).collect();
            if primary.len() < 2 {
                return Selection::Skip;
            }
            Selection::Run {
                executor: primary[0].id,
                targets: primary[1..].iter().map(|s| s.id).collect(),
            }
        }
        AuditType::LocationMetadata => match replicas.iter().find(in_primary) {
            Some(executor) => Selection::Run {
                executor: executor.id,
                targets: Vec::new(),
            },
            None => Selection::NoServer,
        },
        AuditType::PerServerShardMap => Selection::NoServer,
    }
}

/// Executes one audit task, retrying the *range* (with a freshly selected
/// executor) on transient failure until the shared retry budget runs out.
async fn run_task(
    inner: &Arc<EngineInner>,
    audit: &Arc<LiveAudit>,
    state: &AuditState,
    spec: TaskSpec,
    mut guard: crate::budget::BudgetGuard,
) {
    loop {
        let (executor, targets, range, server_scoped) = match &spec {
            TaskSpec::PerServer { server, range } => (*server, Vec::new(), range.clone(), true),
            TaskSpec::Range { range } => match select_servers(inner, state.audit_type, range) {
                Selection::Run { executor, targets } => (executor, targets, range.clone(), false),
                Selection::Skip => {
                    let _ = record_progress(inner, state, None, range, RangePhase::Complete).await;
                    audit.completed_count.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                Selection::NoServer => {
                    audit.any_child_failed.store(true, Ordering::SeqCst);
                    return;
                }
            },
        };

        let request = AuditTaskRequest {
            audit_type: state.audit_type,
            audit_id: state.id,
            range: range.clone(),
            targets,
        };
        let attempt = tokio::time::timeout(
            inner.task_failure_window,
            inner.client.audit_storage(executor, request),
        )
        .await;

        let server = server_scoped.then_some(executor);
        match attempt {
            Ok(Ok(())) => {
                let _ = record_progress(inner, state, server, &range, RangePhase::Complete).await;
                audit.completed_count.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Ok(Err(AuditTaskError::Inconsistency)) => {
                audit.found_error.store(true, Ordering::SeqCst);
                let _ = record_progress(inner, state, server, &range, RangePhase::Error).await;
                return;
            }
            Ok(Err(AuditTaskError::Failed)) | Err(_) => {
                if server_scoped && !inner.directory.server_exists(executor) {
                    // The server left the cluster mid-audit; nothing to verify.
                    audit.completed_count.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                if audit.retry_count.fetch_add(1, Ordering::SeqCst) >= inner.retry_max {
                    audit.any_child_failed.store(true, Ordering::SeqCst);
                    return;
                }
                tracing::debug!(
                    audit = %state.id,
                    %executor,
                    range = %range,
                    "audit task failed; rescheduling range"
                );
                // Return the unit before re-queueing so other ranges can run.
                guard = {
                    drop(guard);
                    audit.budget.acquire().await
                };
            }
        }
    }
}

async fn record_progress(
    inner: &Arc<EngineInner>,
    state: &AuditState,
    server: Option<ServerId>,
    range: &KeyRange,
    phase: RangePhase,
) -> Result<()> {
    let audit_type = state.audit_type;
    let id = state.id;
    let range = range.clone();
    run_transaction(&inner.store, move |tx| match server {
        Some(server) => progress::persist_server_progress(tx, audit_type, id, server, &range, phase),
        None => progress::persist_range_progress(tx, audit_type, id, &range, phase),
    })
    .await
    .map_err(AuditError::from)
}

/// Writes the final audit row; Complete clears progress, Failed/Error keep
/// it for post-mortem.
async fn persist_final_phase(
    inner: &Arc<EngineInner>,
    state: &AuditState,
    phase: AuditPhase,
) -> Result<()> {
    let mut final_state = state.clone();
    final_state.phase = phase;
    run_transaction(&inner.store, move |tx| {
        tx.set_typed(keys::audit_key(final_state.audit_type, final_state.id), &final_state)?;
        if phase == AuditPhase::Complete {
            progress::clear_progress(tx, final_state.audit_type, final_state.id);
        }
        Ok::<_, lodestone_store::StoreError>(())
    })
    .await
    .map_err(AuditError::from)
}
