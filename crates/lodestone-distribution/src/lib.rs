//! # lodestone-distribution: the data distributor
//!
//! The singleton control-plane component of the cluster. It decides where
//! every key range lives, executes the moves that realize those decisions,
//! audits replica consistency in the background, and serves the
//! control-plane request surface.
//!
//! # Lifecycle
//!
//! One [`DataDistributor`] runs generations: each generation waits for
//! distribution to be enabled, takes the move-keys lock, loads the shard
//! map and in-flight data moves in one consistent snapshot, resumes them,
//! and then drives the steady-state actors (tracker, relocation queue, team
//! collections, wiggler, audit engine, request dispatch). An
//! expected-control error — a lock conflict, a configuration change, a
//! cancelled move, a missing destination team — unwinds the generation and
//! restarts from the top with cleared in-memory state. Anything else is
//! fatal; the cluster controller respawns a fresh instance, which wins the
//! lock exchange.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use lodestone_audit::{AuditEngine, StorageServerClient};
use lodestone_config::LodestoneConfig;
use lodestone_store::{keys, SystemStore};
use lodestone_types::{
    DdMode, DistributorId, KeyRange, MoveId, MoveKeysLock, StorageServerMeta,
};
use tokio::sync::mpsc;

pub mod bootstrap;
pub mod lock;
pub mod physical_shard;
pub mod queue;
pub mod relocation;
pub mod requests;
pub mod shard_map;
pub mod snapshot;
pub mod teams;
pub mod tracker;
pub mod wiggle;

mod context;
mod error;

pub use context::{ContextDirectory, DistributionContext};
pub use error::{DistributionError, Result};
pub use queue::RelocateShard;
pub use requests::{DistributorClient, DistributorRequest};

use requests::{BlobRestoreStatus, MetricsReply, ShardSample, WigglerStates};
use snapshot::{ClusterProcesses, SnapshotManager};
use tracker::ShardMetrics;

/// One per-shard load report from a storage server.
#[derive(Debug, Clone)]
pub struct MetricsSample {
    pub range: KeyRange,
    pub metrics: ShardMetrics,
}

/// External collaborators the distributor drives but does not own.
pub struct Collaborators {
    /// RPC surface of the storage servers, for audits.
    pub audit_client: Arc<dyn StorageServerClient>,
    /// Cluster processes touched by snapshots.
    pub processes: Arc<dyn ClusterProcesses>,
}

/// The data distributor singleton.
pub struct DataDistributor {
    store: SystemStore,
    config: LodestoneConfig,
    dd_id: DistributorId,
    servers: Vec<StorageServerMeta>,
    collaborators: Collaborators,
    snapshots: Arc<SnapshotManager>,
    tenants: lodestone_tenant::TenantManager,
    requests: mpsc::Receiver<DistributorRequest>,
    metrics: mpsc::Receiver<MetricsSample>,
    blob_restore_pending: bool,
}

/// Channels for feeding the distributor.
pub struct DistributorHandles {
    pub client: DistributorClient,
    pub metrics: mpsc::Sender<MetricsSample>,
}

impl DataDistributor {
    /// Builds a distributor over `store` with a fresh instance id.
    pub fn new(
        store: SystemStore,
        config: LodestoneConfig,
        servers: Vec<StorageServerMeta>,
        collaborators: Collaborators,
    ) -> (Self, DistributorHandles) {
        let (request_tx, request_rx) = mpsc::channel(64);
        let (metrics_tx, metrics_rx) = mpsc::channel(256);
        let snapshots = Arc::new(SnapshotManager::new(
            store.clone(),
            &config.knobs,
            collaborators.processes.clone(),
        ));
        let tenants =
            lodestone_tenant::TenantManager::new(store.clone(), &config.database, &config.knobs);
        let distributor = Self {
            store,
            config,
            dd_id: DistributorId::random(),
            servers,
            collaborators,
            snapshots,
            tenants,
            requests: request_rx,
            metrics: metrics_rx,
            blob_restore_pending: false,
        };
        let handles = DistributorHandles {
            client: DistributorClient::new(request_tx),
            metrics: metrics_tx,
        };
        (distributor, handles)
    }

    pub fn id(&self) -> DistributorId {
        self.dd_id
    }

    /// Runs generations until halted or a fatal error.
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.run_generation().await {
                Ok(()) => {
                    tracing::info!(dd = %self.dd_id, "distributor halted");
                    return Ok(());
                }
                Err(DistributionError::Halted) => {
                    tracing::info!(dd = %self.dd_id, "distributor control channel closed");
                    return Ok(());
                }
                Err(err) if err.is_expected_control() => {
                    tracing::info!(dd = %self.dd_id, error = %err, "distributor restarting");
                }
                Err(err) => {
                    tracing::error!(dd = %self.dd_id, error = %err, "distributor failed");
                    return Err(err);
                }
            }
        }
    }

    /// One generation: bootstrap, resume, steady state.
    async fn run_generation(&mut self) -> Result<()> {
        // 1. Park until distribution is enabled.
        bootstrap::wait_enabled(&self.store).await?;

        // 2. Take the move-keys lock.
        let lock = lock::take_move_keys_lock(&self.store, self.dd_id).await?;

        // Fresh in-memory state for this generation.
        let ctx = DistributionContext::new(
            self.store.clone(),
            self.config.knobs.clone(),
            self.config.database.clone(),
            self.dd_id,
            &self.servers,
        );

        // 3. Initialize audit metadata in parallel with the rest of
        // bootstrap.
        let audit = AuditEngine::new(
            self.store.clone(),
            self.dd_id,
            &self.config.knobs,
            &self.config.database,
            ContextDirectory::new(ctx.clone()),
            self.collaborators.audit_client.clone(),
        );
        let audit_init = {
            let audit = audit.clone();
            tokio::spawn(async move { audit.init_metadata().await })
        };

        // 4. Leave once any security quiesce has passed.
        bootstrap::wait_not_quiesce(&self.store).await?;

        // 5-6. Load the initial distribution in one consistent snapshot.
        self.load_initial_distribution(&ctx, &lock).await?;
        let moves = shard_map::load_data_moves(&self.store).await?;

        // 7. Resume from shards.
        {
            let map = ctx.shard_map.lock().expect("shard map poisoned");
            let mut tracker = ctx.tracker.lock().expect("tracker poisoned");
            let relocations =
                bootstrap::resume_from_shards(&map, &ctx.db, &mut tracker);
            drop(tracker);
            drop(map);
            let mut queue = ctx.queue.lock().expect("queue poisoned");
            for relocation in relocations {
                queue.enqueue(relocation);
            }
        }

        // 8. Resume from data moves, after shard resume and audit init.
        match audit_init.await {
            Ok(result) => result.map_err(audit_error_to_distribution)?,
            Err(join_err) => {
                return Err(DistributionError::Internal(format!(
                    "audit metadata init panicked: {join_err}"
                )))
            }
        }
        {
            let map = ctx.shard_map.lock().expect("shard map poisoned");
            let mut teams = ctx.teams.lock().expect("teams poisoned");
            let relocations = bootstrap::resume_from_data_moves(&map, moves, &mut teams)?;
            drop(teams);
            drop(map);
            let mut queue = ctx.queue.lock().expect("queue poisoned");
            for relocation in relocations {
                queue.enqueue(relocation);
            }
        }

        tracing::info!(dd = %self.dd_id, "distributor initialized");

        // 9-10. Steady state until halt, restart signal, or failure.
        self.steady_state(&ctx, &lock, &audit).await
    }

    /// Loads the shard map, seeding an initial all-keys shard on an empty
    /// cluster.
    async fn load_initial_distribution(
        &self,
        ctx: &DistributionContext,
        lock: &MoveKeysLock,
    ) -> Result<()> {
        ctx.reload_shard_map().await?;
        let empty = ctx.shard_map.lock().expect("shard map poisoned").is_empty();
        if empty {
            let primary = {
                let teams = ctx.teams.lock().expect("teams poisoned");
                teams.pick_destination(&[])?
            };
            let remote = match &ctx.remote_teams {
                Some(remote) => {
                    Some(remote.lock().expect("teams poisoned").pick_destination(&[])?)
                }
                None => None,
            };
            shard_map::ShardMap::initialize(&self.store, lock, &primary, remote.as_ref()).await?;
            ctx.reload_shard_map().await?;
            tracing::info!(team = %primary, "initialized empty shard map");
        }
        ctx.shard_map
            .lock()
            .expect("shard map poisoned")
            .validate_coalesced()?;
        Ok(())
    }

    /// The steady-state dispatch loop: control requests, metrics intake,
    /// relocation launches, wiggle ticks, and the mode watch.
    async fn steady_state(
        &mut self,
        ctx: &Arc<DistributionContext>,
        lock: &MoveKeysLock,
        audit: &AuditEngine,
    ) -> Result<()> {
        let mut mode_watch = self.store.watch(Bytes::copy_from_slice(keys::DD_MODE));
        mode_watch.borrow_and_update();
        let mut relocation_tick = tokio::time::interval(Duration::from_millis(50));
        let mut rebalance_tick = tokio::time::interval(Duration::from_secs(10));
        rebalance_tick.reset();
        let mut wiggle_tick = tokio::time::interval(Duration::from_secs(60));
        wiggle_tick.reset(); // no wiggle in the first minute of a generation
        let mut metrics_open = true;

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        return Err(DistributionError::Halted);
                    };
                    if let ControlFlow::Stop(result) =
                        self.handle_request(ctx, lock, audit, request).await
                    {
                        return result;
                    }
                }
                sample = self.metrics.recv(), if metrics_open => {
                    match sample {
                        Some(sample) => self.note_metrics(ctx, sample),
                        None => metrics_open = false,
                    }
                }
                _ = relocation_tick.tick() => {
                    self.drive_relocations(ctx, lock).await?;
                }
                _ = rebalance_tick.tick() => {
                    if let Some(relocation) = relocation::plan_rebalance(ctx) {
                        ctx.queue.lock().expect("queue poisoned").enqueue(relocation);
                    }
                }
                _ = wiggle_tick.tick() => {
                    self.drive_wiggle(ctx, lock).await?;
                }
                changed = mode_watch.changed() => {
                    if changed.is_err() {
                        return Err(DistributionError::Internal("mode watch closed".into()));
                    }
                    if bootstrap::read_mode(&self.store).await? != DdMode::Enabled {
                        return Err(DistributionError::ConfigChanged);
                    }
                }
            }
        }
    }

    fn note_metrics(&self, ctx: &DistributionContext, sample: MetricsSample) {
        let decision = {
            let mut tracker = ctx.tracker.lock().expect("tracker poisoned");
            tracker.note_metrics(&sample.range, sample.metrics, unix_now())
        };
        if let Some(relocation) = decision {
            ctx.queue.lock().expect("queue poisoned").enqueue(relocation);
        }
    }

    /// Launches every ready relocation and executes it to completion.
    async fn drive_relocations(
        &self,
        ctx: &Arc<DistributionContext>,
        lock: &MoveKeysLock,
    ) -> Result<()> {
        let launched = ctx.queue.lock().expect("queue poisoned").launch_ready();
        for relocation in launched {
            let ticket = MoveId::random();
            ctx.queue
                .lock()
                .expect("queue poisoned")
                .note_launched(ticket, relocation.clone());
            match relocation::execute_relocation(ctx, lock, relocation).await {
                Ok(()) => {
                    ctx.queue.lock().expect("queue poisoned").complete(ticket);
                }
                Err(err) if err.retryable_execution() => {
                    tracing::warn!(error = %err, "relocation failed; requeueing");
                    ctx.queue.lock().expect("queue poisoned").retry(ticket);
                }
                Err(err) => {
                    ctx.queue.lock().expect("queue poisoned").complete(ticket);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Takes the next wiggle candidate, excludes it, and drains its shards
    /// onto healthy teams.
    async fn drive_wiggle(
        &self,
        ctx: &Arc<DistributionContext>,
        lock: &MoveKeysLock,
    ) -> Result<()> {
        let now = unix_now();
        let candidate = {
            let mut wiggler = ctx.wiggler.lock().expect("wiggler poisoned");
            wiggler.next_server_id(now, true)
        };
        let Some(server) = candidate else {
            return Ok(());
        };
        {
            let mut teams = ctx.teams.lock().expect("teams poisoned");
            teams.mark_excluded(server);
            teams.build_teams();
        }
        relocation::drain_server(ctx, lock, server).await?;
        ctx.wiggler
            .lock()
            .expect("wiggler poisoned")
            .finish_wiggle(unix_now());
        Ok(())
    }

    async fn handle_request(
        &mut self,
        ctx: &Arc<DistributionContext>,
        lock: &MoveKeysLock,
        audit: &AuditEngine,
        request: DistributorRequest,
    ) -> ControlFlow {
        match request {
            DistributorRequest::Halt { requester, reply } => {
                tracing::info!(%requester, "halt requested");
                let _ = reply.send(());
                return ControlFlow::Stop(Ok(()));
            }
            DistributorRequest::GetMetrics {
                range,
                shard_limit,
                mid_only,
                reply,
            } => {
                let _ = reply.send(self.collect_metrics(ctx, &range, shard_limit, mid_only));
            }
            DistributorRequest::Snapshot { id, payload, reply } => {
                let snapshots = self.snapshots.clone();
                tokio::spawn(async move {
                    let _ = reply.send(snapshots.handle(id, &payload).await);
                });
            }
            DistributorRequest::ExclusionSafetyCheck { addresses, reply } => {
                let teams = ctx.teams.lock().expect("teams poisoned");
                let excluded = requests::resolve_addresses(&addresses, &teams.servers());
                let _ = reply.send(teams.exclusion_is_safe(&excluded));
            }
            DistributorRequest::GetWigglerState { reply } => {
                let primary = ctx.wiggler.lock().expect("wiggler poisoned").state();
                let remote = ctx
                    .remote_wiggler
                    .as_ref()
                    .map(|w| w.lock().expect("wiggler poisoned").state());
                let _ = reply.send(WigglerStates { primary, remote });
            }
            DistributorRequest::TriggerAudit {
                range,
                audit_type,
                cancel,
                reply,
            } => {
                let result = match cancel {
                    Some(id) => audit.cancel(audit_type, id).await.map(|()| id),
                    None => audit.launch(range, audit_type).await,
                };
                let _ = reply.send(result);
            }
            DistributorRequest::TenantsOverQuota { usage, reply } => {
                let tenants = self.tenants.clone();
                tokio::spawn(async move {
                    let over = tenants.tenants_over_quota(&usage).await.unwrap_or_default();
                    let _ = reply.send(over);
                });
            }
            DistributorRequest::PrepareBlobRestore {
                range,
                requester,
                reply,
            } => {
                let status = if self.blob_restore_pending {
                    BlobRestoreStatus::ConflictBlobRestore
                } else if self.snapshots.in_progress() {
                    BlobRestoreStatus::ConflictSnapshot
                } else {
                    self.blob_restore_pending = true;
                    BlobRestoreStatus::Success
                };
                tracing::info!(%requester, range = %range, ?status, "blob restore admission");
                let _ = reply.send(status);
                if status == BlobRestoreStatus::Success {
                    // Admission forces a restart so the next generation
                    // plans around the restore.
                    return ControlFlow::Stop(Err(DistributionError::ConfigChanged));
                }
            }
            DistributorRequest::RemoveFailedServer { id, reply } => {
                tracing::info!(server = %id, "removing failed server");
                {
                    let mut teams = ctx.teams.lock().expect("teams poisoned");
                    teams.report_server_failure(id);
                    teams.build_teams();
                }
                if let Some(remote) = &ctx.remote_teams {
                    let mut teams = remote.lock().expect("teams poisoned");
                    teams.report_server_failure(id);
                    teams.build_teams();
                }
                ctx.wiggler
                    .lock()
                    .expect("wiggler poisoned")
                    .remove_server(id, unix_now());
                if let Some(remote) = &ctx.remote_wiggler {
                    remote
                        .lock()
                        .expect("wiggler poisoned")
                        .remove_server(id, unix_now());
                }

                match relocation::drain_server(ctx, lock, id).await {
                    Ok(drained) => {
                        // The next generation rebuilds its collections
                        // without the removed server.
                        self.servers.retain(|s| s.id != id);
                        let _ = reply.send(Ok(drained));
                        return ControlFlow::Stop(Err(DistributionError::ConfigChanged));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err.clone()));
                        return ControlFlow::Stop(Err(err));
                    }
                }
            }
        }
        ControlFlow::Continue
    }

    fn collect_metrics(
        &self,
        ctx: &DistributionContext,
        range: &KeyRange,
        shard_limit: usize,
        mid_only: bool,
    ) -> MetricsReply {
        let map = ctx.shard_map.lock().expect("shard map poisoned");
        let tracker = ctx.tracker.lock().expect("tracker poisoned");
        let samples: Vec<ShardSample> = map
            .overlapping(range)
            .into_iter()
            .take(shard_limit)
            .map(|shard| {
                let metrics = tracker
                    .metrics_for(&shard.range.begin)
                    .unwrap_or_default();
                ShardSample {
                    range: shard.range,
                    metrics,
                }
            })
            .collect();
        if mid_only {
            let mut sizes: Vec<u64> = samples.iter().map(|s| s.metrics.bytes).collect();
            sizes.sort_unstable();
            let median = sizes.get(sizes.len() / 2).copied().unwrap_or(0);
            MetricsReply::MedianShardSize(median)
        } else {
            MetricsReply::Shards(samples)
        }
    }
}

enum ControlFlow {
    Continue,
    Stop(Result<()>),
}

impl DistributionError {
    /// Failures worth another attempt at the same relocation rather than a
    /// generation restart.
    fn retryable_execution(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}

fn audit_error_to_distribution(err: lodestone_audit::AuditError) -> DistributionError {
    match err {
        lodestone_audit::AuditError::Store(e) => DistributionError::Store(e),
        other => DistributionError::Internal(other.to_string()),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests;
