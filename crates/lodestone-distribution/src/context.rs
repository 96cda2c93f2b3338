//! The shared distribution context.
//!
//! The distributor, team collections, tracker, and queue reference each
//! other cyclically in spirit; the cycle is broken by this arena-style
//! context that all of them co-own. No component owns another.

use std::sync::{Arc, Mutex};

use lodestone_audit::ServerDirectory;
use lodestone_config::{DatabaseConfiguration, Knobs};
use lodestone_store::{keys, run_transaction, SystemStore};
use lodestone_types::{
    DataMoveMetadata, DistributorId, KeyRange, MoveId, ServerId, StorageServerMeta,
};

use crate::physical_shard::PhysicalShardCollection;
use crate::queue::RelocationQueue;
use crate::shard_map::ShardMap;
use crate::teams::TeamCollection;
use crate::tracker::ShardTracker;
use crate::wiggle::StorageWiggler;
use crate::Result;

/// One distributor generation's mutable state, shared across its actors.
pub struct DistributionContext {
    pub store: SystemStore,
    pub knobs: Knobs,
    pub db: DatabaseConfiguration,
    pub dd_id: DistributorId,
    pub shard_map: Mutex<ShardMap>,
    pub teams: Mutex<TeamCollection>,
    pub remote_teams: Option<Mutex<TeamCollection>>,
    pub tracker: Mutex<ShardTracker>,
    pub queue: Mutex<RelocationQueue>,
    pub wiggler: Mutex<StorageWiggler>,
    pub remote_wiggler: Option<Mutex<StorageWiggler>>,
    pub physical_shards: Mutex<PhysicalShardCollection>,
}

impl DistributionContext {
    /// Builds a fresh generation context: team collections per region,
    /// wigglers, tracker, queue, and an empty shard map awaiting load.
    pub fn new(
        store: SystemStore,
        knobs: Knobs,
        db: DatabaseConfiguration,
        dd_id: DistributorId,
        servers: &[StorageServerMeta],
    ) -> Arc<Self> {
        let primary_dc = db.primary_dc().map(str::to_owned);
        let remote_dc = db.remote_dcs().first().map(|s| (*s).to_owned());

        let mut teams = TeamCollection::new(primary_dc, db.replication_factor);
        let mut wiggler = StorageWiggler::new(knobs.dd_storage_wiggle_min_ss_age_sec);
        let mut remote_teams = (db.usable_regions > 1)
            .then(|| TeamCollection::new(remote_dc, db.replication_factor));
        let mut remote_wiggler = remote_teams
            .as_ref()
            .map(|_| StorageWiggler::new(knobs.dd_storage_wiggle_min_ss_age_sec));

        for server in servers {
            teams.register_server(server.clone());
            if teams.server(server.id).is_some() {
                wiggler.add_server(server, server.created_at);
            } else if let (Some(remote), Some(remote_wiggle)) =
                (remote_teams.as_mut(), remote_wiggler.as_mut())
            {
                remote.register_server(server.clone());
                if remote.server(server.id).is_some() {
                    remote_wiggle.add_server(server, server.created_at);
                }
            }
        }
        teams.build_teams();
        if let Some(remote) = remote_teams.as_mut() {
            remote.build_teams();
        }

        Arc::new(Self {
            tracker: Mutex::new(ShardTracker::new(&knobs)),
            queue: Mutex::new(RelocationQueue::new(knobs.dd_move_keys_parallelism)),
            shard_map: Mutex::new(ShardMap::default()),
            teams: Mutex::new(teams),
            remote_teams: remote_teams.map(Mutex::new),
            wiggler: Mutex::new(wiggler),
            remote_wiggler: remote_wiggler.map(Mutex::new),
            physical_shards: Mutex::new(PhysicalShardCollection::new()),
            store,
            knobs,
            db,
            dd_id,
        })
    }

    /// Re-reads the shard map after a durable mutation.
    pub async fn reload_shard_map(&self) -> Result<()> {
        let fresh = ShardMap::load(&self.store).await?;
        *self.shard_map.lock().expect("shard map poisoned") = fresh;
        Ok(())
    }

    /// The persisted record of one data move, if present.
    pub async fn persisted_move(&self, id: MoveId) -> Result<Option<DataMoveMetadata>> {
        run_transaction(&self.store, move |tx| {
            Ok(tx.get_typed::<DataMoveMetadata>(keys::data_move_key(id))?)
        })
        .await
    }

    /// Metadata for a registered server, searching both regions.
    pub fn server_meta(&self, id: ServerId) -> Option<StorageServerMeta> {
        let primary = self.teams.lock().expect("teams poisoned").server(id).cloned();
        primary.or_else(|| {
            self.remote_teams.as_ref().and_then(|remote| {
                remote.lock().expect("teams poisoned").server(id).cloned()
            })
        })
    }

    /// All registered servers across regions.
    pub fn all_servers(&self) -> Vec<StorageServerMeta> {
        let mut servers = self.teams.lock().expect("teams poisoned").servers();
        if let Some(remote) = &self.remote_teams {
            servers.extend(remote.lock().expect("teams poisoned").servers());
        }
        servers
    }
}

/// Topology view handed to the audit engine, backed by the context.
pub struct ContextDirectory {
    ctx: Arc<DistributionContext>,
}

impl ContextDirectory {
    pub fn new(ctx: Arc<DistributionContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }
}

impl ServerDirectory for ContextDirectory {
    fn servers(&self) -> Vec<StorageServerMeta> {
        self.ctx.all_servers()
    }

    fn server_exists(&self, id: ServerId) -> bool {
        self.ctx.server_meta(id).is_some()
    }

    fn replicas_for(&self, range: &KeyRange) -> Vec<StorageServerMeta> {
        let owners: Vec<ServerId> = {
            let map = self.ctx.shard_map.lock().expect("shard map poisoned");
            let mut ids = Vec::new();
            for shard in map.overlapping(range) {
                ids.extend(shard.entry.src.iter().copied());
                ids.extend(shard.entry.remote_src.iter().copied());
            }
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        owners
            .into_iter()
            .filter_map(|id| self.ctx.server_meta(id))
            .collect()
    }
}
