//! Configuration for the Lodestone distributor.
//!
//! Two structures flow into `init()`:
//! - [`Knobs`]: tuning constants (parallelism caps, retry budgets, intervals).
//!   Tests that need to perturb a knob mutate the structure they pass in;
//!   there is no process-global knob registry.
//! - [`DatabaseConfiguration`]: the replicated-cluster shape (replication
//!   factor, regions, storage engine, tenant mode).
//!
//! [`ConfigLoader`] merges sources with the usual precedence:
//! environment (`LODESTONE_*`) > `lodestone.toml` > built-in defaults.

use lodestone_types::{ClusterType, StorageEngine, TenantMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

// ============================================================================
// Knobs
// ============================================================================

/// Tuning constants for the distributor.
///
/// Every field has a production default; tests override by mutating the
/// struct before handing it to `init()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Knobs {
    /// Ceiling on concurrently executing audit tasks per audit.
    pub concurrent_audit_task_count_max: usize,
    /// Per-audit retry budget before the audit is persisted as failed.
    pub audit_retry_count_max: u32,
    /// Finished audits retained per type before the sweeper deletes them.
    pub persist_finish_audit_count: usize,
    /// Sustained-failure window for one audit task RPC, seconds.
    pub audit_task_failure_window_sec: f64,

    /// Maximum relocations in flight at once.
    pub dd_move_keys_parallelism: usize,
    /// Shards larger than this are split.
    pub shard_max_bytes: u64,
    /// Adjacent shards jointly smaller than this are merged.
    pub shard_min_bytes: u64,
    /// Write bandwidth (bytes/sec) above which a shard is split regardless
    /// of size.
    pub shard_split_bandwidth: u64,
    /// Seconds a metric sample must persist before the tracker acts on it.
    pub metrics_debounce_sec: f64,

    /// Servers younger than this are not wiggled unless wrong-configured.
    pub dd_storage_wiggle_min_ss_age_sec: u64,

    /// Seconds between tombstone-cleanup watermark advances.
    pub tenant_tombstone_cleanup_interval_sec: u64,
    /// Driver-side timeout for one tenant operation, seconds.
    pub tenant_op_timeout_sec: u64,
    /// Upper bound on the random skew added to allocated tenant ids; zero
    /// in production, nonzero only under test perturbation.
    pub tenant_id_skew_max: u64,

    /// Storage processes that may miss a cluster snapshot.
    pub max_storage_snapshot_fault_tolerance: usize,
    /// Coordinator processes that may miss a cluster snapshot.
    pub max_coordinator_snapshot_fault_tolerance: usize,
    /// Seconds a finished snapshot result answers duplicate requests.
    pub snap_minimum_time_gap_sec: u64,
    /// Overall bound on one snapshot drive, seconds.
    pub snap_create_max_timeout_sec: u64,

    /// Storage engines encode shard-location metadata locally.
    pub shard_encode_location_metadata: bool,
    /// Group contiguous ranges into physical shards.
    pub enable_dd_physical_shard: bool,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            concurrent_audit_task_count_max: 8,
            audit_retry_count_max: 10,
            persist_finish_audit_count: 10,
            audit_task_failure_window_sec: 2.0,

            dd_move_keys_parallelism: 15,
            shard_max_bytes: 250_000_000,
            shard_min_bytes: 25_000_000,
            shard_split_bandwidth: 50_000_000,
            metrics_debounce_sec: 5.0,

            dd_storage_wiggle_min_ss_age_sec: 8 * 60 * 60,

            tenant_tombstone_cleanup_interval_sec: 60,
            tenant_op_timeout_sec: 30,
            tenant_id_skew_max: 0,

            max_storage_snapshot_fault_tolerance: 1,
            max_coordinator_snapshot_fault_tolerance: 1,
            snap_minimum_time_gap_sec: 5,
            snap_create_max_timeout_sec: 30,

            shard_encode_location_metadata: false,
            enable_dd_physical_shard: false,
        }
    }
}

// ============================================================================
// Database Configuration
// ============================================================================

/// One replication region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Data-center id servers in this region report in their locality.
    pub dc: String,
    /// True for the region serving commits.
    pub primary: bool,
}

/// The replicated-cluster shape the distributor realizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfiguration {
    /// Replicas per team.
    pub replication_factor: usize,
    /// 1 for single-region, 2 when a remote region holds a full copy.
    pub usable_regions: usize,
    /// Region list; empty means locality-blind single region.
    pub regions: Vec<RegionConfig>,
    /// Engine every storage server should run.
    pub storage_engine: StorageEngine,
    pub tenant_mode: TenantMode,
    pub cluster_type: ClusterType,
    /// Cluster-assigned high 16 bits of every allocated tenant id.
    pub tenant_id_prefix: u16,
    /// Hard cap on tenant count.
    pub max_tenants_per_cluster: u64,
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            usable_regions: 1,
            regions: Vec::new(),
            storage_engine: StorageEngine::SsdBtreeV2,
            tenant_mode: TenantMode::Disabled,
            cluster_type: ClusterType::Standalone,
            tenant_id_prefix: 0,
            max_tenants_per_cluster: 1_000_000,
        }
    }
}

impl DatabaseConfiguration {
    /// The data-center id of the primary region, if regions are configured.
    pub fn primary_dc(&self) -> Option<&str> {
        self.regions
            .iter()
            .find(|r| r.primary)
            .map(|r| r.dc.as_str())
    }

    /// Data-center ids of remote regions, in configuration order.
    pub fn remote_dcs(&self) -> Vec<&str> {
        self.regions
            .iter()
            .filter(|r| !r.primary)
            .map(|r| r.dc.as_str())
            .collect()
    }
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Everything the distributor is configured with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LodestoneConfig {
    pub knobs: Knobs,
    pub database: DatabaseConfiguration,
}

impl LodestoneConfig {
    /// Loads configuration from the default sources rooted at `project_dir`.
    pub fn load(project_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        ConfigLoader::new()
            .with_project_dir(project_dir.as_ref().to_path_buf())
            .load()
    }
}

/// Project config file name.
pub fn project_config_file(project_dir: &Path) -> PathBuf {
    project_dir.join("lodestone.toml")
}

#[cfg(test)]
mod tests;
