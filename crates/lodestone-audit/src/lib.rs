//! # lodestone-audit: background storage audits
//!
//! A concurrent, retryable, persisted background job that verifies, across
//! an arbitrary key range and without blocking user traffic:
//!
//! - **replica consistency** — replicas of every key are byte-identical,
//! - **HA consistency** — replicas across regions are identical,
//! - **location metadata** — the authoritative shard map agrees with
//!   storage-server self-reports,
//! - **per-server shard map** — each server's local shard map matches the
//!   global one.
//!
//! # Design
//!
//! Each live audit is an actor tree: a root core task dispatches child
//! tasks over the unverified pieces of the requested range, bounded by a
//! reactive [`TaskBudget`]. Progress is persisted per piece, so a crashed
//! or restarted distributor resumes from the `Running` row on disk and
//! skips what is already verified. Completion clears progress; failure and
//! error outcomes retain it for post-mortem. A sweeper keeps only the most
//! recent finished audits per type.

mod budget;
mod client;
mod engine;
mod error;
mod progress;

pub use budget::{BudgetGuard, TaskBudget};
pub use client::{
    AuditTaskError, AuditTaskRequest, BoxFuture, ServerDirectory, StorageServerClient,
};
pub use engine::{AuditContext, AuditEngine, LiveAudit};
pub use error::{AuditError, Result};
