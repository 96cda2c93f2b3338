//! The shard tracker.
//!
//! Observes per-shard size and bandwidth estimates reported by storage
//! servers, debounces them, and emits split, merge, and rebalance
//! relocations.

use std::collections::BTreeMap;

use bytes::Bytes;
use lodestone_config::Knobs;
use lodestone_types::{KeyRange, RelocateReason};

use crate::queue::RelocateShard;

/// Smoothed per-shard load estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardMetrics {
    pub bytes: u64,
    /// Bytes written per second.
    pub write_bandwidth: u64,
    /// Bytes read per second.
    pub read_bandwidth: u64,
}

#[derive(Debug, Clone, Default)]
struct TrackedShard {
    end: Bytes,
    metrics: ShardMetrics,
    /// When the shard first exceeded the split thresholds.
    oversized_since: Option<u64>,
    /// When the shard first dropped below the merge threshold.
    undersized_since: Option<u64>,
}

/// Debounced split/merge decision engine.
#[derive(Debug)]
pub struct ShardTracker {
    shards: BTreeMap<Bytes, TrackedShard>,
    max_bytes: u64,
    min_bytes: u64,
    split_bandwidth: u64,
    debounce_sec: u64,
}

impl ShardTracker {
    pub fn new(knobs: &Knobs) -> Self {
        Self {
            shards: BTreeMap::new(),
            max_bytes: knobs.shard_max_bytes,
            min_bytes: knobs.shard_min_bytes,
            split_bandwidth: knobs.shard_split_bandwidth,
            debounce_sec: knobs.metrics_debounce_sec as u64,
        }
    }

    /// Starts tracking a shard. Called for every shard at bootstrap and for
    /// new shards after splits and merges.
    pub fn register_shard(&mut self, range: &KeyRange) {
        self.shards
            .entry(range.begin.clone())
            .or_insert_with(|| TrackedShard {
                end: range.end.clone(),
                ..TrackedShard::default()
            });
    }

    /// Stops tracking shards covered by `range` (merged away).
    pub fn forget_range(&mut self, range: &KeyRange) {
        self.shards.retain(|begin, _| !range.contains_key(begin));
    }

    pub fn tracked_count(&self) -> usize {
        self.shards.len()
    }

    /// The latest sample recorded for the shard beginning at `begin`.
    pub fn metrics_for(&self, begin: &Bytes) -> Option<ShardMetrics> {
        self.shards.get(begin).map(|s| s.metrics)
    }

    /// Feeds one metrics sample and returns the relocation it triggers, if
    /// the condition has persisted past the debounce window.
    pub fn note_metrics(
        &mut self,
        range: &KeyRange,
        metrics: ShardMetrics,
        now: u64,
    ) -> Option<RelocateShard> {
        let debounce = self.debounce_sec;
        let oversized =
            metrics.bytes > self.max_bytes || metrics.write_bandwidth > self.split_bandwidth;
        let undersized = metrics.bytes < self.min_bytes / 2;

        let shard = self.shards.entry(range.begin.clone()).or_insert_with(|| {
            TrackedShard {
                end: range.end.clone(),
                ..TrackedShard::default()
            }
        });
        shard.metrics = metrics;
        shard.end = range.end.clone();

        if oversized {
            shard.undersized_since = None;
            let since = *shard.oversized_since.get_or_insert(now);
            if now.saturating_sub(since) >= debounce {
                shard.oversized_since = None;
                return Some(RelocateShard::new(range.clone(), RelocateReason::Split));
            }
            return None;
        }

        if undersized {
            shard.oversized_since = None;
            let since = *shard.undersized_since.get_or_insert(now);
            if now.saturating_sub(since) >= debounce {
                if let Some(merged) = self.merge_candidate(range) {
                    if let Some(tracked) = self.shards.get_mut(&range.begin) {
                        tracked.undersized_since = None;
                    }
                    return Some(RelocateShard::new(merged, RelocateReason::Merge));
                }
            }
            return None;
        }

        shard.oversized_since = None;
        shard.undersized_since = None;
        None
    }

    /// The combined range of this shard and its successor, when merging
    /// them stays under the minimum-size threshold.
    fn merge_candidate(&self, range: &KeyRange) -> Option<KeyRange> {
        let next = self.shards.get(&range.end)?;
        let this = self.shards.get(&range.begin)?;
        if this.metrics.bytes + next.metrics.bytes < self.min_bytes {
            Some(KeyRange::new(range.begin.clone(), next.end.clone()))
        } else {
            None
        }
    }
}
