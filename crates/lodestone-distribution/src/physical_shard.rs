//! Physical shards.
//!
//! Storage engines that encode location metadata group contiguous key
//! ranges into *physical shards*: units the engine can open, move, and
//! drop as one. The collection assigns each range a physical shard id,
//! joining a range onto its predecessor's shard when they are contiguous.

use std::collections::BTreeMap;

use bytes::Bytes;
use lodestone_types::KeyRange;

/// Identifier of a physical shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalShardId(u64);

impl PhysicalShardId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PhysicalShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ps{}", self.0)
    }
}

/// Maps key ranges to physical shards.
#[derive(Debug, Default)]
pub struct PhysicalShardCollection {
    /// Range begin to `(end, shard)`.
    ranges: BTreeMap<Bytes, (Bytes, PhysicalShardId)>,
    next_id: u64,
}

impl PhysicalShardCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `range` a physical shard: the predecessor's when they are
    /// contiguous, a fresh one otherwise.
    pub fn note_range(&mut self, range: &KeyRange) -> PhysicalShardId {
        if let Some(existing) = self.shard_for(range) {
            return existing;
        }
        let joined = self
            .ranges
            .range(..range.begin.clone())
            .next_back()
            .filter(|(_, (end, _))| *end == range.begin)
            .map(|(_, (_, id))| *id);
        let id = joined.unwrap_or_else(|| {
            self.next_id += 1;
            PhysicalShardId(self.next_id)
        });
        self.ranges
            .insert(range.begin.clone(), (range.end.clone(), id));
        id
    }

    /// The physical shard exactly covering `range`, if assigned.
    pub fn shard_for(&self, range: &KeyRange) -> Option<PhysicalShardId> {
        self.ranges
            .get(&range.begin)
            .filter(|(end, _)| *end == range.end)
            .map(|(_, id)| *id)
    }

    /// Reassigns `range` to `shard` (a completed move landed it elsewhere).
    pub fn move_range(&mut self, range: &KeyRange, shard: PhysicalShardId) {
        self.ranges
            .insert(range.begin.clone(), (range.end.clone(), shard));
    }

    /// Drops ranges covered by `range` (merged away).
    pub fn forget_range(&mut self, range: &KeyRange) {
        self.ranges.retain(|begin, _| !range.contains_key(begin));
    }

    /// All ranges of one physical shard, in key order.
    pub fn ranges_of(&self, shard: PhysicalShardId) -> Vec<KeyRange> {
        self.ranges
            .iter()
            .filter(|(_, (_, id))| *id == shard)
            .map(|(begin, (end, _))| KeyRange::new(begin.clone(), end.clone()))
            .collect()
    }

    pub fn shard_count(&self) -> usize {
        let mut ids: Vec<PhysicalShardId> = self.ranges.values().map(|(_, id)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}
