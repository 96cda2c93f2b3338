//! The relocation queue.
//!
//! Pending shard moves wait here ordered by priority (FIFO within one
//! priority). The queue admits at most one in-flight move per range and
//! bounds total parallelism by the move-keys parallelism knob.

use std::collections::{BinaryHeap, HashMap};

use lodestone_types::{KeyRange, MoveId, RelocatePriority, RelocateReason};

/// One requested shard relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocateShard {
    pub keys: KeyRange,
    pub priority: RelocatePriority,
    pub reason: RelocateReason,
    /// True when this relocation unwinds a cancelled data move rather than
    /// executing a new one.
    pub cancelled: bool,
    /// The persisted move this relocation resumes or cancels, if any.
    pub data_move: Option<MoveId>,
}

impl RelocateShard {
    pub fn new(keys: KeyRange, reason: RelocateReason) -> Self {
        Self {
            keys,
            priority: reason.priority(),
            reason,
            cancelled: false,
            data_move: None,
        }
    }
}

#[derive(Debug)]
struct Pending {
    relocation: RelocateShard,
    seq: u64,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.relocation.priority == other.relocation.priority && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then FIFO within a priority.
        self.relocation
            .priority
            .cmp(&other.relocation.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of pending relocations with per-range exclusion.
#[derive(Debug, Default)]
pub struct RelocationQueue {
    pending: BinaryHeap<Pending>,
    in_flight: HashMap<MoveId, RelocateShard>,
    seq: u64,
    parallelism: usize,
}

impl RelocationQueue {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism,
            ..Self::default()
        }
    }

    pub fn enqueue(&mut self, relocation: RelocateShard) {
        tracing::debug!(
            range = %relocation.keys,
            priority = %relocation.priority,
            reason = ?relocation.reason,
            "relocation enqueued"
        );
        self.pending.push(Pending {
            relocation,
            seq: self.seq,
        });
        self.seq += 1;
    }

    /// Pops every relocation that may start now: parallelism below the cap
    /// and no in-flight move touching its range. Skipped candidates keep
    /// their place.
    pub fn launch_ready(&mut self) -> Vec<RelocateShard> {
        let mut launched = Vec::new();
        let mut skipped = Vec::new();
        while self.in_flight.len() + launched.len() < self.parallelism {
            let Some(candidate) = self.pending.pop() else {
                break;
            };
            let conflicts = self
                .in_flight
                .values()
                .chain(launched.iter())
                .any(|r: &RelocateShard| r.keys.intersects(&candidate.relocation.keys));
            if conflicts {
                skipped.push(candidate);
            } else {
                launched.push(candidate.relocation);
            }
        }
        for candidate in skipped {
            self.pending.push(candidate);
        }
        launched
    }

    /// Records a launched relocation under its move id.
    pub fn note_launched(&mut self, id: MoveId, relocation: RelocateShard) {
        self.in_flight.insert(id, relocation);
    }

    /// Removes a finished move, returning its relocation.
    pub fn complete(&mut self, id: MoveId) -> Option<RelocateShard> {
        self.in_flight.remove(&id)
    }

    /// Puts a failed move back on the queue for another attempt.
    pub fn retry(&mut self, id: MoveId) {
        if let Some(relocation) = self.in_flight.remove(&id) {
            tracing::debug!(range = %relocation.keys, "relocation requeued after failure");
            self.enqueue(relocation);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Pending relocations in launch order, for introspection and tests.
    pub fn pending_snapshot(&self) -> Vec<RelocateShard> {
        let mut pending: Vec<&Pending> = self.pending.iter().collect();
        pending.sort_by(|a, b| b.cmp(a));
        pending.iter().map(|p| p.relocation.clone()).collect()
    }
}
