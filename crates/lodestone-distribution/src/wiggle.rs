//! The storage wiggler.
//!
//! Rolls storage servers through replacement one at a time, for rolling
//! engine migrations and hardware refresh. Candidates are ordered
//! wrong-configured first, then oldest first, so a server running the
//! wrong engine is replaced before a merely old one. Servers younger than
//! the minimum age are held back unless they are wrong-configured.

use std::collections::BTreeSet;

use lodestone_types::{ServerId, StorageServerMeta};
use serde::{Deserialize, Serialize};

/// Ordering key: wrong-configured servers first, then by ascending creation
/// time, ties broken by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WiggleOrder {
    correctly_configured: bool,
    created_at: u64,
    id: ServerId,
}

/// Externally visible wiggler state for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WigglerState {
    /// The server currently being wiggled, if any.
    pub wiggling: Option<ServerId>,
    /// Servers waiting their turn.
    pub queued: usize,
    /// Unix seconds of the last state change.
    pub last_change: u64,
}

/// Per-region rolling-replacement scheduler.
#[derive(Debug, Default)]
pub struct StorageWiggler {
    queue: BTreeSet<WiggleOrder>,
    wiggling: Option<ServerId>,
    min_age_sec: u64,
    last_change: u64,
}

impl StorageWiggler {
    pub fn new(min_age_sec: u64) -> Self {
        Self {
            min_age_sec,
            ..Self::default()
        }
    }

    /// Adds a server to the wiggle queue.
    pub fn add_server(&mut self, meta: &StorageServerMeta, now: u64) {
        self.queue.insert(WiggleOrder {
            correctly_configured: !meta.wrong_configured,
            created_at: meta.created_at,
            id: meta.id,
        });
        self.last_change = now;
    }

    /// Drops a server (left the cluster or finished wiggling).
    pub fn remove_server(&mut self, id: ServerId, now: u64) {
        self.queue.retain(|o| o.id != id);
        if self.wiggling == Some(id) {
            self.wiggling = None;
        }
        self.last_change = now;
    }

    /// Takes the next server to wiggle: wrong-configured oldest first, then
    /// correctly-configured oldest.
    ///
    /// With `necessary_only`, a correctly-configured server younger than
    /// the minimum age is never returned; wrong-configured servers bypass
    /// the age gate.
    pub fn next_server_id(&mut self, now: u64, necessary_only: bool) -> Option<ServerId> {
        let picked = self.queue.iter().find(|order| {
            if !necessary_only || !order.correctly_configured {
                return true;
            }
            now.saturating_sub(order.created_at) >= self.min_age_sec
        }).copied()?;
        self.queue.remove(&picked);
        self.wiggling = Some(picked.id);
        self.last_change = now;
        Some(picked.id)
    }

    /// Marks the in-flight wiggle finished.
    pub fn finish_wiggle(&mut self, now: u64) {
        self.wiggling = None;
        self.last_change = now;
    }

    pub fn state(&self) -> WigglerState {
        WigglerState {
            wiggling: self.wiggling,
            queued: self.queue.len(),
            last_change: self.last_change,
        }
    }
}
