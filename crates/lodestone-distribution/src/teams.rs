//! Replication teams.
//!
//! A team is a set of storage servers, one per failure zone, sized to the
//! replication factor. The collection forms teams per region, tracks server
//! health and exclusion, and answers destination queries for relocations.

use std::collections::{HashMap, HashSet};

use lodestone_types::{ServerId, StorageServerMeta, Team};

use crate::{DistributionError, Result};

/// Per-server tracking state.
#[derive(Debug, Clone)]
struct ServerState {
    meta: StorageServerMeta,
    healthy: bool,
    excluded: bool,
}

impl ServerState {
    fn usable(&self) -> bool {
        self.healthy && !self.excluded
    }
}

/// The team collection of one region.
#[derive(Debug)]
pub struct TeamCollection {
    /// Data-center id this collection covers; `None` for locality-blind
    /// single-region deployments.
    dc: Option<String>,
    replication_factor: usize,
    servers: HashMap<ServerId, ServerState>,
    teams: Vec<Team>,
    /// Shards assigned per team, used to prefer emptier destinations.
    load: HashMap<Team, usize>,
}

impl TeamCollection {
    pub fn new(dc: Option<String>, replication_factor: usize) -> Self {
        Self {
            dc,
            replication_factor,
            servers: HashMap::new(),
            teams: Vec::new(),
            load: HashMap::new(),
        }
    }

    pub fn dc(&self) -> Option<&str> {
        self.dc.as_deref()
    }

    /// Registers a server if it belongs to this region.
    pub fn register_server(&mut self, meta: StorageServerMeta) {
        if let Some(dc) = &self.dc {
            if meta.locality.dc != *dc {
                return;
            }
        }
        self.servers.insert(
            meta.id,
            ServerState {
                meta,
                healthy: true,
                excluded: false,
            },
        );
    }

    /// Marks a server failed; teams containing it stop being destinations.
    pub fn report_server_failure(&mut self, id: ServerId) {
        if let Some(state) = self.servers.get_mut(&id) {
            state.healthy = false;
            tracing::warn!(server = %id, "storage server marked failed");
        }
    }

    /// Marks a server administratively excluded.
    pub fn mark_excluded(&mut self, id: ServerId) {
        if let Some(state) = self.servers.get_mut(&id) {
            state.excluded = true;
        }
    }

    pub fn server(&self, id: ServerId) -> Option<&StorageServerMeta> {
        self.servers.get(&id).map(|s| &s.meta)
    }

    pub fn servers(&self) -> Vec<StorageServerMeta> {
        self.servers.values().map(|s| s.meta.clone()).collect()
    }

    /// Greedily forms zone-diverse teams from usable servers until every
    /// usable server is on at least one team.
    ///
    /// Formation is deterministic given registration state: servers are
    /// considered in id order, zones round-robin.
    pub fn build_teams(&mut self) {
        let mut by_zone: HashMap<&str, Vec<&ServerState>> = HashMap::new();
        for state in self.servers.values().filter(|s| s.usable()) {
            by_zone.entry(state.meta.locality.zone.as_str()).or_default().push(state);
        }
        for members in by_zone.values_mut() {
            members.sort_by_key(|s| s.meta.id);
        }
        let mut zones: Vec<&str> = by_zone.keys().copied().collect();
        zones.sort_unstable();
        if zones.len() < self.replication_factor {
            tracing::warn!(
                zones = zones.len(),
                needed = self.replication_factor,
                "not enough failure zones to form a team"
            );
            return;
        }

        let mut teams = Vec::new();
        let mut cursor: HashMap<&str, usize> = HashMap::new();
        let rounds = by_zone.values().map(Vec::len).max().unwrap_or(0);
        for _ in 0..rounds {
            for window in 0..zones.len() {
                let picked_zones: Vec<&str> = (0..self.replication_factor)
                    .map(|i| zones[(window + i) % zones.len()])
                    .collect();
                if picked_zones.iter().collect::<HashSet<_>>().len() < self.replication_factor {
                    continue;
                }
                let mut members = Vec::with_capacity(self.replication_factor);
                for zone in &picked_zones {
                    let servers = &by_zone[zone];
                    let at = cursor.entry(*zone).or_insert(0);
                    members.push(servers[*at % servers.len()].meta.id);
                    *at += 1;
                }
                let team = Team::new(members);
                if team.len() == self.replication_factor && !teams.contains(&team) {
                    teams.push(team);
                }
            }
            if self.all_servers_covered(&teams) {
                break;
            }
        }
        self.teams = teams;
    }

    fn all_servers_covered(&self, teams: &[Team]) -> bool {
        self.servers
            .values()
            .filter(|s| s.usable())
            .all(|s| teams.iter().any(|t| t.contains(s.meta.id)))
    }

    /// Teams whose members are all usable.
    pub fn healthy_teams(&self) -> Vec<&Team> {
        self.teams
            .iter()
            .filter(|t| t.servers().iter().all(|id| {
                self.servers.get(id).is_some_and(ServerState::usable)
            }))
            .collect()
    }

    /// Picks a destination team avoiding every server in `avoid`,
    /// preferring the least-loaded candidate.
    pub fn pick_destination(&self, avoid: &[ServerId]) -> Result<Team> {
        self.healthy_teams()
            .into_iter()
            .filter(|t| !t.overlaps(avoid))
            .min_by_key(|t| self.load.get(*t).copied().unwrap_or(0))
            .cloned()
            .ok_or(DistributionError::DestTeamNotFound)
    }

    /// Records that a shard landed on `team`.
    pub fn note_assignment(&mut self, team: &Team) {
        *self.load.entry(team.clone()).or_insert(0) += 1;
    }

    /// Records that a shard left `team`.
    pub fn note_removal(&mut self, team: &Team) {
        if let Some(load) = self.load.get_mut(team) {
            *load = load.saturating_sub(1);
        }
    }

    /// Healthy teams with their current shard load, least-loaded first.
    pub fn team_loads(&self) -> Vec<(Team, usize)> {
        let mut loads: Vec<(Team, usize)> = self
            .healthy_teams()
            .into_iter()
            .map(|t| (t.clone(), self.load.get(t).copied().unwrap_or(0)))
            .collect();
        loads.sort_by_key(|(_, load)| *load);
        loads
    }

    /// Healthy teams remaining if `removed` servers all disappeared.
    pub fn healthy_teams_excluding(&self, removed: &[ServerId]) -> usize {
        self.healthy_teams()
            .into_iter()
            .filter(|t| !t.overlaps(removed))
            .count()
    }

    /// Safe iff at least two healthy teams survive the exclusion.
    pub fn exclusion_is_safe(&self, removed: &[ServerId]) -> bool {
        self.healthy_teams_excluding(removed) >= 2
    }

    pub fn team_count(&self) -> usize {
        self.teams.len()
    }
}
