// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The server-info ring: a lock-free snapshot of mesh membership, consulted
//! on every service-addressed send and swapped wholesale by the address
//! resolver.

use crate::{
    app::error::MeshError,
    wire::{ServerState, ServerType},
};
use arc_swap::ArcSwap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// One server's membership record, as service discovery reports it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// The role of the server.
    pub server_type: ServerType,
    /// Its service group within the role.
    pub service_id: u16,
    /// Mesh-unique identity.
    pub server_id: String,
    /// The mesh endpoint to connect to.
    pub address: String,
    /// Whether it takes traffic.
    pub state: ServerState,
    /// Weighted-selection weight.
    pub weight: i32,
}

/// How a peer is chosen within a `(server_type, service_id)` group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionPolicy {
    /// Next running peer in list order, per-group counter.
    RoundRobin,
    /// The running peer with the largest weight; ties break on server id.
    Weighted,
}

struct Group {
    running: Vec<ServerInfo>,
    members: usize,
    counter: AtomicUsize,
}

#[derive(Default)]
struct RingSnapshot {
    by_id: HashMap<String, ServerInfo>,
    groups: HashMap<(ServerType, u16), Group>,
}

/// The swap-on-update membership ring.
pub(crate) struct ServerRing {
    snapshot: ArcSwap<RingSnapshot>,
}

impl ServerRing {
    pub(crate) fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RingSnapshot::default()),
        }
    }

    /// Replace the membership snapshot. Round-robin counters carry over so a
    /// refresh does not restart rotation.
    pub(crate) fn update(&self, servers: &[ServerInfo]) {
        let old = self.snapshot.load();
        let mut next = RingSnapshot::default();
        for info in servers {
            next.by_id.insert(info.server_id.clone(), info.clone());
            let group = next
                .groups
                .entry((info.server_type, info.service_id))
                .or_insert_with(|| Group {
                    running: Vec::new(),
                    members: 0,
                    counter: AtomicUsize::new(0),
                });
            group.members += 1;
            if info.state == ServerState::Running {
                group.running.push(info.clone());
            }
        }
        for (key, group) in next.groups.iter_mut() {
            group.running.sort_by(|a, b| a.server_id.cmp(&b.server_id));
            let seed = match old.groups.get(key) {
                Some(prior) => prior.counter.load(Ordering::Relaxed),
                None => rand::thread_rng().gen_range(0..group.running.len().max(1)),
            };
            group.counter.store(seed, Ordering::Relaxed);
        }
        self.snapshot.store(Arc::new(next));
    }

    /// Pick a running peer from `(server_type, service_id)` by `policy`.
    pub(crate) fn select(
        &self,
        server_type: ServerType,
        service_id: u16,
        policy: SelectionPolicy,
    ) -> Result<ServerInfo, MeshError> {
        let snapshot = self.snapshot.load();
        let group = snapshot
            .groups
            .get(&(server_type, service_id))
            .ok_or(MeshError::NoCandidate(server_type, service_id))?;
        if group.running.is_empty() {
            if group.members > 0 {
                // Everything in the group is draining.
                let id = snapshot
                    .by_id
                    .values()
                    .find(|info| info.server_type == server_type && info.service_id == service_id)
                    .map(|info| info.server_id.clone())
                    .unwrap_or_default();
                return Err(MeshError::Disabled(id));
            }
            return Err(MeshError::NoCandidate(server_type, service_id));
        }
        let chosen = match policy {
            SelectionPolicy::RoundRobin => {
                let index = group.counter.fetch_add(1, Ordering::Relaxed) % group.running.len();
                &group.running[index]
            }
            SelectionPolicy::Weighted => group
                .running
                .iter()
                .max_by(|a, b| a.weight.cmp(&b.weight).then(b.server_id.cmp(&a.server_id)))
                .expect("non-empty running set"),
        };
        Ok(chosen.clone())
    }

    /// Look one server up by id.
    pub(crate) fn get(&self, server_id: &str) -> Option<ServerInfo> {
        self.snapshot.load().by_id.get(server_id).cloned()
    }

    /// The whole membership list.
    pub(crate) fn servers(&self) -> Vec<ServerInfo> {
        self.snapshot.load().by_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(server_id: &str, state: ServerState, weight: i32) -> ServerInfo {
        ServerInfo {
            server_type: ServerType::Api,
            service_id: 1,
            server_id: server_id.to_string(),
            address: format!("tcp://127.0.0.1:1{}", server_id.len()),
            state,
            weight,
        }
    }

    #[test]
    fn round_robin_alternates_over_running_peers() {
        let ring = ServerRing::new();
        ring.update(&[
            api("b", ServerState::Running, 0),
            api("c", ServerState::Running, 0),
        ]);
        let first = ring.select(ServerType::Api, 1, SelectionPolicy::RoundRobin).unwrap();
        let second = ring.select(ServerType::Api, 1, SelectionPolicy::RoundRobin).unwrap();
        let third = ring.select(ServerType::Api, 1, SelectionPolicy::RoundRobin).unwrap();
        assert_ne!(first.server_id, second.server_id);
        assert_eq!(first.server_id, third.server_id);
    }

    #[test]
    fn disabled_peers_drop_out_of_rotation() {
        let ring = ServerRing::new();
        ring.update(&[
            api("b", ServerState::Disabled, 0),
            api("c", ServerState::Running, 0),
        ]);
        for _ in 0..4 {
            let chosen = ring.select(ServerType::Api, 1, SelectionPolicy::RoundRobin).unwrap();
            assert_eq!(chosen.server_id, "c");
        }
    }

    #[test]
    fn all_disabled_is_an_error() {
        let ring = ServerRing::new();
        ring.update(&[api("b", ServerState::Disabled, 0)]);
        assert!(matches!(
            ring.select(ServerType::Api, 1, SelectionPolicy::RoundRobin),
            Err(MeshError::Disabled(_))
        ));
        assert!(matches!(
            ring.select(ServerType::Play, 1, SelectionPolicy::RoundRobin),
            Err(MeshError::NoCandidate(_, _))
        ));
    }

    #[test]
    fn weighted_takes_the_heaviest_with_id_tie_break() {
        let ring = ServerRing::new();
        ring.update(&[
            api("b", ServerState::Running, 5),
            api("c", ServerState::Running, 9),
            api("d", ServerState::Running, 9),
        ]);
        let chosen = ring.select(ServerType::Api, 1, SelectionPolicy::Weighted).unwrap();
        assert_eq!(chosen.server_id, "c");
    }
}
