//! # peer
//!
//! why: track the set of other nodes this node elects and replicates with
//! relations: mutated through RaftNode::add_peer/remove_peer, read by election and replication
//! what: Peer, PeerRegistry, quorum arithmetic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A known remote node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    /// Network address, opaque to the core
    pub endpoint: String,
    /// Last observed reachability; informational only
    pub healthy: bool,
}

impl Peer {
    pub fn new(id: u64, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            healthy: true,
        }
    }
}

/// Peers of one node, keyed by id. Never contains the owning node itself.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    self_id: u64,
    peers: BTreeMap<u64, Peer>,
}

impl PeerRegistry {
    pub fn new(self_id: u64) -> Self {
        Self {
            self_id,
            peers: BTreeMap::new(),
        }
    }

    /// Registry from cluster member ids; endpoints default to the id
    pub fn from_ids(self_id: u64, cluster_nodes: &[u64]) -> Self {
        let mut registry = Self::new(self_id);
        for id in cluster_nodes {
            registry.add_peer(*id, id.to_string());
        }
        registry
    }

    /// Add or update a peer. Returns true if it was not known before.
    pub fn add_peer(&mut self, id: u64, endpoint: impl Into<String>) -> bool {
        if id == self.self_id {
            return false;
        }
        let endpoint = endpoint.into();
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.endpoint = endpoint;
                false
            }
            None => {
                self.peers.insert(id, Peer::new(id, endpoint));
                true
            }
        }
    }

    pub fn remove_peer(&mut self, id: u64) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub fn mark_healthy(&mut self, id: u64, healthy: bool) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.healthy = healthy;
        }
    }

    pub fn get(&self, id: u64) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.peers.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Voting members including self
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// floor(N/2)+1 of the current membership
    pub fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Whether `id` is self or a registered peer
    pub fn is_member(&self, id: u64) -> bool {
        id == self.self_id || self.peers.contains_key(&id)
    }
}
