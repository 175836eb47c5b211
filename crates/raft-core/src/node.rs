//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, peer.rs for membership
//! what: NodeState enum, RaftConfig, RaftNode struct, role transitions, quorum math
//!
//! the behaviour is split across impl blocks: election.rs (votes), replication.rs
//! (leader side), rpc.rs (inbound dispatch), applier.rs (state machine feed).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::log::{LogEntry, RaftLog};
use crate::peer::PeerRegistry;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// Timing and batching knobs, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// leader heartbeat period, well below the election timeout
    pub heartbeat_interval: u64,
    /// cap on entries carried by one AppendEntries
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_append: 64,
        }
    }
}

/// State that must be durable before any reply depending on it is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<u64>,
}

/// Leader-local replication bookkeeping for one follower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// next log index to send
    pub next_index: u64,
    /// highest index known to be replicated
    pub match_index: u64,
}

impl Progress {
    pub fn new(next_index: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
        }
    }
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: u64,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<u64>,
    /// Replicated log
    pub log: RaftLog,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the state machine
    pub last_applied: u64,
    /// Best-known leader for the current term
    pub leader_id: Option<u64>,
    /// Other cluster members
    pub peers: PeerRegistry,
    /// Votes granted to us in the current election (includes self)
    pub votes_received: BTreeSet<u64>,
    /// Per-follower progress; only populated while leader
    pub progress: BTreeMap<u64, Progress>,
    pub config: RaftConfig,
}

impl RaftNode {
    /// Create a new Raft node in Follower state. `cluster_nodes` may include `id`.
    pub fn new(id: u64, cluster_nodes: Vec<u64>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig) -> Self {
        Self::with_peers(id, PeerRegistry::from_ids(id, &cluster_nodes), config)
    }

    pub fn with_peers(id: u64, peers: PeerRegistry, config: RaftConfig) -> Self {
        Self::restore(id, peers, config, HardState::default(), Vec::new())
    }

    /// Rebuild a node from persisted term, vote and log after a restart
    pub fn restore(
        id: u64,
        peers: PeerRegistry,
        config: RaftConfig,
        hard_state: HardState,
        entries: Vec<LogEntry>,
    ) -> Self {
        Self {
            id,
            state: NodeState::Follower,
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            log: RaftLog::from_entries(entries),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            peers,
            votes_received: BTreeSet::new(),
            progress: BTreeMap::new(),
            config,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    // -- quorum --

    /// floor(N/2)+1 over the current membership
    pub fn quorum_size(&self) -> usize {
        self.peers.quorum_size()
    }

    /// Whether the votes received from current members form a majority
    pub fn has_quorum(&self) -> bool {
        let votes = self
            .votes_received
            .iter()
            .filter(|id| self.peers.is_member(**id))
            .count();
        votes >= self.quorum_size()
    }

    // -- role transitions --

    /// Revert to follower, adopting `term` if it is newer
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        if self.state != NodeState::Follower {
            info!(node_id = self.id, term = self.current_term, from = %self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.progress.clear();
    }

    /// Take leadership for the current term.
    ///
    /// appends a no-op in the new term: earlier-term entries only commit
    /// once an entry of the leader's own term does, and the no-op is that entry.
    pub fn become_leader(&mut self) {
        let next_index = self.log.last_index() + 1;
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        self.progress = self
            .peers
            .ids()
            .map(|peer| (peer, Progress::new(next_index)))
            .collect();
        self.log.push(LogEntry::noop(self.current_term, next_index).stamped());
        // a lone leader is its own majority
        self.advance_commit_index();
        info!(
            node_id = self.id,
            term = self.current_term,
            last_log_index = self.log.last_index(),
            "became leader"
        );
    }

    // -- membership --

    /// Register a peer; a leader starts tracking its progress immediately
    pub fn add_peer(&mut self, id: u64, endpoint: impl Into<String>) {
        if self.peers.add_peer(id, endpoint) && self.is_leader() {
            self.progress
                .insert(id, Progress::new(self.log.last_index() + 1));
        }
    }

    /// Forget a peer. Quorum shrinks, so a leader may commit and a candidate may win.
    pub fn remove_peer(&mut self, id: u64) {
        if self.peers.remove_peer(id).is_none() {
            return;
        }
        self.progress.remove(&id);
        self.votes_received.remove(&id);
        match self.state {
            NodeState::Leader => {
                self.advance_commit_index();
            }
            NodeState::Candidate if self.has_quorum() => self.become_leader(),
            _ => {}
        }
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.entry(index)
    }

    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index)
    }

    pub fn next_index(&self, peer: u64) -> Option<u64> {
        self.progress.get(&peer).map(|p| p.next_index)
    }

    pub fn match_index(&self, peer: u64) -> Option<u64> {
        self.progress.get(&peer).map(|p| p.match_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_starts_as_follower() {
        let node = RaftNode::new(1, vec![1, 2, 3]);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn restore_keeps_term_vote_and_log() {
        let node = RaftNode::restore(
            2,
            PeerRegistry::from_ids(2, &[1, 3]),
            RaftConfig::default(),
            HardState { term: 7, voted_for: Some(3) },
            vec![LogEntry::new(6, 1, vec![1]), LogEntry::new(7, 2, vec![2])],
        );
        assert_eq!(node.current_term, 7);
        assert_eq!(node.voted_for, Some(3));
        assert_eq!(node.last_log_index(), 2);
        assert_eq!(node.commit_index, 0);
        assert!(!node.log.has_unstable());
    }

    #[test]
    fn become_leader_appends_noop_in_its_term() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.push(LogEntry::new(1, 1, vec![1]));
        node.current_term = 2;

        node.become_leader();

        let noop = node.get_entry(2).unwrap();
        assert!(noop.is_noop());
        assert_eq!(noop.term, 2);
        assert_eq!(node.next_index(2), Some(2));
        assert_eq!(node.commit_index, 0);
    }

    #[test]
    fn become_follower_never_lowers_term() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.current_term = 4;
        node.voted_for = Some(2);
        node.become_follower(3);
        assert_eq!(node.current_term, 4);
        assert_eq!(node.voted_for, Some(2));
    }
}
