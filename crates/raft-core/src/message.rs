//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: used by node.rs for state transitions, serialized for network
//! what: VoteRequest/VoteResponse, AppendEntries request/response, RaftMessage envelope

use serde::{Deserialize, Serialize};

use crate::LogEntry;

/// RequestVote arguments, sent by a candidate to every peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Reply to a vote request; always carries the voter's current term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reply to AppendEntries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// on success: the highest index known to match the leader's log
    pub match_index: u64,
    /// on mismatch: where the leader should retry from (0 when not applicable)
    pub conflict_index: u64,
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest(VoteRequest),
    /// Response to a vote request
    VoteResponse(VoteResponse),
    /// Replicate log entries / heartbeat
    AppendEntries(AppendEntriesRequest),
    /// Response to AppendEntries
    AppendEntriesResponse(AppendEntriesResponse),
}

impl RaftMessage {
    /// Term carried by the message
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::VoteRequest(m) => m.term,
            RaftMessage::VoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
        }
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<VoteRequest> for RaftMessage {
    fn from(m: VoteRequest) -> Self {
        RaftMessage::VoteRequest(m)
    }
}

impl From<VoteResponse> for RaftMessage {
    fn from(m: VoteResponse) -> Self {
        RaftMessage::VoteResponse(m)
    }
}

impl From<AppendEntriesRequest> for RaftMessage {
    fn from(m: AppendEntriesRequest) -> Self {
        RaftMessage::AppendEntries(m)
    }
}

impl From<AppendEntriesResponse> for RaftMessage {
    fn from(m: AppendEntriesResponse) -> Self {
        RaftMessage::AppendEntriesResponse(m)
    }
}
