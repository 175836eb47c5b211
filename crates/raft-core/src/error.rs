//! # error
//!
//! why: one typed error taxonomy for every failure the consensus core can surface
//! relations: returned by node.rs handlers and propose, wrapped by raft-runtime
//! what: RaftError, Result alias

use thiserror::Error;

/// Errors produced by the consensus core and surfaced to callers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// This node is not the leader; retry against the hinted node
    #[error("not the leader, leader hint is {leader_hint:?}")]
    NotLeader { leader_hint: Option<u64> },

    /// A message carried a term older than ours
    #[error("stale term {received}, current term is {current}")]
    StaleTerm { received: u64, current: u64 },

    /// AppendEntries prev-log check failed
    #[error("log mismatch at index {index}")]
    LogMismatch { index: u64 },

    /// A proposal could not reach a majority in time; retryable
    #[error("quorum unavailable, entry {index} not committed in time")]
    QuorumUnavailable { index: u64 },

    /// Durable write of term, vote or log failed; the node has halted
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The node's event loop is gone
    #[error("node is shut down")]
    Shutdown,
}

impl RaftError {
    /// Whether a caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. } | RaftError::QuorumUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
