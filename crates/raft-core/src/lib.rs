//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime's per-node actor, persisted via raft-storage
//! what: state machine, election logic, replication, rpc handling, log management, message types
//!
//! nothing in this crate performs i/o or reads a clock besides stamping new
//! entries; callers own timers, transport and durability.

pub mod applier;
pub mod election;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod peer;
pub mod replication;
pub mod rpc;

pub use applier::StateMachine;
pub use error::{RaftError, Result};
pub use log::{EntryKind, LogEntry, RaftLog};
pub use message::{AppendEntriesRequest, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse};
pub use node::{HardState, NodeState, Progress, RaftConfig, RaftNode};
pub use peer::{Peer, PeerRegistry};
