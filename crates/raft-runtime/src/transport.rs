//! # transport
//!
//! why: the node talks to peers through one async seam so the network is swappable
//! relations: implemented by network.rs LocalNetwork; called from node.rs fan-out tasks
//! what: Transport trait

use async_trait::async_trait;
use raft_core::{AppendEntriesRequest, AppendEntriesResponse, Peer, VoteRequest, VoteResponse};

use crate::error::TransportError;

/// Outbound RPCs to one peer. Implementations must be safe to call concurrently.
///
/// a call may be lost, delayed, duplicated or reordered; the node tolerates all
/// of it and applies its own timeout on top.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, target: &Peer, req: VoteRequest) -> Result<VoteResponse, TransportError>;

    async fn append_entries(
        &self,
        target: &Peer,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}
