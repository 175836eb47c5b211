//! # network
//!
//! why: run whole clusters in one process with controllable faults
//! relations: implements transport.rs over registered RaftHandles from node.rs
//! what: LocalNetwork (router + fault injection), LocalTransport (one node's view)
//!
//! every message is encoded to wire bytes and decoded again on delivery, so
//! nothing but serialized state crosses between nodes.

use async_trait::async_trait;
use rand::Rng;
use raft_core::{AppendEntriesRequest, AppendEntriesResponse, Peer, RaftError, RaftMessage, VoteRequest, VoteResponse};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

use crate::error::TransportError;
use crate::node::RaftHandle;
use crate::transport::Transport;

#[derive(Default)]
struct Fabric {
    nodes: HashMap<u64, RaftHandle>,
    isolated: HashSet<u64>,
    /// when set, only nodes in the same group can talk
    groups: Option<Vec<HashSet<u64>>>,
    drop_rate: f64,
    duplicate: bool,
}

impl Fabric {
    fn connected(&self, from: u64, to: u64) -> bool {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return false;
        }
        match &self.groups {
            Some(groups) => groups.iter().any(|g| g.contains(&from) && g.contains(&to)),
            None => true,
        }
    }
}

/// In-process message router shared by every node of a test cluster
#[derive(Clone, Default)]
pub struct LocalNetwork {
    fabric: Arc<RwLock<Fabric>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Fabric> {
        self.fabric.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Fabric> {
        self.fabric.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The transport node `id` sends through
    pub fn transport(&self, id: u64) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            from: id,
            network: self.clone(),
        })
    }

    /// Make a node reachable; replaces an earlier handle with the same id
    pub fn register(&self, handle: RaftHandle) {
        self.write().nodes.insert(handle.id(), handle);
    }

    pub fn unregister(&self, id: u64) -> Option<RaftHandle> {
        self.write().nodes.remove(&id)
    }

    /// Cut every link to and from `id`
    pub fn isolate(&self, id: u64) {
        self.write().isolated.insert(id);
    }

    pub fn heal(&self, id: u64) {
        self.write().isolated.remove(&id);
    }

    /// Split the cluster; nodes missing from every group are cut off entirely
    pub fn partition(&self, groups: &[&[u64]]) {
        self.write().groups = Some(groups.iter().map(|g| g.iter().copied().collect()).collect());
    }

    /// Remove every fault
    pub fn heal_all(&self) {
        let mut fabric = self.write();
        fabric.isolated.clear();
        fabric.groups = None;
        fabric.drop_rate = 0.0;
        fabric.duplicate = false;
    }

    /// Probability in [0, 1] that any single message is lost
    pub fn set_drop_rate(&self, rate: f64) {
        self.write().drop_rate = rate.clamp(0.0, 1.0);
    }

    /// Deliver every request twice
    pub fn set_duplicate(&self, duplicate: bool) {
        self.write().duplicate = duplicate;
    }

    /// Route one hop, applying partitions and random loss
    fn route(&self, from: u64, to: u64) -> Result<(RaftHandle, bool), TransportError> {
        let fabric = self.read();
        if !fabric.connected(from, to) {
            return Err(TransportError::Unreachable { peer: to });
        }
        let handle = fabric
            .nodes
            .get(&to)
            .cloned()
            .ok_or(TransportError::Unreachable { peer: to })?;
        if fabric.drop_rate > 0.0 && rand::thread_rng().gen_bool(fabric.drop_rate) {
            trace!(from, to, "dropping message");
            return Err(TransportError::Dropped { peer: to });
        }
        Ok((handle, fabric.duplicate))
    }

    /// The reply travels back over the same, possibly changed, network
    fn route_back(&self, from: u64, to: u64) -> Result<(), TransportError> {
        let fabric = self.read();
        if !fabric.connected(to, from) {
            return Err(TransportError::Dropped { peer: to });
        }
        if fabric.drop_rate > 0.0 && rand::thread_rng().gen_bool(fabric.drop_rate) {
            return Err(TransportError::Dropped { peer: to });
        }
        Ok(())
    }
}

/// One node's outbound side of a LocalNetwork
pub struct LocalTransport {
    from: u64,
    network: LocalNetwork,
}

fn over_the_wire(msg: RaftMessage) -> Result<RaftMessage, TransportError> {
    let bytes = msg.to_bytes().map_err(|e| TransportError::Codec(e.to_string()))?;
    RaftMessage::from_bytes(&bytes).map_err(|e| TransportError::Codec(e.to_string()))
}

fn remote(peer: u64, err: RaftError) -> TransportError {
    match err {
        RaftError::Shutdown => TransportError::Unreachable { peer },
        other => TransportError::Remote {
            peer,
            reason: other.to_string(),
        },
    }
}

fn unexpected(peer: u64) -> TransportError {
    TransportError::Codec(format!("unexpected message type from peer {peer}"))
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(&self, target: &Peer, req: VoteRequest) -> Result<VoteResponse, TransportError> {
        let (handle, duplicate) = self.network.route(self.from, target.id)?;
        let RaftMessage::VoteRequest(req) = over_the_wire(req.into())? else {
            return Err(unexpected(target.id));
        };
        if duplicate {
            let _ = handle.request_vote(req.clone()).await;
        }
        let resp = handle.request_vote(req).await.map_err(|e| remote(target.id, e))?;
        self.network.route_back(self.from, target.id)?;
        match over_the_wire(resp.into())? {
            RaftMessage::VoteResponse(resp) => Ok(resp),
            _ => Err(unexpected(target.id)),
        }
    }

    async fn append_entries(
        &self,
        target: &Peer,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let (handle, duplicate) = self.network.route(self.from, target.id)?;
        let RaftMessage::AppendEntries(req) = over_the_wire(req.into())? else {
            return Err(unexpected(target.id));
        };
        if duplicate {
            let _ = handle.append_entries(req.clone()).await;
        }
        let resp = handle.append_entries(req).await.map_err(|e| remote(target.id, e))?;
        self.network.route_back(self.from, target.id)?;
        match over_the_wire(resp.into())? {
            RaftMessage::AppendEntriesResponse(resp) => Ok(resp),
            _ => Err(unexpected(target.id)),
        }
    }
}
