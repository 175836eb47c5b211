//! # node
//!
//! why: run one raft node as a single-writer task so protocol state never needs a lock
//! relations: owns a raft_core::RaftNode, a raft_storage::Storage and a StateMachine; reaches peers via transport.rs
//! what: spawn_node, RaftHandle, NodeStatus, the actor loop (timers, fan-out, persistence, apply, proposals)
//!
//! every core mutation is flushed to storage before any reply or outbound rpc
//! that depends on it. a failed flush halts the node for good.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;

use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, HardState, NodeState, RaftError, RaftNode, Result, StateMachine,
    VoteRequest, VoteResponse,
};
use raft_storage::Storage;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::error::{StartError, TransportError};
use crate::timer::random_election_timeout;
use crate::transport::Transport;

const REQUEST_QUEUE: usize = 256;

/// Point-in-time view of a node, republished whenever it changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: u64,
    pub state: NodeState,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub peers: Vec<u64>,
    /// set after a persistence failure; the node no longer votes or leads
    pub halted: bool,
}

impl NodeStatus {
    fn of(node: &RaftNode, halted: bool) -> Self {
        Self {
            id: node.id,
            state: node.state,
            term: node.current_term,
            leader_id: node.leader_id,
            commit_index: node.commit_index,
            last_applied: node.last_applied,
            last_log_index: node.last_log_index(),
            peers: node.peers.ids().collect(),
            halted,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader && !self.halted
    }
}

// -- actor messages --

enum Request {
    Propose {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<u64>>,
    },
    RequestVote {
        req: VoteRequest,
        reply: oneshot::Sender<Result<VoteResponse>>,
    },
    AppendEntries {
        req: AppendEntriesRequest,
        reply: oneshot::Sender<Result<AppendEntriesResponse>>,
    },
    AddPeer {
        id: u64,
        endpoint: String,
    },
    RemovePeer {
        id: u64,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// A finished outbound rpc, tagged with the term it was sent in
enum RpcOutcome {
    Vote {
        peer: u64,
        term: u64,
        result: std::result::Result<VoteResponse, TransportError>,
    },
    Append {
        peer: u64,
        term: u64,
        result: std::result::Result<AppendEntriesResponse, TransportError>,
    },
}

// -- handle --

/// Cloneable client of one running node
#[derive(Clone)]
pub struct RaftHandle {
    id: u64,
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<NodeStatus>,
}

impl RaftHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Append a command and wait until it is committed. Returns its log index.
    ///
    /// fails with NotLeader on a follower or if leadership is lost first, and
    /// with QuorumUnavailable when no majority acknowledges it in time.
    pub async fn propose(&self, command: impl Into<Vec<u8>>) -> Result<u64> {
        let command = command.into();
        self.call(move |reply| Request::Propose { command, reply }).await
    }

    /// Inbound RequestVote rpc
    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.call(move |reply| Request::RequestVote { req, reply }).await
    }

    /// Inbound AppendEntries rpc
    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.call(move |reply| Request::AppendEntries { req, reply }).await
    }

    pub async fn add_peer(&self, id: u64, endpoint: impl Into<String>) -> Result<()> {
        let endpoint = endpoint.into();
        self.send(Request::AddPeer { id, endpoint }).await
    }

    pub async fn remove_peer(&self, id: u64) -> Result<()> {
        self.send(Request::RemovePeer { id }).await
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// Watch every status change
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Stop the node and wait for its loop to exit. Idempotent.
    pub async fn shutdown(&self) {
        let (done, stopped) = oneshot::channel();
        if self.requests.send(Request::Shutdown { done }).await.is_ok() {
            let _ = stopped.await;
        }
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.requests.send(request).await.map_err(|_| RaftError::Shutdown)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Request) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply)).await?;
        response.await.map_err(|_| RaftError::Shutdown)?
    }
}

// -- spawn --

/// Load persisted state and start the node's event loop on the current tokio runtime.
pub fn spawn_node<S, M>(
    config: NodeConfig,
    storage: S,
    transport: Arc<dyn Transport>,
    state_machine: M,
) -> std::result::Result<RaftHandle, StartError>
where
    S: Storage + Send + 'static,
    M: StateMachine + Send + 'static,
{
    config.validate()?;
    let (term, voted_for) = storage.load_term_and_vote()?;
    let entries = storage.load_log()?;
    let persisted = HardState { term, voted_for };
    let persisted_last_index = entries.last().map_or(0, |e| e.index);

    let node = RaftNode::restore(
        config.node_id,
        config.peer_registry(),
        config.raft.clone(),
        persisted,
        entries,
    );
    info!(
        node_id = node.id,
        term,
        voted_for = ?voted_for,
        last_log_index = persisted_last_index,
        peers = ?node.peers.ids().collect::<Vec<_>>(),
        "starting node"
    );

    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(NodeStatus::of(&node, false));

    let actor = NodeActor {
        election_deadline: Instant::now(),
        node,
        storage,
        transport,
        state_machine: Box::new(state_machine),
        outcomes: outcome_tx,
        status: status_tx,
        persisted,
        persisted_last_index,
        in_flight: HashMap::new(),
        pending: BTreeMap::new(),
        led_term: None,
        halted: None,
        config,
    };
    let handle = RaftHandle {
        id: actor.node.id,
        requests: request_tx,
        status: status_rx,
    };
    tokio::spawn(actor.run(request_rx, outcome_rx));
    Ok(handle)
}

// -- actor --

struct PendingProposal {
    term: u64,
    deadline: Instant,
    reply: oneshot::Sender<Result<u64>>,
}

struct NodeActor<S> {
    node: RaftNode,
    storage: S,
    transport: Arc<dyn Transport>,
    state_machine: Box<dyn StateMachine + Send>,
    config: NodeConfig,
    outcomes: mpsc::UnboundedSender<RpcOutcome>,
    status: watch::Sender<NodeStatus>,
    /// term and vote as last written to storage
    persisted: HardState,
    persisted_last_index: u64,
    /// peer -> term of its outstanding AppendEntries; at most one per peer
    in_flight: HashMap<u64, u64>,
    /// proposals waiting on commit, by log index
    pending: BTreeMap<u64, PendingProposal>,
    election_deadline: Instant,
    /// term we last started acting as leader in
    led_term: Option<u64>,
    /// reason for halting, once storage has failed
    halted: Option<String>,
}

impl<S: Storage + Send + 'static> NodeActor<S> {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut outcomes: mpsc::UnboundedReceiver<RpcOutcome>,
    ) {
        let mut heartbeat = time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reset_election_timer();

        loop {
            let running = self.halted.is_none();
            let leading = self.node.is_leader();

            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown { done }) => {
                        self.stop();
                        let _ = done.send(());
                        return;
                    }
                    Some(request) => self.on_request(request),
                    None => {
                        self.stop();
                        return;
                    }
                },
                Some(outcome) = outcomes.recv() => self.on_outcome(outcome),
                _ = time::sleep_until(self.election_deadline), if running && !leading => {
                    self.on_election_timeout();
                }
                _ = heartbeat.tick(), if running && leading => self.broadcast_append(),
            }

            self.after_event();
        }
    }

    // -- inbound --

    fn on_request(&mut self, request: Request) {
        match request {
            Request::Propose { command, reply } => self.on_propose(command, reply),
            Request::RequestVote { req, reply } => {
                let _ = reply.send(self.answer_vote(&req));
            }
            Request::AppendEntries { req, reply } => {
                let _ = reply.send(self.answer_append(&req));
            }
            Request::AddPeer { id, endpoint } => {
                info!(node_id = self.node.id, peer = id, endpoint = %endpoint, "adding peer");
                self.node.add_peer(id, endpoint);
                if self.halted.is_none() && self.node.is_leader() {
                    self.send_append(id);
                }
            }
            Request::RemovePeer { id } => {
                info!(node_id = self.node.id, peer = id, "removing peer");
                self.node.remove_peer(id);
                self.in_flight.remove(&id);
                if self.halted.is_none() {
                    let _ = self.persist();
                }
            }
            Request::Shutdown { .. } => unreachable!("handled by the event loop"),
        }
    }

    fn on_propose(&mut self, command: Vec<u8>, reply: oneshot::Sender<Result<u64>>) {
        let index = match self.check_running().and_then(|_| self.node.propose(command)) {
            Ok(index) => index,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if let Err(err) = self.persist() {
            let _ = reply.send(Err(err));
            return;
        }
        debug!(node_id = self.node.id, index, "proposal appended");
        self.pending.insert(
            index,
            PendingProposal {
                term: self.node.current_term,
                deadline: Instant::now() + self.config.propose_timeout(),
                reply,
            },
        );
        self.broadcast_append();
    }

    fn answer_vote(&mut self, req: &VoteRequest) -> Result<VoteResponse> {
        self.check_running()?;
        let (resp, reset) = self.node.handle_vote_request(req);
        self.persist()?;
        if reset {
            self.reset_election_timer();
        }
        Ok(resp)
    }

    fn answer_append(&mut self, req: &AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.check_running()?;
        let (resp, reset) = self.node.handle_append_entries(req);
        self.persist()?;
        if reset {
            self.reset_election_timer();
        }
        Ok(resp)
    }

    // -- rpc replies --

    fn on_outcome(&mut self, outcome: RpcOutcome) {
        match outcome {
            RpcOutcome::Vote { peer, term, result } => {
                if self.halted.is_some() {
                    return;
                }
                let resp = match result {
                    Ok(resp) => resp,
                    Err(err) => {
                        debug!(node_id = self.node.id, peer, term, %err, "vote request failed");
                        return;
                    }
                };
                if self.is_stale(term, resp.term) {
                    return;
                }
                self.node.handle_vote_response(peer, &resp);
                let _ = self.persist();
            }
            RpcOutcome::Append { peer, term, result } => {
                if self.in_flight.get(&peer) == Some(&term) {
                    self.in_flight.remove(&peer);
                }
                if self.halted.is_some() {
                    return;
                }
                let resp = match result {
                    Ok(resp) => {
                        self.node.peers.mark_healthy(peer, true);
                        resp
                    }
                    Err(err) => {
                        self.node.peers.mark_healthy(peer, false);
                        debug!(node_id = self.node.id, peer, term, %err, "append entries failed");
                        return;
                    }
                };
                if self.is_stale(term, resp.term) {
                    return;
                }
                self.node.handle_append_entries_response(peer, &resp);
                if self.persist().is_err() {
                    return;
                }
                if self.node.peer_needs_entries(peer) {
                    self.send_append(peer);
                }
            }
        }
    }

    /// reply to a request sent under an older term that carries no newer term either
    fn is_stale(&self, sent_term: u64, reply_term: u64) -> bool {
        sent_term != self.node.current_term && reply_term <= self.node.current_term
    }

    // -- timers and fan-out --

    fn on_election_timeout(&mut self) {
        let req = self.node.start_election();
        self.reset_election_timer();
        if self.persist().is_err() {
            return;
        }

        let peers: Vec<_> = self.node.peers.iter().cloned().collect();
        for peer in peers {
            let transport = Arc::clone(&self.transport);
            let outcomes = self.outcomes.clone();
            let rpc_timeout = self.config.rpc_timeout();
            let req = req.clone();
            tokio::spawn(async move {
                let term = req.term;
                let result = match time::timeout(rpc_timeout, transport.request_vote(&peer, req)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout { peer: peer.id }),
                };
                let _ = outcomes.send(RpcOutcome::Vote {
                    peer: peer.id,
                    term,
                    result,
                });
            });
        }
    }

    fn broadcast_append(&mut self) {
        let peers: Vec<u64> = self.node.peers.ids().collect();
        for peer in peers {
            self.send_append(peer);
        }
    }

    /// Send `peer` whatever it is missing, or a heartbeat
    fn send_append(&mut self, peer_id: u64) {
        let term = self.node.current_term;
        if self.in_flight.get(&peer_id) == Some(&term) {
            return;
        }
        let Some(req) = self.node.create_append_entries(peer_id) else {
            return;
        };
        let Some(peer) = self.node.peers.get(peer_id).cloned() else {
            return;
        };
        self.in_flight.insert(peer_id, term);

        let transport = Arc::clone(&self.transport);
        let outcomes = self.outcomes.clone();
        let rpc_timeout = self.config.rpc_timeout();
        tokio::spawn(async move {
            let result = match time::timeout(rpc_timeout, transport.append_entries(&peer, req)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout { peer: peer.id }),
            };
            let _ = outcomes.send(RpcOutcome::Append {
                peer: peer.id,
                term,
                result,
            });
        });
    }

    fn reset_election_timer(&mut self) {
        let raft = &self.config.raft;
        self.election_deadline =
            Instant::now() + random_election_timeout(raft.election_timeout_min, raft.election_timeout_max);
    }

    // -- after every event --

    fn after_event(&mut self) {
        if self.halted.is_none() {
            self.reconcile_role();
            let applied = self.node.apply_committed(self.state_machine.as_mut());
            if applied > 0 {
                debug!(
                    node_id = self.node.id,
                    applied,
                    last_applied = self.node.last_applied,
                    "applied committed entries"
                );
            }
        }
        self.resolve_pending();
        self.publish_status();
    }

    /// act on a leadership change the core made during the last event
    fn reconcile_role(&mut self) {
        let leading = self.node.is_leader().then_some(self.node.current_term);
        if leading == self.led_term {
            return;
        }
        self.led_term = leading;
        if leading.is_some() {
            // assert leadership before anyone else times out
            self.broadcast_append();
        } else {
            self.reset_election_timer();
        }
    }

    fn resolve_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let now = Instant::now();
        for (index, proposal) in std::mem::take(&mut self.pending) {
            let outcome = if let Some(reason) = &self.halted {
                Err(RaftError::Persistence(reason.clone()))
            } else if index <= self.node.commit_index {
                // a different term here means our entry was overwritten
                if self.node.log.term_at(index) == proposal.term {
                    Ok(index)
                } else {
                    Err(self.not_leader())
                }
            } else if !self.node.is_leader() || self.node.current_term != proposal.term {
                Err(self.not_leader())
            } else if now >= proposal.deadline {
                warn!(node_id = self.node.id, index, "proposal not committed in time");
                Err(RaftError::QuorumUnavailable { index })
            } else {
                self.pending.insert(index, proposal);
                continue;
            };
            let _ = proposal.reply.send(outcome);
        }
    }

    fn publish_status(&mut self) {
        let next = NodeStatus::of(&self.node, self.halted.is_some());
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader_hint: self.node.leader_id.filter(|id| *id != self.node.id),
        }
    }

    // -- durability --

    fn check_running(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(RaftError::Persistence(reason.clone())),
            None => Ok(()),
        }
    }

    /// Flush changed term/vote and the unstable log suffix. Halts on failure.
    fn persist(&mut self) -> Result<()> {
        self.check_running()?;
        self.flush().map_err(|err| {
            self.halt(&err);
            RaftError::Persistence(err.to_string())
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        let hard_state = self.node.hard_state();
        if hard_state != self.persisted {
            self.storage.save_term_and_vote(hard_state.term, hard_state.voted_for)?;
            self.persisted = hard_state;
        }

        if let Some(from) = self.node.log.take_unstable() {
            if from <= self.persisted_last_index {
                self.storage.truncate_log_from(from)?;
                self.persisted_last_index = from - 1;
            }
            let entries = self.node.log.entries_from(self.persisted_last_index + 1, usize::MAX);
            self.storage.append_entries(&entries)?;
            self.persisted_last_index = self.node.log.last_index();
        }
        Ok(())
    }

    fn halt(&mut self, err: &io::Error) {
        error!(
            node_id = self.node.id,
            term = self.node.current_term,
            %err,
            "persistence failure, halting node"
        );
        let reason = err.to_string();
        self.halted = Some(reason.clone());
        let term = self.node.current_term;
        self.node.become_follower(term);
        self.led_term = None;
        for (_, proposal) in std::mem::take(&mut self.pending) {
            let _ = proposal.reply.send(Err(RaftError::Persistence(reason.clone())));
        }
    }

    fn stop(&mut self) {
        info!(node_id = self.node.id, term = self.node.current_term, "node stopped");
        for (_, proposal) in std::mem::take(&mut self.pending) {
            let _ = proposal.reply.send(Err(RaftError::Shutdown));
        }
    }
}
