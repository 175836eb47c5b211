//! Common test utilities for raft-runtime cluster tests.
//!
//! Spins up whole clusters on a LocalNetwork with in-memory storage and
//! recording state machines, plus polling helpers with deadlines.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use raft_core::RaftConfig;
use raft_runtime::telemetry::init_tracing;
use raft_runtime::{spawn_node, LocalNetwork, NodeConfig, RaftHandle, RecordingStateMachine};
use raft_storage::{InMemoryStorage, Storage};
use tokio::time::{sleep, Instant};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// Shorter timeouts for faster tests
pub fn fast_raft() -> RaftConfig {
    RaftConfig {
        election_timeout_min: 150,
        election_timeout_max: 300,
        heartbeat_interval: 30,
        max_entries_per_append: 64,
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Test context holding every node of one cluster.
#[allow(dead_code)]
pub struct TestCluster {
    pub network: LocalNetwork,
    pub members: Vec<u64>,
    pub raft: RaftConfig,
    pub propose_timeout_ms: u64,
    pub handles: BTreeMap<u64, RaftHandle>,
    pub storages: BTreeMap<u64, InMemoryStorage>,
    pub machines: BTreeMap<u64, RecordingStateMachine>,
    /// every (term -> leader ids) ever published by any node
    leaders_by_term: Arc<Mutex<BTreeMap<u64, BTreeSet<u64>>>>,
}

#[allow(dead_code)]
impl TestCluster {
    /// Start `size` nodes with ids 1..=size
    pub fn new(size: u64) -> Self {
        Self::with_config(size, fast_raft(), 1_000)
    }

    pub fn with_config(size: u64, raft: RaftConfig, propose_timeout_ms: u64) -> Self {
        init_tracing();
        let members: Vec<u64> = (1..=size).collect();
        let mut cluster = Self {
            network: LocalNetwork::new(),
            members: members.clone(),
            raft,
            propose_timeout_ms,
            handles: BTreeMap::new(),
            storages: BTreeMap::new(),
            machines: BTreeMap::new(),
            leaders_by_term: Arc::new(Mutex::new(BTreeMap::new())),
        };
        for id in members {
            cluster.start(id);
        }
        cluster
    }

    pub fn config(&self, id: u64) -> NodeConfig {
        NodeConfig::new(id, self.members.iter().copied())
            .with_raft(self.raft.clone())
            .with_propose_timeout_ms(self.propose_timeout_ms)
    }

    /// (Re)start a member on its in-memory storage, with a fresh state machine
    pub fn start(&mut self, id: u64) -> RaftHandle {
        let storage = self.storages.entry(id).or_default().clone();
        self.start_with(self.config(id), storage)
    }

    /// Start any node with explicit config and storage
    pub fn start_with<S: Storage + Send + 'static>(&mut self, config: NodeConfig, storage: S) -> RaftHandle {
        let id = config.node_id;
        let machine = RecordingStateMachine::new();
        let handle = spawn_node(config, storage, self.network.transport(id), machine.clone())
            .expect("node should start");
        self.network.register(handle.clone());
        self.observe(&handle);
        self.handles.insert(id, handle.clone());
        self.machines.insert(id, machine);
        handle
    }

    /// Shut a node down and take it off the network
    pub async fn stop(&mut self, id: u64) {
        if let Some(handle) = self.handles.remove(&id) {
            self.network.unregister(id);
            handle.shutdown().await;
        }
    }

    pub async fn shutdown(&mut self) {
        let ids: Vec<u64> = self.handles.keys().copied().collect();
        for id in ids {
            self.stop(id).await;
        }
    }

    pub fn node(&self, id: u64) -> &RaftHandle {
        &self.handles[&id]
    }

    pub fn machine(&self, id: u64) -> &RecordingStateMachine {
        &self.machines[&id]
    }

    pub fn running(&self) -> Vec<u64> {
        self.handles.keys().copied().collect()
    }

    /// Leader with the highest term among `ids`, if any claims leadership
    pub fn leader_among(&self, ids: &[u64]) -> Option<u64> {
        ids.iter()
            .filter_map(|id| self.handles.get(id))
            .map(|h| h.status())
            .filter(|s| s.is_leader())
            .max_by_key(|s| s.term)
            .map(|s| s.id)
    }

    pub async fn wait_for_leader(&self) -> u64 {
        self.wait_for_leader_among(&self.running()).await
    }

    /// Wait until one of `ids` leads and a majority of `ids` agrees on it
    pub async fn wait_for_leader_among(&self, ids: &[u64]) -> u64 {
        let mut found = None;
        let settled = wait_until(WAIT, || {
            let Some(leader) = self.leader_among(ids) else {
                return false;
            };
            let term = self.node(leader).status().term;
            let followers = ids
                .iter()
                .filter_map(|id| self.handles.get(id))
                .map(|h| h.status())
                .filter(|s| s.term == term && s.leader_id == Some(leader))
                .count();
            found = Some(leader);
            followers * 2 > ids.len()
        })
        .await;
        assert!(settled, "no leader elected among {ids:?}");
        found.expect("leader recorded")
    }

    /// Propose through whoever leads, retrying until it commits
    pub async fn propose(&self, command: &str) -> u64 {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(leader) = self.leader_among(&self.running()) {
                match self.node(leader).propose(command.as_bytes().to_vec()).await {
                    Ok(index) => return index,
                    Err(err) if err.is_retryable() => {}
                    Err(err) => panic!("unexpected proposal error: {err}"),
                }
            }
            assert!(Instant::now() < deadline, "proposal {command:?} never committed");
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Propose on one specific node; it must be the leader
    pub async fn propose_on(&self, id: u64, command: &str) -> u64 {
        match self.node(id).propose(command.as_bytes().to_vec()).await {
            Ok(index) => index,
            Err(err) => panic!("node {id} failed to commit {command:?}: {err}"),
        }
    }

    /// Wait for every node in `ids` to apply at least `count` entries
    pub async fn wait_applied(&self, ids: &[u64], count: usize) {
        let done = wait_until(WAIT, || ids.iter().all(|id| self.machine(*id).len() >= count)).await;
        let lens: Vec<(u64, usize)> = ids.iter().map(|id| (*id, self.machine(*id).len())).collect();
        assert!(done, "nodes did not apply {count} entries: {lens:?}");
    }

    pub fn commands(&self, id: u64) -> Vec<String> {
        self.machine(id)
            .commands()
            .into_iter()
            .map(|c| String::from_utf8_lossy(&c).into_owned())
            .collect()
    }

    /// No term ever had two leaders
    pub fn assert_election_safety(&self) {
        let leaders = self.leaders_by_term.lock().unwrap();
        for (term, ids) in leaders.iter() {
            assert!(ids.len() <= 1, "term {term} had leaders {ids:?}");
        }
    }

    /// Every pair of nodes applied identical prefixes
    pub fn assert_state_machine_safety(&self) {
        let applied: Vec<_> = self.machines.values().map(|m| m.entries()).collect();
        for a in &applied {
            for b in &applied {
                for (x, y) in a.iter().zip(b.iter()) {
                    assert_eq!(x, y, "nodes applied different entries at index {}", x.index);
                }
            }
        }
    }

    fn observe(&self, handle: &RaftHandle) {
        let mut status = handle.subscribe();
        let leaders = Arc::clone(&self.leaders_by_term);
        tokio::spawn(async move {
            loop {
                {
                    let current = status.borrow_and_update();
                    if current.is_leader() {
                        leaders.lock().unwrap().entry(current.term).or_default().insert(current.id);
                    }
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
        });
    }
}
