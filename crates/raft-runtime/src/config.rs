//! # config
//!
//! why: everything a node needs to boot, loadable from a json file
//! relations: consumed by node.rs spawn_node; core timing knobs live in raft_core::RaftConfig
//! what: NodeConfig, PeerConfig, validation, storage helper

use raft_core::{PeerRegistry, RaftConfig};
use raft_storage::FileStorage;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// A cluster member other than this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: u64,
    /// Address handed to the transport; opaque to the node
    pub endpoint: String,
}

/// Configuration for a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's unique ID in the cluster (non-zero).
    pub node_id: u64,

    /// Initial peer set, excluding this node.
    pub peers: Vec<PeerConfig>,

    /// Directory for term, vote and log files. Unset for in-memory nodes.
    pub data_dir: Option<PathBuf>,

    /// Election / heartbeat timing and batching.
    pub raft: RaftConfig,

    /// Upper bound on a single outbound RPC.
    pub rpc_timeout_ms: u64,

    /// How long propose waits for its entry to commit.
    pub propose_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            data_dir: None,
            raft: RaftConfig::default(),
            rpc_timeout_ms: 100,
            propose_timeout_ms: 2_000,
        }
    }
}

impl NodeConfig {
    /// Node `node_id` in a cluster of `members`; endpoints are "node-<id>".
    /// `members` may include `node_id` itself.
    pub fn new(node_id: u64, members: impl IntoIterator<Item = u64>) -> Self {
        let peers = members
            .into_iter()
            .filter(|id| *id != node_id)
            .map(|id| PeerConfig {
                node_id: id,
                endpoint: format!("node-{id}"),
            })
            .collect();
        Self {
            node_id,
            peers,
            ..Self::default()
        }
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_propose_timeout_ms(mut self, ms: u64) -> Self {
        self.propose_timeout_ms = ms;
        self
    }

    /// Parse and validate a json document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a json config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let raft = &self.raft;

        if self.node_id == 0 {
            return invalid("node_id must be > 0".to_string());
        }
        if raft.election_timeout_min == 0 || raft.election_timeout_min > raft.election_timeout_max {
            return invalid(format!(
                "election timeout range {}..={} ms is empty",
                raft.election_timeout_min, raft.election_timeout_max
            ));
        }
        // heartbeat should be well below the election timeout
        if raft.heartbeat_interval == 0 || raft.heartbeat_interval >= raft.election_timeout_min {
            return invalid(format!(
                "heartbeat_interval ({}) must be in 1..election_timeout_min ({})",
                raft.heartbeat_interval, raft.election_timeout_min
            ));
        }
        if raft.max_entries_per_append == 0 {
            return invalid("max_entries_per_append must be > 0".to_string());
        }
        if self.rpc_timeout_ms == 0 || self.rpc_timeout_ms >= raft.election_timeout_min {
            return invalid(format!(
                "rpc_timeout_ms ({}) must be in 1..election_timeout_min ({})",
                self.rpc_timeout_ms, raft.election_timeout_min
            ));
        }
        if self.propose_timeout_ms == 0 {
            return invalid("propose_timeout_ms must be > 0".to_string());
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return invalid(format!("node {} lists itself as a peer", self.node_id));
            }
            if peer.node_id == 0 {
                return invalid("peer node_id must be > 0".to_string());
            }
            if !seen.insert(peer.node_id) {
                return invalid(format!("peer {} listed twice", peer.node_id));
            }
        }
        Ok(())
    }

    pub fn peer_registry(&self) -> PeerRegistry {
        let mut registry = PeerRegistry::new(self.node_id);
        for peer in &self.peers {
            registry.add_peer(peer.node_id, peer.endpoint.clone());
        }
        registry
    }

    /// Open durable storage under `data_dir`
    pub fn file_storage(&self) -> Result<FileStorage, ConfigError> {
        let dir = self.data_dir.as_ref().ok_or(ConfigError::MissingDataDir)?;
        FileStorage::new(dir).map_err(|source| ConfigError::Read {
            path: dir.clone(),
            source,
        })
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.raft.heartbeat_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::new(1, [1, 2, 3]);
        assert_eq!(config.peers.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = NodeConfig::from_json_str(
            r#"{
                "node_id": 2,
                "peers": [{"node_id": 1, "endpoint": "10.0.0.1:7000"}],
                "raft": {"heartbeat_interval": 40}
            }"#,
        )
        .unwrap();

        assert_eq!(config.node_id, 2);
        assert_eq!(config.raft.heartbeat_interval, 40);
        assert_eq!(config.raft.election_timeout_min, 150);
        assert_eq!(config.rpc_timeout_ms, 100);
        assert_eq!(config.peer_registry().get(1).unwrap().endpoint, "10.0.0.1:7000");
    }

    #[test]
    fn rejects_self_in_peers() {
        let mut config = NodeConfig::new(1, [2, 3]);
        config.peers.push(PeerConfig {
            node_id: 1,
            endpoint: "node-1".to_string(),
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_duplicate_peers() {
        let mut config = NodeConfig::new(1, [2]);
        config.peers.push(config.peers[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_inverted_timeouts() {
        let config = NodeConfig::new(1, [2]).with_raft(RaftConfig {
            election_timeout_min: 300,
            election_timeout_max: 150,
            ..RaftConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_not_below_election_timeout() {
        let config = NodeConfig::new(1, [2]).with_raft(RaftConfig {
            heartbeat_interval: 150,
            ..RaftConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_errors_surface() {
        assert!(matches!(NodeConfig::from_json_str("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn file_storage_requires_data_dir() {
        assert!(matches!(
            NodeConfig::new(1, [2]).file_storage(),
            Err(ConfigError::MissingDataDir)
        ));
    }
}
