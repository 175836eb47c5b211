//! # error
//!
//! why: failures that only exist once there is a network, a config file and a disk
//! relations: TransportError from transport.rs / network.rs, ConfigError from config.rs
//! what: TransportError, ConfigError, StartError

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// An RPC that did not produce a reply. The caller treats all of these as "no answer".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {peer} is unreachable")]
    Unreachable { peer: u64 },

    #[error("rpc to peer {peer} timed out")]
    Timeout { peer: u64 },

    #[error("message to peer {peer} was dropped")]
    Dropped { peer: u64 },

    /// the peer answered with an error instead of a reply
    #[error("peer {peer} failed the request: {reason}")]
    Remote { peer: u64, reason: String },

    #[error("wire codec error: {0}")]
    Codec(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("data_dir is not set")]
    MissingDataDir,
}

/// Reasons spawn_node refuses to start a node
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load persisted state: {0}")]
    Storage(#[from] io::Error),
}
