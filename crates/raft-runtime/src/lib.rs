//! # raft-runtime
//!
//! why: turn the pure raft-core state machine into a live node with timers, rpc fan-out and durability
//! relations: drives raft-core, persists through raft-storage, talks to peers through a Transport
//! what: node actor and handle, transport seam, in-process network, config, state machine sinks, tracing setup

pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod state_machine;
pub mod telemetry;
pub mod timer;
pub mod transport;

pub use config::{NodeConfig, PeerConfig};
pub use error::{ConfigError, StartError, TransportError};
pub use network::{LocalNetwork, LocalTransport};
pub use node::{spawn_node, NodeStatus, RaftHandle};
pub use state_machine::{ChannelStateMachine, RecordingStateMachine};
pub use transport::Transport;
