//! # state_machine
//!
//! why: ready-made sinks for committed entries
//! relations: implement raft_core::StateMachine; driven by the node actor after each commit
//! what: ChannelStateMachine (output stream), RecordingStateMachine (shared vec)

use raft_core::{LogEntry, StateMachine};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// Forwards every applied entry to a channel, in index order.
///
/// a dropped receiver does not stall the node; entries are then discarded.
pub struct ChannelStateMachine {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl ChannelStateMachine {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StateMachine for ChannelStateMachine {
    fn apply(&mut self, entry: &LogEntry) {
        if self.tx.send(entry.clone()).is_err() {
            debug!(index = entry.index, "applied entry has no listener");
        }
    }
}

/// Keeps every applied entry; clones share the same record
#[derive(Clone, Default)]
pub struct RecordingStateMachine {
    applied: Arc<Mutex<Vec<LogEntry>>>,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.applied.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of everything applied so far
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.lock().iter().map(|e| e.command.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl StateMachine for RecordingStateMachine {
    fn apply(&mut self, entry: &LogEntry) {
        self.lock().push(entry.clone());
    }
}
