//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via raft-storage
//! what: LogEntry struct, EntryKind, RaftLog with consistency checks and unstable-suffix tracking

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// What a log entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A client command for the state machine
    #[default]
    Command,
    /// Appended by a new leader to commit earlier terms; never applied
    Noop,
}

impl EntryKind {
    fn is_command(&self) -> bool {
        *self == EntryKind::Command
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
    /// Wall-clock time (unix millis) when the leader accepted the command
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "EntryKind::is_command")]
    pub kind: EntryKind,
}

impl LogEntry {
    /// Create a new, unstamped log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command,
            timestamp_ms: 0,
            kind: EntryKind::Command,
        }
    }

    /// Empty entry a leader appends when it takes over a term
    pub fn noop(term: u64, index: u64) -> Self {
        Self {
            kind: EntryKind::Noop,
            ..Self::new(term, index, Vec::new())
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind == EntryKind::Noop
    }

    /// Stamp the entry with the current wall-clock time
    pub fn stamped(mut self) -> Self {
        self.timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self
    }
}

/// In-memory view of a node's log.
///
/// entries are kept contiguous from index 1. every mutation records the lowest
/// index that changed since the last `take_unstable`, so the owner can write
/// exactly that suffix to durable storage before acting on it.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    unstable_from: Option<u64>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from entries that are already durable
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        for (pos, entry) in entries.iter().enumerate() {
            assert_eq!(entry.index, pos as u64 + 1, "restored log must be contiguous from 1");
        }
        Self {
            entries,
            unstable_from: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.term)
    }

    /// Entry at a 1-based index
    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term at a 1-based index; 0 for index 0 or past the end
    pub fn term_at(&self, index: u64) -> u64 {
        self.entry(index).map_or(0, |e| e.term)
    }

    /// Log matching check: index 0 always matches the empty prefix
    pub fn matches(&self, index: u64, term: u64) -> bool {
        index == 0 || self.entry(index).map_or(false, |e| e.term == term)
    }

    /// First index holding the same term as `index` (walks back over the run)
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        let term = self.term_at(index);
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == term {
            first -= 1;
        }
        first
    }

    /// Up to `max` entries starting at `index`
    pub fn entries_from(&self, index: u64, max: usize) -> Vec<LogEntry> {
        let start = index.max(1) as usize - 1;
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    /// Entries in the inclusive range `[from, to]`
    pub fn slice(&self, from: u64, to: u64) -> &[LogEntry] {
        let to = to.min(self.last_index());
        if from == 0 || from > to {
            return &[];
        }
        &self.entries[(from - 1) as usize..to as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Append the next entry; indexes must stay contiguous
    pub fn push(&mut self, entry: LogEntry) {
        assert_eq!(
            entry.index,
            self.last_index() + 1,
            "log entries must be appended contiguously"
        );
        self.mark_unstable(entry.index);
        self.entries.push(entry);
    }

    /// Remove every entry at or after `index`
    pub fn truncate_from(&mut self, index: u64) {
        if index == 0 || index > self.last_index() {
            return;
        }
        self.entries.truncate((index - 1) as usize);
        self.mark_unstable(index);
    }

    /// Lowest index changed since the last call, if any
    pub fn take_unstable(&mut self) -> Option<u64> {
        self.unstable_from.take()
    }

    pub fn has_unstable(&self) -> bool {
        self.unstable_from.is_some()
    }

    fn mark_unstable(&mut self, index: u64) {
        self.unstable_from = Some(self.unstable_from.map_or(index, |i| i.min(index)));
    }
}
