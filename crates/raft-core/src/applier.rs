//! # applier
//!
//! why: hand committed entries to the application exactly once, in index order
//! relations: extends RaftNode; last_applied is its only coupling to the rest
//! what: StateMachine trait, get_entries_to_apply, apply_committed

use crate::log::LogEntry;
use crate::node::RaftNode;

/// The replicated application. Opaque to the core; sees only client commands.
pub trait StateMachine {
    fn apply(&mut self, entry: &LogEntry);
}

impl StateMachine for Vec<LogEntry> {
    fn apply(&mut self, entry: &LogEntry) {
        self.push(entry.clone());
    }
}

impl RaftNode {
    /// Committed entries not yet applied; marks them applied
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        assert!(self.last_applied <= self.commit_index, "applied past commit");
        if self.last_applied == self.commit_index {
            return Vec::new();
        }
        let entries = self
            .log
            .slice(self.last_applied + 1, self.commit_index)
            .to_vec();
        assert_eq!(
            entries.len() as u64,
            self.commit_index - self.last_applied,
            "committed entries missing from log"
        );
        self.last_applied = self.commit_index;
        entries
    }

    /// Feed committed commands to `sm`, skipping leader no-ops.
    /// Returns how many reached the state machine.
    pub fn apply_committed<S: StateMachine + ?Sized>(&mut self, sm: &mut S) -> usize {
        let mut applied = 0;
        for entry in self.get_entries_to_apply().iter().filter(|e| !e.is_noop()) {
            sm.apply(entry);
            applied += 1;
        }
        applied
    }
}
