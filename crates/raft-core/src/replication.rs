//! # replication
//!
//! why: leader-side log replication and commit advancement
//! relations: extends RaftNode from node.rs; requests are answered by rpc.rs on followers
//! what: propose, create_append_entries, handle_append_entries_response, commit rule

use tracing::debug;

use crate::error::{RaftError, Result};
use crate::log::LogEntry;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse};
use crate::node::{NodeState, RaftNode};

impl RaftNode {
    /// Append a client command to the leader's log. Returns its index.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<u64> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        let index = self.append_entry(command).index;
        // a lone leader is its own majority
        self.advance_commit_index();
        Ok(index)
    }

    /// Append to the local log at the current term (leader only)
    pub fn append_entry(&mut self, command: Vec<u8>) -> LogEntry {
        assert!(self.is_leader(), "only a leader appends new entries");
        let entry = LogEntry::new(self.current_term, self.log.last_index() + 1, command).stamped();
        self.log.push(entry.clone());
        debug!(node_id = self.id, index = entry.index, term = entry.term, "appended entry");
        entry
    }

    /// AppendEntries carrying everything `peer` is missing, capped per batch
    pub fn create_append_entries(&self, peer: u64) -> Option<AppendEntriesRequest> {
        self.build_append_entries(peer, self.config.max_entries_per_append)
    }

    /// Empty AppendEntries asserting leadership and propagating the commit index
    pub fn create_heartbeat(&self, peer: u64) -> Option<AppendEntriesRequest> {
        self.build_append_entries(peer, 0)
    }

    fn build_append_entries(&self, peer: u64, max_entries: usize) -> Option<AppendEntriesRequest> {
        if !self.is_leader() {
            return None;
        }
        let progress = self.progress.get(&peer)?;
        let prev_log_index = progress.next_index - 1;
        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index),
            entries: self.log.entries_from(progress.next_index, max_entries),
            leader_commit: self.commit_index,
        })
    }

    /// Whether `peer` still lacks entries the leader has
    pub fn peer_needs_entries(&self, peer: u64) -> bool {
        self.progress
            .get(&peer)
            .map_or(false, |p| p.next_index <= self.log.last_index())
    }

    /// Process a follower's reply. Returns true if the commit index advanced.
    pub fn handle_append_entries_response(&mut self, from: u64, resp: &AppendEntriesResponse) -> bool {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return false;
        }
        if self.state != NodeState::Leader || resp.term < self.current_term {
            return false;
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return false;
        };

        if resp.success {
            // replies may be reordered; match_index only moves forward
            let matched = resp.match_index.min(last_index);
            if matched > progress.match_index {
                progress.match_index = matched;
            }
            progress.next_index = progress.match_index + 1;
            return self.advance_commit_index();
        }

        // back off, jumping to the follower's hint when it is further back
        let stepped = progress.next_index.saturating_sub(1);
        let target = if resp.conflict_index > 0 {
            resp.conflict_index.min(stepped)
        } else {
            stepped
        };
        progress.next_index = target.max(progress.match_index + 1).max(1);
        debug!(
            node_id = self.id,
            peer = from,
            next_index = progress.next_index,
            "log mismatch, backing off"
        );
        false
    }

    /// Move commit_index to the highest current-term entry held by a majority
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let mut matched: Vec<u64> = self
            .peers
            .ids()
            .map(|peer| self.progress.get(&peer).map_or(0, |p| p.match_index))
            .collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum_size() - 1];
        // terms are non-decreasing along the log, so an older term here
        // means nothing at or below it can be committed directly
        if candidate > self.commit_index && self.log.term_at(candidate) == self.current_term {
            self.commit_to(candidate);
            return true;
        }
        false
    }

    fn commit_to(&mut self, index: u64) {
        assert_eq!(
            self.log.term_at(index),
            self.current_term,
            "a leader only commits entries from its own term directly"
        );
        assert!(index > self.commit_index, "commit index never moves backwards");
        self.commit_index = index;
        debug!(node_id = self.id, commit_index = index, "commit index advanced");
    }
}
