//! # rpc
//!
//! why: single inbound entry point enforcing term and log-matching rules
//! relations: extends RaftNode; dispatches to election.rs and replication.rs
//! what: handle_append_entries, step dispatcher, term / prev-log checks

use tracing::{debug, warn};

use crate::error::{RaftError, Result};
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, RaftMessage};
use crate::node::{NodeState, RaftNode};

impl RaftNode {
    /// Handle any inbound message. Returns the reply to send back (if any)
    /// and whether the election timer should reset.
    pub fn step(&mut self, from: u64, msg: RaftMessage) -> (Option<RaftMessage>, bool) {
        match msg {
            RaftMessage::VoteRequest(req) => {
                let (resp, reset) = self.handle_vote_request(&req);
                (Some(resp.into()), reset)
            }
            RaftMessage::VoteResponse(resp) => {
                self.handle_vote_response(from, &resp);
                (None, false)
            }
            RaftMessage::AppendEntries(req) => {
                let (resp, reset) = self.handle_append_entries(&req);
                (Some(resp.into()), reset)
            }
            RaftMessage::AppendEntriesResponse(resp) => {
                self.handle_append_entries_response(from, &resp);
                (None, false)
            }
        }
    }

    /// Follower side of replication. Returns the reply and whether the
    /// election timer should reset (true for any current-term leader).
    pub fn handle_append_entries(&mut self, req: &AppendEntriesRequest) -> (AppendEntriesResponse, bool) {
        if let Err(err) = self.check_term(req.term) {
            debug!(node_id = self.id, leader = req.leader_id, %err, "rejecting append entries");
            return (self.reject(0), false);
        }

        assert!(
            !(self.state == NodeState::Leader && req.term == self.current_term),
            "two leaders in term {}",
            req.term
        );
        if req.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(req.term);
        }
        self.leader_id = Some(req.leader_id);

        if let Err(err) = self.check_log_match(req.prev_log_index, req.prev_log_term) {
            let conflict_index = if req.prev_log_index > self.log.last_index() {
                self.log.last_index() + 1
            } else {
                self.log.first_index_of_term(req.prev_log_index)
            };
            debug!(node_id = self.id, leader = req.leader_id, %err, conflict_index, "append entries mismatch");
            return (self.reject(conflict_index), true);
        }

        for (offset, entry) in req.entries.iter().enumerate() {
            let expected = req.prev_log_index + 1 + offset as u64;
            if entry.index != expected {
                warn!(node_id = self.id, leader = req.leader_id, expected, got = entry.index, "malformed append entries");
                return (self.reject(0), true);
            }
            match self.log.entry(entry.index).map(|e| e.term) {
                // already have it: duplicate or reordered delivery
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    assert!(
                        entry.index > self.commit_index,
                        "conflict at committed index {}",
                        entry.index
                    );
                    debug!(node_id = self.id, index = entry.index, "truncating conflicting suffix");
                    self.log.truncate_from(entry.index);
                    self.log.push(entry.clone());
                }
                None => self.log.push(entry.clone()),
            }
        }

        // only the prefix confirmed by this request is known to match the leader
        let match_index = req.prev_log_index + req.entries.len() as u64;
        let new_commit = req.leader_commit.min(match_index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            debug!(node_id = self.id, commit_index = new_commit, "follower commit advanced");
        }

        let resp = AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index,
            conflict_index: 0,
        };
        (resp, true)
    }

    /// Reject anything older than our term
    pub(crate) fn check_term(&self, term: u64) -> Result<()> {
        if term < self.current_term {
            return Err(RaftError::StaleTerm {
                received: term,
                current: self.current_term,
            });
        }
        Ok(())
    }

    /// Log matching property: we must hold prev_log_index at prev_log_term
    pub(crate) fn check_log_match(&self, prev_log_index: u64, prev_log_term: u64) -> Result<()> {
        if self.log.matches(prev_log_index, prev_log_term) {
            Ok(())
        } else {
            Err(RaftError::LogMismatch {
                index: prev_log_index,
            })
        }
    }

    fn reject(&self, conflict_index: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success: false,
            match_index: 0,
            conflict_index,
        }
    }
}
