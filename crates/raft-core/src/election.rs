//! # election
//!
//! why: leader election with one vote per term and the log up-to-date check
//! relations: extends RaftNode from node.rs; driven by the runtime's election timer
//! what: start_election, handle_vote_request, handle_vote_response

use tracing::{debug, info};

use crate::message::{VoteRequest, VoteResponse};
use crate::node::{NodeState, RaftNode};

impl RaftNode {
    /// Election timer fired: new term, vote for self, ask everyone else.
    ///
    /// a single-node cluster wins on the spot.
    pub fn start_election(&mut self) -> VoteRequest {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.progress.clear();
        self.votes_received.clear();
        self.votes_received.insert(self.id);

        info!(node_id = self.id, term = self.current_term, "starting election");

        let request = VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        if self.has_quorum() {
            self.become_leader();
        }
        request
    }

    /// Answer a RequestVote. Returns the reply and whether the election timer should reset.
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> (VoteResponse, bool) {
        if let Err(err) = self.check_term(req.term) {
            debug!(node_id = self.id, candidate = req.candidate_id, %err, "rejecting vote request");
            return (self.vote_response(false), false);
        }
        if req.term > self.current_term {
            self.become_follower(req.term);
        }

        let free_to_vote = self.voted_for.map_or(true, |v| v == req.candidate_id);
        let up_to_date = self.candidate_log_up_to_date(req.last_log_index, req.last_log_term);
        let granted = free_to_vote && up_to_date;
        if granted {
            self.voted_for = Some(req.candidate_id);
        }

        debug!(
            node_id = self.id,
            candidate = req.candidate_id,
            term = req.term,
            granted,
            "vote request"
        );
        (self.vote_response(granted), granted)
    }

    /// Count a vote reply. Returns true if this reply made us leader.
    pub fn handle_vote_response(&mut self, from: u64, resp: &VoteResponse) -> bool {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return false;
        }
        // replies from an earlier round, or after we already moved on
        if self.state != NodeState::Candidate || resp.term < self.current_term {
            return false;
        }
        if !resp.vote_granted || !self.peers.contains(from) {
            return false;
        }

        self.votes_received.insert(from);
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    /// (lastLogTerm, lastLogIndex) compared lexicographically against ours
    pub fn candidate_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        (last_log_term, last_log_index) >= (self.log.last_term(), self.log.last_index())
    }

    fn vote_response(&self, vote_granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }
}
