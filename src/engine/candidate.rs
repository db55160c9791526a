//! Event handling for a node in the candidate role.

use std::collections::BTreeSet;

use tracing::debug;

use super::follower;
use super::Outcome;
use super::RaftState;
use super::Role;
use crate::error::RaftError;
use crate::message::Message;
use crate::message::VoteResponse;
use crate::storage::RaftLog;
use crate::types::Update;
use crate::AppData;
use crate::NodeId;

pub(super) fn handle<D, L>(
    state: &RaftState,
    granted: &BTreeSet<NodeId>,
    msg: Message<D>,
    log: &L,
) -> Result<Outcome<D>, RaftError>
where
    D: AppData,
    L: RaftLog<D>,
{
    match msg {
        Message::VoteResponse(resp) => Ok(vote_response(state, granted, resp)),

        // A current leader exists; this election is over. The message is
        // handled exactly as a follower would, plus the role change.
        Message::AppendEntries(ref req) if req.leader_term >= state.current_term => {
            let mut outcome = follower::handle(state, msg, log)?;
            outcome.next_role = Some(Role::Follower);
            Ok(outcome)
        }
        Message::Heartbeat(ref hb) if hb.leader_term >= state.current_term => {
            let mut outcome = follower::handle(state, msg, log)?;
            outcome.next_role = Some(Role::Follower);
            Ok(outcome)
        }
        // From a stale term; the follower path responds with the current
        // term, deposing the sender.
        Message::AppendEntries(_) | Message::Heartbeat(_) => follower::handle(state, msg, log),

        Message::VoteRequest(req) => {
            // Having voted for itself this term, the candidate refuses
            // same-term rivals through the one-vote rule; a higher term ends
            // its candidacy.
            let step_down = req.term > state.current_term;
            let mut outcome = follower::vote_request(state, req)?;
            if step_down {
                outcome.next_role = Some(Role::Follower);
            }
            Ok(outcome)
        }

        // No leader is known during an election; submissions are dropped and
        // the client retries.
        Message::NewEntry(_) | Message::NewEntryBatch(_) => follower::handle(state, msg, log),

        Message::AppendEntriesResponse(_) | Message::HeartbeatResponse(_) | Message::LogCompactionInfo(_) => {
            Ok(Outcome::default())
        }
    }
}

/// Tally a vote (§5.2).
fn vote_response<D: AppData>(state: &RaftState, granted: &BTreeSet<NodeId>, resp: VoteResponse) -> Outcome<D> {
    if resp.term > state.current_term {
        debug!(term = resp.term, "vote response carries a newer term, stepping down");
        return Outcome {
            next_role: Some(Role::Follower),
            term: Update::Update(resp.term),
            voted_for: Update::Update(None),
            leader: Update::Update(None),
            renew_election_timer: true,
            ..Default::default()
        };
    }
    if !resp.granted || resp.term < state.current_term {
        return Outcome::default();
    }

    let mut granted = granted.clone();
    granted.insert(resp.from);
    // Majority is judged against the live voting set, so a membership change
    // adopted mid-election is accounted for.
    if state.membership.is_majority(&granted) {
        return super::become_leader(state, state.current_term, Update::Ignore);
    }
    Outcome {
        next_role: Some(Role::Candidate { granted }),
        ..Default::default()
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
