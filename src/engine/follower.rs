//! Event handling for a node in the follower role.

use tracing::debug;
use tracing::warn;

use super::outcome::LogDirective;
use super::Outcome;
use super::RaftState;
use crate::ballot;
use crate::error::RaftError;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::EntryPayload;
use crate::message::Heartbeat;
use crate::message::HeartbeatResponse;
use crate::message::Message;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::storage::RaftLog;
use crate::types::Update;
use crate::AppData;

pub(super) fn handle<D, L>(state: &RaftState, msg: Message<D>, log: &L) -> Result<Outcome<D>, RaftError>
where
    D: AppData,
    L: RaftLog<D>,
{
    match msg {
        Message::AppendEntries(req) => append_entries(state, req, log),
        Message::Heartbeat(hb) => heartbeat(state, hb, log),
        Message::VoteRequest(req) => vote_request(state, req),
        Message::NewEntry(_) | Message::NewEntryBatch(_) => Ok(forward_to_leader(state, msg)),
        Message::LogCompactionInfo(info) => {
            // The entries this node needs are gone from the leader's log; it
            // can only rejoin through an out-of-band copy of the store.
            warn!(leader = info.leader, prev_index = info.prev_index, "leader has pruned the entries this node needs");
            Ok(Outcome::default())
        }
        Message::VoteResponse(_) | Message::AppendEntriesResponse(_) | Message::HeartbeatResponse(_) => {
            // Stale responses from a role this node no longer occupies.
            Ok(Outcome::default())
        }
    }
}

/// Replicate entries from the leader (§5.3).
fn append_entries<D, L>(state: &RaftState, req: AppendEntriesRequest<D>, log: &L) -> Result<Outcome<D>, RaftError>
where
    D: AppData,
    L: RaftLog<D>,
{
    if req.leader_term < state.current_term {
        debug!(
            term = req.leader_term,
            current_term = state.current_term,
            "rejecting append entries from a stale term"
        );
        let mut outcome = Outcome::default();
        outcome.send.push((
            req.leader,
            Message::AppendEntriesResponse(AppendEntriesResponse {
                cluster: state.cluster,
                from: state.id,
                term: state.current_term,
                success: false,
                match_index: state.commit_index,
                append_index: state.last_log_index,
            }),
        ));
        return Ok(outcome);
    }

    let mut outcome = acknowledge_leader(state, req.leader, req.leader_term);
    let term = state.current_term.max(req.leader_term);

    // The entry preceding this shipment must match; pruned prefixes are
    // committed and match by definition.
    let prev_ok = req.prev_log_index == 0
        || req.prev_log_index < log.first_index()
        || log.term_at(req.prev_log_index)? == Some(req.prev_log_term);
    if !prev_ok {
        // Point the leader's cursor at the highest plausible match so it
        // retransmits from the entry after it, never skipping anything. The
        // committed prefix is known good, so never back off below it.
        let hint = state.commit_index.max(state.last_log_index.min(req.prev_log_index.saturating_sub(1)));
        debug!(
            prev_log_index = req.prev_log_index,
            prev_log_term = req.prev_log_term,
            hint,
            "append entries prev check failed"
        );
        outcome.send.push((
            req.leader,
            Message::AppendEntriesResponse(AppendEntriesResponse {
                cluster: state.cluster,
                from: state.id,
                term,
                success: false,
                match_index: hint,
                append_index: state.last_log_index,
            }),
        ));
        return Ok(outcome);
    }

    // Walk the shipped entries past everything already present, truncating at
    // the first conflict (§5.3). Entries are only ever deleted to make way
    // for the leader's version of the same indices.
    let mut truncated = false;
    let mut append_from = req.entries.len();
    for (pos, entry) in req.entries.iter().enumerate() {
        if entry.index() > state.last_log_index {
            append_from = pos;
            break;
        }
        match log.term_at(entry.index())? {
            Some(term) if term == entry.term() => continue,
            _ => {
                debug!(index = entry.index(), "conflicting entry, truncating");
                outcome.log.push(LogDirective::TruncateFrom { from: entry.index() });
                truncated = true;
                append_from = pos;
                break;
            }
        }
    }

    let to_append = &req.entries[append_from..];
    let new_last = to_append.last().map(|e| e.index()).unwrap_or_else(|| {
        req.entries.last().map(|e| e.index()).unwrap_or(req.prev_log_index)
    });
    // A membership entry takes effect as soon as it is appended, not when it
    // commits.
    if let Some(config) = to_append.iter().rev().find_map(|e| match &e.payload {
        EntryPayload::Membership(config) => Some(config.clone()),
        _ => None,
    }) {
        outcome.membership = Update::Update(config);
    }
    if !to_append.is_empty() {
        outcome.log.push(LogDirective::Append {
            entries: to_append.to_vec(),
        });
    }

    let append_index = if truncated { new_last } else { state.last_log_index.max(new_last) };
    if req.leader_commit > state.commit_index {
        let commit = req.leader_commit.min(new_last);
        if commit > state.commit_index {
            outcome.commit_to = Some(commit);
        }
    }

    outcome.send.push((
        req.leader,
        Message::AppendEntriesResponse(AppendEntriesResponse {
            cluster: state.cluster,
            from: state.id,
            term,
            success: true,
            match_index: new_last,
            append_index,
        }),
    ));
    Ok(outcome)
}

/// Handle a leader liveness probe.
fn heartbeat<D, L>(state: &RaftState, hb: Heartbeat, log: &L) -> Result<Outcome<D>, RaftError>
where
    D: AppData,
    L: RaftLog<D>,
{
    if hb.leader_term < state.current_term {
        let mut outcome = Outcome::default();
        outcome.send.push((
            hb.leader,
            Message::HeartbeatResponse(HeartbeatResponse {
                cluster: state.cluster,
                from: state.id,
                term: state.current_term,
            }),
        ));
        return Ok(outcome);
    }

    let mut outcome = acknowledge_leader(state, hb.leader, hb.leader_term);

    // A heartbeat may advance the commit index, but only once this node can
    // prove it holds the very entry the leader committed; an index alone
    // could refer to a conflicting entry from a deposed leader.
    if hb.commit_index > state.commit_index
        && hb.commit_index <= state.last_log_index
        && log.term_at(hb.commit_index)? == Some(hb.commit_index_term)
    {
        outcome.commit_to = Some(hb.commit_index);
    }

    outcome.send.push((
        hb.leader,
        Message::HeartbeatResponse(HeartbeatResponse {
            cluster: state.cluster,
            from: state.id,
            term: state.current_term.max(hb.leader_term),
        }),
    ));
    Ok(outcome)
}

/// Decide on a vote solicitation (§5.2, §5.4.1).
pub(super) fn vote_request<D: AppData>(state: &RaftState, req: VoteRequest) -> Result<Outcome<D>, RaftError> {
    let mut outcome = Outcome::default();

    // While this node hears from a live leader it refuses vote solicitations
    // outright, without even adopting a higher term. This stops a removed or
    // partitioned-and-returned node from deposing a healthy leader through
    // term inflation; the stickiness clears when the election timeout fires.
    if state.leader.is_some() {
        debug!(candidate = req.candidate, term = req.term, "refusing vote, a live leader is known");
        outcome.send.push((
            req.candidate,
            Message::VoteResponse(VoteResponse {
                cluster: state.cluster,
                from: state.id,
                term: state.current_term,
                granted: false,
            }),
        ));
        return Ok(outcome);
    }

    let term = state.current_term.max(req.term);
    if req.term > state.current_term {
        outcome.term = Update::Update(req.term);
        outcome.voted_for = Update::Update(None);
    }

    let granted = ballot::should_vote_for(
        req.candidate,
        req.term,
        state.current_term,
        state.last_log_index,
        req.last_log_index,
        state.last_log_term,
        req.last_log_term,
        state.voted_for,
    );
    if granted {
        debug!(candidate = req.candidate, term = req.term, "granting vote");
        outcome.voted_for = Update::Update(Some(req.candidate));
        outcome.renew_election_timer = true;
    }

    outcome.send.push((
        req.candidate,
        Message::VoteResponse(VoteResponse {
            cluster: state.cluster,
            from: state.id,
            term,
            granted,
        }),
    ));
    Ok(outcome)
}

/// Forward a client submission to the known leader, or drop it.
///
/// Dropping is safe: the client observes commitment, not delivery, and will
/// retry an entry that never commits.
fn forward_to_leader<D: AppData>(state: &RaftState, msg: Message<D>) -> Outcome<D> {
    let mut outcome = Outcome::default();
    match state.leader {
        Some(leader) => outcome.send.push((leader, msg)),
        None => warn!("dropping client submission, no known leader to forward to"),
    }
    outcome
}

/// The base outcome for any authenticated message from a current leader:
/// adopt its term, record it as leader, and push the election timeout out.
fn acknowledge_leader<D: AppData>(state: &RaftState, leader: crate::NodeId, leader_term: u64) -> Outcome<D> {
    let mut outcome = Outcome {
        renew_election_timer: true,
        ..Default::default()
    };
    if leader_term > state.current_term {
        outcome.term = Update::Update(leader_term);
        outcome.voted_for = Update::Update(None);
    }
    if state.leader != Some(leader) {
        outcome.leader = Update::Update(Some(leader));
    }
    outcome
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use maplit::btreeset;

    use super::*;
    use crate::message::Entry;
    use crate::message::MembershipConfig;
    use crate::storage::InMemoryLog;
    use crate::types::ClusterId;
    use crate::types::LogId;

    fn state(term: u64, last: LogId) -> RaftState {
        RaftState {
            id: 1,
            cluster: ClusterId(0),
            current_term: term,
            voted_for: None,
            leader: None,
            commit_index: 0,
            last_log_index: last.index,
            last_log_term: last.term,
            membership: MembershipConfig {
                voting: btreeset![1, 2, 3],
                target: None,
            },
        }
    }

    fn entry(term: u64, index: u64) -> Entry<u64> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(index),
        }
    }

    fn log_of(entries: &[(u64, u64)]) -> InMemoryLog<u64> {
        let mut log = InMemoryLog::new();
        for (term, index) in entries {
            log.append(entry(*term, *index)).unwrap();
        }
        log
    }

    fn append_req(leader_term: u64, prev: LogId, entries: Vec<Entry<u64>>, leader_commit: u64) -> AppendEntriesRequest<u64> {
        AppendEntriesRequest {
            cluster: ClusterId(0),
            leader_term,
            leader: 2,
            prev_log_index: prev.index,
            prev_log_term: prev.term,
            entries,
            leader_commit,
        }
    }

    fn sent_append_response(outcome: &Outcome<u64>) -> &AppendEntriesResponse {
        match &outcome.send[0].1 {
            Message::AppendEntriesResponse(resp) => resp,
            other => panic!("expected append entries response, got {other:?}"),
        }
    }

    #[test]
    fn stale_term_append_is_rejected_with_current_term() {
        let state = state(5, LogId::new(2, 3));
        let log = log_of(&[(1, 1), (2, 2), (2, 3)]);
        let req = append_req(4, LogId::new(2, 3), vec![entry(4, 4)], 0);

        let outcome = append_entries(&state, req, &log).unwrap();
        let resp = sent_append_response(&outcome);
        assert!(!resp.success);
        assert_eq!(resp.term, 5);
        assert!(!outcome.renew_election_timer, "a stale leader must not defer elections");
    }

    #[test]
    fn prev_mismatch_reports_backoff_hint() {
        let mut state = state(2, LogId::new(2, 3));
        state.commit_index = 1;
        let log = log_of(&[(1, 1), (2, 2), (2, 3)]);
        // Leader believes this node has 9 entries.
        let req = append_req(2, LogId::new(2, 9), vec![entry(2, 10)], 0);

        let outcome = append_entries(&state, req, &log).unwrap();
        let resp = sent_append_response(&outcome);
        assert!(!resp.success);
        assert_eq!(resp.match_index, 3, "hint caps at the local append index");
        assert_eq!(resp.append_index, 3);
        assert!(outcome.renew_election_timer, "a live leader defers elections even on mismatch");
    }

    #[test]
    fn conflicting_suffix_is_truncated_and_replaced() {
        let mut state = state(3, LogId::new(2, 3));
        state.commit_index = 1;
        let log = log_of(&[(1, 1), (2, 2), (2, 3)]);
        // Entries 2..=3 were written by a deposed leader; the new leader
        // ships its own 2..=4 over prev 1.
        let req = append_req(3, LogId::new(1, 1), vec![entry(3, 2), entry(3, 3), entry(3, 4)], 2);

        let outcome = append_entries(&state, req, &log).unwrap();
        assert_eq!(outcome.log.len(), 2);
        assert_eq!(outcome.log[0], LogDirective::TruncateFrom { from: 2 });
        match &outcome.log[1] {
            LogDirective::Append { entries } => {
                assert_eq!(entries.iter().map(|e| e.index()).collect::<Vec<_>>(), vec![2, 3, 4]);
                assert!(entries.iter().all(|e| e.term() == 3));
            }
            other => panic!("expected append, got {other:?}"),
        }
        assert_eq!(outcome.commit_to, Some(2));
        let resp = sent_append_response(&outcome);
        assert!(resp.success);
        assert_eq!(resp.match_index, 4);
        assert_eq!(resp.append_index, 4);
    }

    #[test]
    fn duplicate_entries_are_skipped_idempotently() {
        let state = state(2, LogId::new(2, 3));
        let log = log_of(&[(1, 1), (2, 2), (2, 3)]);
        // A retransmission of entries this node already holds.
        let req = append_req(2, LogId::new(1, 1), vec![entry(2, 2), entry(2, 3)], 0);

        let outcome = append_entries(&state, req, &log).unwrap();
        assert!(outcome.log.is_empty(), "nothing to truncate or append");
        let resp = sent_append_response(&outcome);
        assert!(resp.success);
        assert_eq!(resp.match_index, 3);
        assert_eq!(resp.append_index, 3);
    }

    #[test]
    fn commit_is_capped_at_the_last_shipped_entry() {
        let state = state(2, LogId::new(2, 2));
        let log = log_of(&[(1, 1), (2, 2)]);
        let req = append_req(2, LogId::new(2, 2), vec![entry(2, 3)], 9);

        let outcome = append_entries(&state, req, &log).unwrap();
        assert_eq!(outcome.commit_to, Some(3));
    }

    #[test]
    fn membership_entry_takes_effect_on_append() {
        let state = state(2, LogId::new(2, 1));
        let log = log_of(&[(2, 1)]);
        let config = MembershipConfig {
            voting: btreeset![1, 2, 3],
            target: Some(btreeset![1, 2, 3, 4]),
        };
        let req = append_req(
            2,
            LogId::new(2, 1),
            vec![Entry {
                log_id: LogId::new(2, 2),
                payload: EntryPayload::Membership(config.clone()),
            }],
            0,
        );

        let outcome = append_entries(&state, req, &log).unwrap();
        assert_eq!(outcome.membership, Update::Update(config));
    }

    #[test]
    fn heartbeat_advances_commit_only_with_matching_term() {
        let state = state(3, LogId::new(2, 3));
        let log = log_of(&[(1, 1), (2, 2), (2, 3)]);

        let mut hb = Heartbeat {
            cluster: ClusterId(0),
            leader: 2,
            leader_term: 3,
            commit_index: 3,
            commit_index_term: 3,
        };
        // The leader committed a different entry 3 than this node holds.
        let outcome = heartbeat::<u64, _>(&state, hb.clone(), &log).unwrap();
        assert_eq!(outcome.commit_to, None);

        hb.commit_index_term = 2;
        let outcome = heartbeat::<u64, _>(&state, hb.clone(), &log).unwrap();
        assert_eq!(outcome.commit_to, Some(3));

        // An index beyond the local log can not be verified.
        hb.commit_index = 9;
        let outcome = heartbeat::<u64, _>(&state, hb, &log).unwrap();
        assert_eq!(outcome.commit_to, None);
    }

    #[test]
    fn votes_are_refused_while_a_leader_is_known() {
        let mut state = state(3, LogId::new(2, 3));
        state.leader = Some(2);
        let req = VoteRequest {
            cluster: ClusterId(0),
            term: 3,
            candidate: 3,
            last_log_index: 9,
            last_log_term: 9,
        };

        let outcome = vote_request::<u64>(&state, req.clone()).unwrap();
        match &outcome.send[0].1 {
            Message::VoteResponse(resp) => assert!(!resp.granted),
            other => panic!("expected vote response, got {other:?}"),
        }

        // Even a higher term does not leak in while the leader is live, so a
        // removed node can not depose a healthy cluster by term inflation.
        let req = VoteRequest { term: 9, ..req };
        let outcome = vote_request::<u64>(&state, req.clone()).unwrap();
        assert!(outcome.term.is_ignore());
        match &outcome.send[0].1 {
            Message::VoteResponse(resp) => {
                assert!(!resp.granted);
                assert_eq!(resp.term, 3);
            }
            other => panic!("expected vote response, got {other:?}"),
        }

        // Once the leader is forgotten the same request is processed.
        state.leader = None;
        let outcome = vote_request::<u64>(&state, req).unwrap();
        assert_eq!(outcome.term, Update::Update(9));
        match &outcome.send[0].1 {
            Message::VoteResponse(resp) => {
                assert!(resp.granted);
                assert_eq!(resp.term, 9);
            }
            other => panic!("expected vote response, got {other:?}"),
        }
    }

    #[test]
    fn client_submission_is_forwarded_to_the_known_leader() {
        let mut state = state(3, LogId::new(2, 3));
        state.leader = Some(2);
        let msg = Message::NewEntry(crate::message::NewEntryRequest {
            cluster: ClusterId(0),
            content: 42u64,
        });

        let outcome = forward_to_leader(&state, msg.clone());
        assert_eq!(outcome.send.len(), 1);
        assert_eq!(outcome.send[0].0, 2);

        state.leader = None;
        let outcome = forward_to_leader(&state, msg);
        assert!(outcome.send.is_empty(), "no leader, the submission is dropped");
    }
}
