//! Event handling for a node in the leader role.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::debug;
use tracing::error;

use super::follower;
use super::outcome::LogDirective;
use super::LeaderContext;
use super::Outcome;
use super::RaftState;
use super::Role;
use super::ShippingDirective;
use crate::error::RaftError;
use crate::message::AppendEntriesResponse;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::message::Heartbeat;
use crate::message::MembershipConfig;
use crate::message::Message;
use crate::message::VoteResponse;
use crate::replication::FollowerProgress;
use crate::storage::RaftLog;
use crate::types::LogId;
use crate::types::Update;
use crate::AppData;
use crate::NodeId;

pub(super) fn handle<D, L>(
    state: &RaftState,
    msg: Message<D>,
    progress: &BTreeMap<NodeId, FollowerProgress>,
    log: &L,
) -> Result<Outcome<D>, RaftError>
where
    D: AppData,
    L: RaftLog<D>,
{
    match msg {
        Message::NewEntry(req) => Ok(append_payloads(state, vec![EntryPayload::Normal(req.content)])),
        Message::NewEntryBatch(batch) => Ok(append_payloads(
            state,
            batch.contents.into_iter().map(EntryPayload::Normal).collect(),
        )),

        Message::AppendEntriesResponse(resp) => append_entries_response(state, resp, progress, log),

        Message::HeartbeatResponse(resp) => {
            if resp.term > state.current_term {
                return Ok(step_down(resp.term));
            }
            Ok(Outcome::default())
        }

        Message::VoteRequest(req) => {
            // An established leader never grants votes; it yields only to a
            // proven leader of a newer term, not to a mere candidacy.
            let mut outcome = Outcome::default();
            outcome.send.push((
                req.candidate,
                Message::VoteResponse(VoteResponse {
                    cluster: state.cluster,
                    from: state.id,
                    term: state.current_term,
                    granted: false,
                }),
            ));
            Ok(outcome)
        }

        Message::AppendEntries(ref req) if req.leader_term > state.current_term => {
            let mut outcome = follower::handle(state, msg, log)?;
            outcome.next_role = Some(Role::Follower);
            Ok(outcome)
        }
        Message::Heartbeat(ref hb) if hb.leader_term > state.current_term => {
            let mut outcome = follower::handle(state, msg, log)?;
            outcome.next_role = Some(Role::Follower);
            Ok(outcome)
        }
        Message::AppendEntries(ref req) if req.leader_term == state.current_term => {
            // Election safety guarantees at most one leader per term; a
            // same-term rival indicates a cluster identity mixup.
            error!(rival = req.leader, term = req.leader_term, "second leader claim in the current term");
            Ok(Outcome::default())
        }
        Message::Heartbeat(ref hb) if hb.leader_term == state.current_term => {
            error!(rival = hb.leader, term = hb.leader_term, "second leader claim in the current term");
            Ok(Outcome::default())
        }
        // From a stale term; the follower path responds with the current
        // term, deposing the sender.
        Message::AppendEntries(_) | Message::Heartbeat(_) => follower::handle(state, msg, log),

        Message::VoteResponse(_) | Message::LogCompactionInfo(_) => Ok(Outcome::default()),
    }
}

/// Append client-submitted payloads to the local log and ship them.
fn append_payloads<D: AppData>(state: &RaftState, payloads: Vec<EntryPayload<D>>) -> Outcome<D> {
    if payloads.is_empty() {
        return Outcome::default();
    }
    let mut entries = Vec::with_capacity(payloads.len());
    let mut index = state.last_log_index;
    for payload in payloads {
        index += 1;
        entries.push(Entry {
            log_id: LogId::new(state.current_term, index),
            payload,
        });
    }

    let mut outcome = Outcome {
        log: vec![LogDirective::Append { entries }],
        shipping: vec![ShippingDirective::Appended { last_index: index }],
        ..Default::default()
    };
    apply_sole_voter_commit(state, index, &mut outcome);
    outcome
}

/// Track a follower's acknowledgement and advance the commit index when a
/// majority of voters holds an entry from the current term (§5.3, §5.4.2).
fn append_entries_response<D, L>(
    state: &RaftState,
    resp: AppendEntriesResponse,
    progress: &BTreeMap<NodeId, FollowerProgress>,
    log: &L,
) -> Result<Outcome<D>, RaftError>
where
    D: AppData,
    L: RaftLog<D>,
{
    if resp.term > state.current_term {
        return Ok(step_down(resp.term));
    }
    if resp.term < state.current_term {
        return Ok(Outcome::default());
    }

    let mut outcome = Outcome::default();
    outcome.shipping.push(ShippingDirective::Progress {
        follower: resp.from,
        success: resp.success,
        match_index: resp.match_index,
        append_index: resp.append_index,
    });
    if !resp.success {
        return Ok(outcome);
    }

    let new_commit = calculate_new_commit_index(state, progress, resp.from, resp.match_index);
    if new_commit > state.commit_index {
        // Only an entry of the leader's own term may be committed by
        // counting replicas; earlier-term entries commit with it as prefix.
        if log.term_at(new_commit)? == Some(state.current_term) {
            debug!(commit_index = new_commit, "majority replication, advancing commit index");
            outcome.commit_to = Some(new_commit);
            outcome.shipping.push(ShippingDirective::UpdateContext {
                context: LeaderContext {
                    term: state.current_term,
                    commit_index: new_commit,
                },
            });
        }
    }
    Ok(outcome)
}

/// The highest index held by a majority of the voting set.
///
/// The leader's own log counts; the acknowledging follower's fresh match
/// index is taken over whatever the progress map still records for it.
fn calculate_new_commit_index(
    state: &RaftState,
    progress: &BTreeMap<NodeId, FollowerProgress>,
    from: NodeId,
    from_match: u64,
) -> u64 {
    let mut indices: Vec<u64> = state
        .membership
        .voting
        .iter()
        .map(|id| {
            if *id == state.id {
                state.last_log_index
            } else if *id == from {
                from_match
            } else {
                progress.get(id).map(|p| p.match_index).unwrap_or(0)
            }
        })
        .collect();
    indices.sort_unstable_by(|a, b| b.cmp(a));
    let majority = state.membership.majority_size();
    indices.get(majority - 1).copied().unwrap_or(0)
}

/// Broadcast a liveness probe to every replication target.
pub(super) fn broadcast_heartbeat<D, L>(state: &RaftState, log: &L) -> Result<Outcome<D>, RaftError>
where
    D: AppData,
    L: RaftLog<D>,
{
    let commit_index_term = log.term_at(state.commit_index)?.unwrap_or(0);
    let hb = Heartbeat {
        cluster: state.cluster,
        leader: state.id,
        leader_term: state.current_term,
        commit_index: state.commit_index,
        commit_index_term,
    };
    let send = state
        .membership
        .all_targets()
        .into_iter()
        .filter(|id| *id != state.id)
        .map(|id| (id, Message::Heartbeat(hb.clone())))
        .collect();
    Ok(Outcome {
        send,
        renew_heartbeat_timer: true,
        ..Default::default()
    })
}

/// Begin a two-phase membership change by appending the joint config.
///
/// The joint entry keeps the old voting set authoritative while the new
/// members catch up; finalization follows once the entry commits and the
/// joiners are within the configured lag.
pub(super) fn change_membership<D: AppData>(state: &RaftState, members: BTreeSet<NodeId>) -> Result<Outcome<D>, RaftError> {
    let joint = MembershipConfig {
        voting: state.membership.voting.clone(),
        target: Some(members),
    };
    debug!(config = ?joint, "appending joint membership entry");
    Ok(append_membership(state, joint))
}

/// Commit the second phase: the target set becomes the voting set.
pub(super) fn finalize_membership<D: AppData>(state: &RaftState) -> Result<Outcome<D>, RaftError> {
    if !state.membership.in_transition() {
        return Ok(Outcome::default());
    }
    let config = state.membership.finalized();
    debug!(config = ?config, "appending finalized membership entry");
    Ok(append_membership(state, config))
}

/// Back out of an uncommittable change: re-append the old voting set alone.
pub(super) fn abort_membership<D: AppData>(state: &RaftState) -> Result<Outcome<D>, RaftError> {
    if !state.membership.in_transition() {
        return Ok(Outcome::default());
    }
    let config = MembershipConfig {
        voting: state.membership.voting.clone(),
        target: None,
    };
    debug!(config = ?config, "appending membership abort entry");
    Ok(append_membership(state, config))
}

fn append_membership<D: AppData>(state: &RaftState, config: MembershipConfig) -> Outcome<D> {
    let index = state.last_log_index + 1;
    let entry = Entry {
        log_id: LogId::new(state.current_term, index),
        payload: EntryPayload::<D>::Membership(config.clone()),
    };
    let mut outcome = Outcome {
        membership: Update::Update(config),
        log: vec![LogDirective::Append { entries: vec![entry] }],
        shipping: vec![ShippingDirective::Appended { last_index: index }],
        ..Default::default()
    };
    apply_sole_voter_commit(state, index, &mut outcome);
    outcome
}

/// A node alone in its voting set commits its own appends immediately.
fn apply_sole_voter_commit<D: AppData>(state: &RaftState, index: u64, outcome: &mut Outcome<D>) {
    let mut me = BTreeSet::new();
    me.insert(state.id);
    if state.membership.is_majority(&me) {
        outcome.commit_to = Some(index);
        outcome.shipping.push(ShippingDirective::UpdateContext {
            context: LeaderContext {
                term: state.current_term,
                commit_index: index,
            },
        });
    }
}

/// Yield leadership to a newer term.
fn step_down<D: AppData>(term: u64) -> Outcome<D> {
    debug!(term, "observed a newer term, stepping down");
    Outcome {
        next_role: Some(Role::Follower),
        term: Update::Update(term),
        voted_for: Update::Update(None),
        leader: Update::Update(None),
        renew_election_timer: true,
        ..Default::default()
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use maplit::btreeset;

    use super::*;
    use crate::storage::InMemoryLog;
    use crate::types::ClusterId;

    fn leader_state(last: LogId, commit: u64) -> RaftState {
        RaftState {
            id: 1,
            cluster: ClusterId(0),
            current_term: last.term,
            voted_for: Some(1),
            leader: Some(1),
            commit_index: commit,
            last_log_index: last.index,
            last_log_term: last.term,
            membership: MembershipConfig {
                voting: btreeset![1, 2, 3],
                target: None,
            },
        }
    }

    fn log_of(terms: &[u64]) -> InMemoryLog<u64> {
        let mut log = InMemoryLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(Entry {
                log_id: LogId::new(*term, i as u64 + 1),
                payload: EntryPayload::Normal(i as u64),
            })
            .unwrap();
        }
        log
    }

    fn ack(from: u64, term: u64, match_index: u64) -> AppendEntriesResponse {
        AppendEntriesResponse {
            cluster: ClusterId(0),
            from,
            term,
            success: true,
            match_index,
            append_index: match_index,
        }
    }

    #[test]
    fn submissions_append_at_the_current_term() {
        let state = leader_state(LogId::new(3, 5), 5);
        let outcome = append_payloads(&state, vec![EntryPayload::Normal(10u64), EntryPayload::Normal(11)]);

        match &outcome.log[0] {
            LogDirective::Append { entries } => {
                assert_eq!(entries.iter().map(|e| e.index()).collect::<Vec<_>>(), vec![6, 7]);
                assert!(entries.iter().all(|e| e.term() == 3));
            }
            other => panic!("expected append, got {other:?}"),
        }
        assert_eq!(outcome.shipping, vec![ShippingDirective::Appended { last_index: 7 }]);
        assert_eq!(outcome.commit_to, None, "a three voter cluster needs acknowledgements");
    }

    #[test]
    fn majority_acknowledgement_advances_commit() {
        let state = leader_state(LogId::new(3, 5), 3);
        let log = log_of(&[1, 1, 2, 3, 3]);
        let progress = btreemap! {
            2 => FollowerProgress { match_index: 3, append_index: 3 },
            3 => FollowerProgress { match_index: 3, append_index: 3 },
        };

        // Follower 2 confirms through index 5; leader holds 5; majority at 5.
        let outcome = append_entries_response(&state, ack(2, 3, 5), &progress, &log).unwrap();
        assert_eq!(outcome.commit_to, Some(5));
        assert!(outcome
            .shipping
            .contains(&ShippingDirective::UpdateContext {
                context: LeaderContext { term: 3, commit_index: 5 }
            }));
    }

    #[test]
    fn entries_from_prior_terms_are_never_committed_by_count() {
        // Index 4 is from term 2, the leader leads term 3 (§5.4.2).
        let mut state = leader_state(LogId::new(3, 5), 3);
        state.last_log_index = 4;
        state.current_term = 3;
        let log = log_of(&[1, 1, 2, 2]);
        let progress = btreemap! {
            2 => FollowerProgress { match_index: 3, append_index: 3 },
            3 => FollowerProgress { match_index: 3, append_index: 3 },
        };

        let outcome = append_entries_response(&state, ack(2, 3, 4), &progress, &log).unwrap();
        assert_eq!(outcome.commit_to, None);
        assert!(
            outcome.shipping.contains(&ShippingDirective::Progress {
                follower: 2,
                success: true,
                match_index: 4,
                append_index: 4,
            }),
            "progress is still recorded"
        );
    }

    #[test]
    fn newer_term_acknowledgement_deposes_the_leader() {
        let state = leader_state(LogId::new(3, 5), 3);
        let log = log_of(&[1, 1, 2, 3, 3]);
        let outcome = append_entries_response(&state, ack(2, 4, 0), &BTreeMap::new(), &log).unwrap();
        assert_eq!(outcome.next_role, Some(Role::Follower));
        assert_eq!(outcome.term, Update::Update(4));
    }

    #[test]
    fn heartbeats_go_to_every_replication_target() {
        let mut state = leader_state(LogId::new(3, 5), 4);
        state.membership.target = Some(btreeset![1, 2, 3, 4]);
        let log = log_of(&[1, 1, 2, 3, 3]);

        let outcome = broadcast_heartbeat::<u64, _>(&state, &log).unwrap();
        let targets: BTreeSet<u64> = outcome.send.iter().map(|(id, _)| *id).collect();
        assert_eq!(targets, btreeset![2, 3, 4]);
        match &outcome.send[0].1 {
            Message::Heartbeat(hb) => {
                assert_eq!(hb.commit_index, 4);
                assert_eq!(hb.commit_index_term, 3);
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
        assert!(outcome.renew_heartbeat_timer);
    }

    #[test]
    fn membership_change_appends_the_joint_config() {
        let state = leader_state(LogId::new(3, 5), 5);
        let outcome = change_membership::<u64>(&state, btreeset![1, 2, 4]).unwrap();

        let expected = MembershipConfig {
            voting: btreeset![1, 2, 3],
            target: Some(btreeset![1, 2, 4]),
        };
        assert_eq!(outcome.membership, Update::Update(expected.clone()));
        match &outcome.log[0] {
            LogDirective::Append { entries } => {
                assert_eq!(entries[0].payload, EntryPayload::Membership(expected));
                assert_eq!(entries[0].log_id, LogId::new(3, 6));
            }
            other => panic!("expected append, got {other:?}"),
        }
    }

    #[test]
    fn finalize_moves_the_target_set_into_voting() {
        let mut state = leader_state(LogId::new(3, 6), 6);
        state.membership.target = Some(btreeset![1, 2, 4]);
        let outcome = finalize_membership::<u64>(&state).unwrap();

        let expected = MembershipConfig {
            voting: btreeset![1, 2, 4],
            target: None,
        };
        assert_eq!(outcome.membership, Update::Update(expected));

        // Without a transition in flight there is nothing to finalize.
        state.membership.target = None;
        let outcome = finalize_membership::<u64>(&state).unwrap();
        assert!(outcome.log.is_empty());
    }

    #[test]
    fn sole_voter_commits_its_own_appends() {
        let mut state = leader_state(LogId::new(3, 5), 5);
        state.membership.voting = btreeset![1];
        let outcome = append_payloads(&state, vec![EntryPayload::Normal(10u64)]);
        assert_eq!(outcome.commit_to, Some(6));
    }
}
