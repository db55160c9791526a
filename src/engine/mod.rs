//! The role state machine.
//!
//! The engine is the decision making half of a node: given the node's current
//! state, its role and one inbound event, it computes an [`Outcome`]
//! describing every effect the event should have. It performs no IO and
//! mutates nothing; the core task owns applying outcomes.

mod candidate;
mod follower;
mod leader;
pub(crate) mod outcome;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::debug;

use crate::error::RaftError;
use crate::message::MembershipConfig;
use crate::message::Message;
use crate::message::VoteRequest;
use crate::replication::FollowerProgress;
use crate::storage::RaftLog;
use crate::types::ClusterId;
use crate::types::Update;
use crate::AppData;
use crate::NodeId;

pub(crate) use self::outcome::LeaderContext;
pub(crate) use self::outcome::LogDirective;
pub(crate) use self::outcome::Outcome;
pub(crate) use self::outcome::ShippingDirective;

/// The volatile and durable-mirrored state of a node, as the engine sees it.
#[derive(Debug, Clone)]
pub(crate) struct RaftState {
    pub(crate) id: NodeId,
    pub(crate) cluster: ClusterId,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) leader: Option<NodeId>,
    pub(crate) commit_index: u64,
    pub(crate) last_log_index: u64,
    pub(crate) last_log_term: u64,
    pub(crate) membership: MembershipConfig,
}

/// The role a node occupies, with the volatile state owned by that role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Role {
    Follower,
    Candidate { granted: BTreeSet<NodeId> },
    Leader,
}

impl Role {
    pub(crate) fn tag(&self) -> crate::metrics::RoleTag {
        match self {
            Role::Follower => crate::metrics::RoleTag::Follower,
            Role::Candidate { .. } => crate::metrics::RoleTag::Candidate,
            Role::Leader => crate::metrics::RoleTag::Leader,
        }
    }
}

/// One inbound event for the engine to decide on.
#[derive(Debug)]
pub(crate) enum Input<D: AppData> {
    Message(Message<D>),
    ElectionTimeout,
    HeartbeatTimeout,
    /// A validated request to move the voting set to `members`.
    ChangeMembership { members: BTreeSet<NodeId> },
    /// The in-flight membership change is committed and caught up; finalize it.
    FinalizeMembership,
    /// A joiner missed its catch-up deadline; restore the old configuration.
    AbortMembership,
}

/// The decision making half of a Raft node.
pub(crate) struct Engine {
    pub(crate) state: RaftState,
    pub(crate) role: Role,
    busy: AtomicBool,
}

impl Engine {
    pub(crate) fn new(state: RaftState, role: Role) -> Self {
        Self {
            state,
            role,
            busy: AtomicBool::new(false),
        }
    }

    /// Decide on one inbound event.
    ///
    /// Handling is expected to be strictly serialized by the caller; a second
    /// handle arriving while one is in progress fails fast with
    /// [`RaftError::ConcurrentHandle`] instead of risking interleaved
    /// decisions over the same state.
    pub(crate) fn handle<D, L>(
        &self,
        input: Input<D>,
        progress: &BTreeMap<NodeId, FollowerProgress>,
        log: &L,
    ) -> Result<Outcome<D>, RaftError>
    where
        D: AppData,
        L: RaftLog<D>,
    {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(RaftError::ConcurrentHandle);
        }
        let res = self.dispatch(input, progress, log);
        self.busy.store(false, Ordering::Release);
        res
    }

    fn dispatch<D, L>(
        &self,
        input: Input<D>,
        progress: &BTreeMap<NodeId, FollowerProgress>,
        log: &L,
    ) -> Result<Outcome<D>, RaftError>
    where
        D: AppData,
        L: RaftLog<D>,
    {
        let state = &self.state;
        match (input, &self.role) {
            (Input::Message(msg), Role::Follower) => follower::handle(state, msg, log),
            (Input::Message(msg), Role::Candidate { granted }) => candidate::handle(state, granted, msg, log),
            (Input::Message(msg), Role::Leader) => leader::handle(state, msg, progress, log),

            (Input::ElectionTimeout, Role::Follower) | (Input::ElectionTimeout, Role::Candidate { .. }) => {
                Ok(start_election(state))
            }
            (Input::ElectionTimeout, Role::Leader) => Ok(Outcome::default()),

            (Input::HeartbeatTimeout, Role::Leader) => leader::broadcast_heartbeat(state, log),
            (Input::HeartbeatTimeout, _) => Ok(Outcome::default()),

            (Input::ChangeMembership { members }, Role::Leader) => leader::change_membership(state, members),
            (Input::ChangeMembership { .. }, _) => {
                debug!("membership change input while not leader, ignoring");
                Ok(Outcome::default())
            }
            (Input::FinalizeMembership, Role::Leader) => leader::finalize_membership(state),
            (Input::FinalizeMembership, _) => Ok(Outcome::default()),
            (Input::AbortMembership, Role::Leader) => leader::abort_membership(state),
            (Input::AbortMembership, _) => Ok(Outcome::default()),
        }
    }
}

/// Begin a new election: bump the term, vote for self, solicit the voters.
///
/// A node which is the sole voter wins on the spot and skips the vote
/// round-trip entirely.
pub(super) fn start_election<D: AppData>(state: &RaftState) -> Outcome<D> {
    let term = state.current_term + 1;
    debug!(term, "election timeout, becoming candidate");

    let mut granted = BTreeSet::new();
    granted.insert(state.id);
    if state.membership.is_majority(&granted) {
        return become_leader(state, term, Update::Update(Some(state.id)));
    }

    let request = VoteRequest {
        cluster: state.cluster,
        term,
        candidate: state.id,
        last_log_index: state.last_log_index,
        last_log_term: state.last_log_term,
    };
    let send = state
        .membership
        .voting
        .iter()
        .filter(|id| **id != state.id)
        .map(|id| (*id, Message::VoteRequest(request.clone())))
        .collect();

    Outcome {
        next_role: Some(Role::Candidate { granted }),
        term: Update::Update(term),
        voted_for: Update::Update(Some(state.id)),
        leader: Update::Update(None),
        send,
        renew_election_timer: true,
        ..Default::default()
    }
}

/// Assume leadership for `term`.
///
/// The new leader immediately appends a blank entry in its own term; its
/// commitment is what allows entries from prior terms to be considered
/// committed (§5.4.2).
pub(super) fn become_leader<D: AppData>(state: &RaftState, term: u64, voted_for: Update<Option<NodeId>>) -> Outcome<D> {
    debug!(term, "transitioning to leader");
    let blank_index = state.last_log_index + 1;
    let blank = crate::message::Entry {
        log_id: crate::types::LogId::new(term, blank_index),
        payload: crate::message::EntryPayload::<D>::Blank,
    };

    // With no other voters the blank entry is committed by its own append.
    let sole_voter = {
        let mut me = BTreeSet::new();
        me.insert(state.id);
        state.membership.is_majority(&me)
    };
    let commit_to = if sole_voter { Some(blank_index) } else { None };

    Outcome {
        next_role: Some(Role::Leader),
        term: if term == state.current_term { Update::Ignore } else { Update::Update(term) },
        voted_for,
        leader: Update::Update(Some(state.id)),
        commit_to,
        log: vec![LogDirective::Append { entries: vec![blank] }],
        shipping: vec![
            ShippingDirective::UpdateContext {
                context: LeaderContext {
                    term,
                    commit_index: commit_to.unwrap_or(state.commit_index),
                },
            },
            ShippingDirective::Appended { last_index: blank_index },
        ],
        renew_heartbeat_timer: true,
        ..Default::default()
    }
}
