//! The result of handling one inbound event.
//!
//! Handlers never mutate node state directly. They compute an `Outcome`
//! describing every effect the event should have, and the core applies it in
//! one pass: durable state first, then log changes, then volatile state, then
//! outbound traffic. An error while computing leaves the node exactly as it
//! was.

use crate::message::Entry;
use crate::message::MembershipConfig;
use crate::message::Message;
use crate::types::Update;
use crate::AppData;
use crate::NodeId;

/// A change to apply to the node's log.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LogDirective<D: AppData> {
    /// Delete all entries from `from` (inclusive) upward.
    TruncateFrom { from: u64 },
    /// Append the given entries after the current append index.
    Append { entries: Vec<Entry<D>> },
}

/// Replication progress an outcome reports to the log shipping manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ShippingDirective {
    /// The leader appended local entries up to `last_index`; ship them.
    Appended { last_index: u64 },
    /// A follower acknowledged or refused a shipment.
    Progress {
        follower: NodeId,
        success: bool,
        match_index: u64,
        append_index: u64,
    },
    /// The leader's shared context changed; stamp future shipments with it.
    UpdateContext { context: LeaderContext },
}

/// The slice of leader state replication decisions are made against.
///
/// Held by the shipping side so shipments carry the term and commit index the
/// leader had when the shipment was cut, not whatever they happen to be when
/// the shipment is finally sent.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct LeaderContext {
    pub(crate) term: u64,
    pub(crate) commit_index: u64,
}

/// Everything one event handling pass decided.
///
/// Fields left at their defaults mean "no change". The core applies the
/// fields in declaration order; `term`, `voted_for` and `membership` are
/// persisted to the state store before anything else takes effect.
pub(crate) struct Outcome<D: AppData> {
    /// Transition to this role after applying the rest of the outcome.
    pub(crate) next_role: Option<super::Role>,
    /// Update the node's current term.
    pub(crate) term: Update<u64>,
    /// Update the node's vote for the current term.
    pub(crate) voted_for: Update<Option<NodeId>>,
    /// Update the node's view of who leads the cluster.
    pub(crate) leader: Update<Option<NodeId>>,
    /// Update the node's membership configuration.
    pub(crate) membership: Update<MembershipConfig>,
    /// Advance the commit index to this value.
    pub(crate) commit_to: Option<u64>,
    /// Log changes, applied in order.
    pub(crate) log: Vec<LogDirective<D>>,
    /// Outbound messages, sent after all state changes have been applied.
    pub(crate) send: Vec<(NodeId, Message<D>)>,
    /// Progress reports for the log shipping manager.
    pub(crate) shipping: Vec<ShippingDirective>,
    /// Re-arm the election timeout for a fresh randomized delay.
    pub(crate) renew_election_timer: bool,
    /// Re-arm the heartbeat timeout.
    pub(crate) renew_heartbeat_timer: bool,
}

impl<D: AppData> Default for Outcome<D> {
    fn default() -> Self {
        Self {
            next_role: None,
            term: Update::Ignore,
            voted_for: Update::Ignore,
            leader: Update::Ignore,
            membership: Update::Ignore,
            commit_to: None,
            log: Vec::new(),
            send: Vec::new(),
            shipping: Vec::new(),
            renew_election_timer: false,
            renew_heartbeat_timer: false,
        }
    }
}

impl<D: AppData> Outcome<D> {
    /// Whether applying this outcome requires a hard state write.
    pub(crate) fn changes_hard_state(&self) -> bool {
        !self.term.is_ignore() || !self.voted_for.is_ignore() || !self.membership.is_ignore()
    }
}
