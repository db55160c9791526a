//! Leader-side log shipping.
//!
//! The shipping manager keeps one cursor per replication target and turns
//! append and acknowledgement events into outbound `AppendEntries` shipments.
//! It holds a [`LeaderContext`] snapshot so every shipment is stamped with
//! the term and commit index the leader had when the shipment was cut.
//!
//! Flow control is a per-follower in-flight window: once `max_inflight`
//! entries are awaiting acknowledgement, shipping to that follower pauses
//! until progress arrives. A refusal moves the cursor back to the follower's
//! hinted match index and retransmits from the entry after it; entries are
//! never skipped.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::debug;
use tracing::trace;

use crate::engine::LeaderContext;
use crate::message::AppendEntriesRequest;
use crate::message::LogCompactionInfo;
use crate::message::Message;
use crate::storage::RaftLog;
use crate::storage::StorageResult;
use crate::types::ClusterId;
use crate::AppData;
use crate::NodeId;

/// A follower's acknowledged replication state, as the leader last heard it.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct FollowerProgress {
    /// The highest index confirmed to match the leader's log.
    pub(crate) match_index: u64,
    /// The highest index physically present in the follower's log.
    pub(crate) append_index: u64,
}

/// The shipping cursor for one replication target.
#[derive(Debug)]
struct LogShipper {
    /// The next index to ship.
    next_index: u64,
    progress: FollowerProgress,
}

impl LogShipper {
    fn in_flight(&self) -> u64 {
        (self.next_index - 1).saturating_sub(self.progress.match_index)
    }
}

/// Shipping state for all replication targets of a leader.
pub(crate) struct LogShippingManager {
    id: NodeId,
    cluster: ClusterId,
    max_payload: u64,
    max_inflight: u64,
    context: Option<LeaderContext>,
    shippers: BTreeMap<NodeId, LogShipper>,
}

impl LogShippingManager {
    pub(crate) fn new(id: NodeId, cluster: ClusterId, max_payload: u64, max_inflight: u64) -> Self {
        Self {
            id,
            cluster,
            max_payload,
            max_inflight,
            context: None,
            shippers: BTreeMap::new(),
        }
    }

    /// Begin shipping to `targets` under the given context.
    ///
    /// Cursors start optimistically at the leader's append index; a lagging
    /// follower walks the cursor back through refusals.
    pub(crate) fn start(&mut self, context: LeaderContext, targets: &BTreeSet<NodeId>, append_index: u64) {
        self.context = Some(context);
        self.shippers.clear();
        for target in targets {
            if *target != self.id {
                self.add_target(*target, append_index);
            }
        }
    }

    /// Stop all shipping; the node is no longer leader.
    pub(crate) fn stop(&mut self) {
        self.context = None;
        self.shippers.clear();
    }

    pub(crate) fn is_active(&self) -> bool {
        self.context.is_some()
    }

    pub(crate) fn set_context(&mut self, context: LeaderContext) {
        self.context = Some(context);
    }

    pub(crate) fn add_target(&mut self, target: NodeId, append_index: u64) {
        self.shippers.entry(target).or_insert(LogShipper {
            next_index: append_index + 1,
            progress: FollowerProgress::default(),
        });
    }

    pub(crate) fn remove_target(&mut self, target: &NodeId) {
        self.shippers.remove(target);
    }

    /// Retain only the targets in `targets`, adding any new ones.
    pub(crate) fn retain_targets(&mut self, targets: &BTreeSet<NodeId>, append_index: u64) {
        self.shippers.retain(|id, _| targets.contains(id));
        for target in targets {
            if *target != self.id {
                self.add_target(*target, append_index);
            }
        }
    }

    /// The acknowledged progress of every target, for commit arithmetic.
    pub(crate) fn progress(&self) -> BTreeMap<NodeId, FollowerProgress> {
        self.shippers.iter().map(|(id, s)| (*id, s.progress)).collect()
    }

    /// The leader appended local entries through `last_index`; ship them.
    pub(crate) fn on_appended<D, L>(&mut self, last_index: u64, log: &L) -> StorageResult<Vec<(NodeId, Message<D>)>>
    where
        D: AppData,
        L: RaftLog<D>,
    {
        trace!(last_index, "shipping appended entries");
        self.ship_all(log)
    }

    /// A follower acknowledged or refused a shipment.
    pub(crate) fn on_progress<D, L>(
        &mut self,
        follower: NodeId,
        success: bool,
        match_index: u64,
        append_index: u64,
        log: &L,
    ) -> StorageResult<Vec<(NodeId, Message<D>)>>
    where
        D: AppData,
        L: RaftLog<D>,
    {
        let shipper = match self.shippers.get_mut(&follower) {
            Some(shipper) => shipper,
            // Acknowledgement from a node no longer replicated to.
            None => return Ok(Vec::new()),
        };
        if success {
            shipper.progress.match_index = shipper.progress.match_index.max(match_index);
            shipper.progress.append_index = append_index;
        } else {
            debug!(follower, match_index, "shipment refused, walking the cursor back");
            shipper.progress.match_index = shipper.progress.match_index.max(match_index);
            shipper.progress.append_index = append_index;
            shipper.next_index = match_index + 1;
        }
        let mut out = Vec::new();
        self.ship_to(follower, log, &mut out)?;
        Ok(out)
    }

    fn ship_all<D, L>(&mut self, log: &L) -> StorageResult<Vec<(NodeId, Message<D>)>>
    where
        D: AppData,
        L: RaftLog<D>,
    {
        let targets: Vec<NodeId> = self.shippers.keys().copied().collect();
        let mut out = Vec::new();
        for target in targets {
            self.ship_to(target, log, &mut out)?;
        }
        Ok(out)
    }

    fn ship_to<D, L>(&mut self, target: NodeId, log: &L, out: &mut Vec<(NodeId, Message<D>)>) -> StorageResult<()>
    where
        D: AppData,
        L: RaftLog<D>,
    {
        let context = match self.context {
            Some(context) => context,
            None => return Ok(()),
        };
        let shipper = match self.shippers.get_mut(&target) {
            Some(shipper) => shipper,
            None => return Ok(()),
        };

        let append_index = log.append_index();
        if shipper.next_index > append_index {
            return Ok(());
        }
        let in_flight = shipper.in_flight();
        if in_flight >= self.max_inflight {
            trace!(target, in_flight, "in-flight window full, shipping paused");
            return Ok(());
        }

        // The follower needs entries (or the term of the entry preceding
        // them) which are pruned away; it must catch up through an
        // out-of-band store copy.
        let prev = shipper.next_index - 1;
        let pruned = shipper.next_index < log.first_index();
        let prev_log_term = match log.term_at(prev)? {
            Some(term) if !pruned => term,
            _ => {
                debug!(target, prev, "follower needs pruned entries");
                out.push((
                    target,
                    Message::LogCompactionInfo(LogCompactionInfo {
                        cluster: self.cluster,
                        leader: self.id,
                        leader_term: context.term,
                        prev_index: log.first_index() - 1,
                    }),
                ));
                return Ok(());
            }
        };

        let budget = self
            .max_payload
            .min(self.max_inflight - in_flight)
            .min(append_index - shipper.next_index + 1);
        let entries = log.range(shipper.next_index, shipper.next_index + budget)?;
        if entries.is_empty() {
            return Ok(());
        }
        shipper.next_index += entries.len() as u64;
        trace!(target, prev, count = entries.len(), "shipping entries");
        out.push((
            target,
            Message::AppendEntries(AppendEntriesRequest {
                cluster: self.cluster,
                leader_term: context.term,
                leader: self.id,
                prev_log_index: prev,
                prev_log_term,
                entries,
                leader_commit: context.commit_index,
            }),
        ));
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
