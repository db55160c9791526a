//! Leader-side tracking of a two-phase membership change.
//!
//! Phase one appends the joint configuration: the old voting set stays
//! authoritative while joining members receive the log. Phase two appends
//! the finalized configuration once the joint entry has committed and every
//! joiner has caught up to within the configured lag of the leader's log.
//! A joiner which fails to catch up in time aborts the change and the old
//! configuration is restored.
//!
//! The manager only tracks the change; the entries themselves are appended
//! through the engine and replicated like any other entry.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use crate::error::ChangeMembershipError;
use crate::replication::FollowerProgress;
use crate::NodeId;

/// The channel on which the outcome of a membership change is reported.
pub(crate) type ChangeResponder = oneshot::Sender<Result<(), ChangeMembershipError>>;

/// What the core should feed the engine next, if anything.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MembershipAction {
    /// The joint entry committed and the joiners are caught up.
    Finalize,
    /// A joiner missed its catch-up deadline; restore the old configuration.
    Abort,
    /// The change ran to completion (or aborted); prune replication targets
    /// against the now-authoritative configuration.
    Completed,
}

enum Phase {
    /// The joint entry is in the log, waiting on commit and catch-up.
    Joint {
        joint_index: u64,
        joiners: BTreeSet<NodeId>,
        deadline: Instant,
    },
    /// A finalize entry was requested; `index` is known once appended.
    Finalizing { index: Option<u64> },
    /// An abort entry was requested. `laggard` names the joiner that missed
    /// its deadline; `None` when the joint entry itself failed to commit.
    Aborting {
        index: Option<u64>,
        laggard: Option<NodeId>,
    },
}

struct Pending {
    /// The caller awaiting the outcome; an inherited change has none.
    tx: Option<ChangeResponder>,
    phase: Phase,
}

/// Tracks at most one in-flight membership change.
pub(crate) struct MembershipManager {
    catch_up_lag: u64,
    catch_up_timeout: Duration,
    pending: Option<Pending>,
}

impl MembershipManager {
    pub(crate) fn new(catch_up_lag: u64, catch_up_timeout: Duration) -> Self {
        Self {
            catch_up_lag,
            catch_up_timeout,
            pending: None,
        }
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Record a change whose joint entry was just appended at `joint_index`.
    pub(crate) fn begin(&mut self, tx: ChangeResponder, joiners: BTreeSet<NodeId>, joint_index: u64, now: Instant) {
        debug!(joint_index, ?joiners, "membership change under way");
        self.pending = Some(Pending {
            tx: Some(tx),
            phase: Phase::Joint {
                joint_index,
                joiners,
                deadline: now + self.catch_up_timeout,
            },
        });
    }

    /// Track a joint configuration inherited from a deposed leader.
    ///
    /// The change has no caller to notify; it is driven to finalization (or
    /// abort) exactly as a locally proposed one. `committed_by` is the index
    /// whose commitment proves the joint entry is committed as its prefix.
    pub(crate) fn resume(&mut self, joiners: BTreeSet<NodeId>, committed_by: u64, now: Instant) {
        debug!(committed_by, ?joiners, "resuming inherited membership change");
        self.pending = Some(Pending {
            tx: None,
            phase: Phase::Joint {
                joint_index: committed_by,
                joiners,
                deadline: now + self.catch_up_timeout,
            },
        });
    }

    /// The finalize entry was appended at `index`.
    pub(crate) fn note_finalize_appended(&mut self, index: u64) {
        if let Some(Pending {
            phase: Phase::Finalizing { index: slot },
            ..
        }) = &mut self.pending
        {
            *slot = Some(index);
        }
    }

    /// The abort entry was appended at `index`.
    pub(crate) fn note_abort_appended(&mut self, index: u64) {
        if let Some(Pending {
            phase: Phase::Aborting { index: slot, .. },
            ..
        }) = &mut self.pending
        {
            *slot = Some(index);
        }
    }

    /// Re-evaluate the change against fresh commit and replication state.
    ///
    /// Called after every applied outcome; returns at most one action per
    /// phase transition.
    pub(crate) fn poll(
        &mut self,
        commit_index: u64,
        append_index: u64,
        progress: &BTreeMap<NodeId, FollowerProgress>,
        now: Instant,
    ) -> Option<MembershipAction> {
        let pending = self.pending.as_mut()?;
        match &pending.phase {
            Phase::Joint {
                joint_index,
                joiners,
                deadline,
            } => {
                let caught_up = joiners
                    .iter()
                    .all(|id| progress.get(id).map(|p| p.match_index).unwrap_or(0) + self.catch_up_lag >= append_index);
                if caught_up && commit_index >= *joint_index {
                    pending.phase = Phase::Finalizing { index: None };
                    return Some(MembershipAction::Finalize);
                }
                if now >= *deadline {
                    let laggard = joiners
                        .iter()
                        .min_by_key(|id| progress.get(id).map(|p| p.match_index).unwrap_or(0))
                        .copied();
                    match laggard {
                        Some(node) => warn!(node, "membership change aborted, joiner missed its catch-up deadline"),
                        None => warn!("membership change aborted, joint entry failed to commit in time"),
                    }
                    pending.phase = Phase::Aborting { index: None, laggard };
                    return Some(MembershipAction::Abort);
                }
                None
            }
            Phase::Finalizing { index: Some(index) } if commit_index >= *index => {
                if let Some(tx) = self.pending.take().and_then(|p| p.tx) {
                    let _ = tx.send(Ok(()));
                }
                Some(MembershipAction::Completed)
            }
            Phase::Aborting {
                index: Some(index),
                laggard,
            } if commit_index >= *index => {
                let err = match laggard {
                    Some(node) => ChangeMembershipError::CatchUpTimeout(*node),
                    None => ChangeMembershipError::JointCommitTimeout,
                };
                if let Some(tx) = self.pending.take().and_then(|p| p.tx) {
                    let _ = tx.send(Err(err));
                }
                Some(MembershipAction::Completed)
            }
            _ => None,
        }
    }

    /// Fail the in-flight change; the node can no longer drive it.
    pub(crate) fn abandon(&mut self, err: ChangeMembershipError) {
        if let Some(tx) = self.pending.take().and_then(|p| p.tx) {
            let _ = tx.send(Err(err));
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use maplit::btreeset;

    use super::*;

    fn manager() -> MembershipManager {
        MembershipManager::new(2, Duration::from_secs(30))
    }

    fn progress_of(entries: &[(NodeId, u64)]) -> BTreeMap<NodeId, FollowerProgress> {
        entries
            .iter()
            .map(|(id, m)| {
                (*id, FollowerProgress {
                    match_index: *m,
                    append_index: *m,
                })
            })
            .collect()
    }

    #[test]
    fn finalizes_once_committed_and_caught_up() {
        let mut mgr = manager();
        let (tx, mut rx) = oneshot::channel();
        let now = Instant::now();
        mgr.begin(tx, btreeset![4], 10, now);

        // Joint entry committed but the joiner lags too far.
        assert_eq!(mgr.poll(10, 20, &progress_of(&[(4, 5)]), now), None);

        // Within the lag window now.
        assert_eq!(mgr.poll(10, 20, &progress_of(&[(4, 19)]), now), Some(MembershipAction::Finalize));

        // Finalize entry appended at 21, commits.
        mgr.note_finalize_appended(21);
        assert_eq!(mgr.poll(20, 21, &progress_of(&[(4, 19)]), now), None);
        assert_eq!(mgr.poll(21, 21, &progress_of(&[(4, 21)]), now), Some(MembershipAction::Completed));
        assert!(!mgr.in_progress());
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn caught_up_joiner_still_waits_for_the_joint_commit() {
        let mut mgr = manager();
        let (tx, _rx) = oneshot::channel();
        let now = Instant::now();
        mgr.begin(tx, btreeset![4], 10, now);

        assert_eq!(mgr.poll(9, 10, &progress_of(&[(4, 10)]), now), None);
        assert_eq!(mgr.poll(10, 10, &progress_of(&[(4, 10)]), now), Some(MembershipAction::Finalize));
    }

    #[test]
    fn missed_deadline_aborts_and_reports_the_laggard() {
        let mut mgr = manager();
        let (tx, mut rx) = oneshot::channel();
        let now = Instant::now();
        mgr.begin(tx, btreeset![4, 5], 10, now);

        let late = now + Duration::from_secs(31);
        let progress = progress_of(&[(4, 3), (5, 18)]);
        assert_eq!(mgr.poll(10, 20, &progress, late), Some(MembershipAction::Abort));

        mgr.note_abort_appended(21);
        assert_eq!(mgr.poll(21, 21, &progress, late), Some(MembershipAction::Completed));
        match rx.try_recv() {
            Ok(Err(ChangeMembershipError::CatchUpTimeout(4))) => {}
            other => panic!("expected catch-up timeout for node 4, got {other:?}"),
        }
    }

    #[test]
    fn removal_only_change_needs_no_catch_up() {
        let mut mgr = manager();
        let (tx, _rx) = oneshot::channel();
        let now = Instant::now();
        mgr.begin(tx, btreeset![], 10, now);

        assert_eq!(mgr.poll(10, 10, &BTreeMap::new(), now), Some(MembershipAction::Finalize));
    }

    #[test]
    fn resumed_change_finalizes_without_a_responder() {
        let mut mgr = manager();
        let now = Instant::now();
        // A joint config picked up from a deposed leader; commitment of the
        // new leader's entry at 12 proves the joint entry committed.
        mgr.resume(btreeset![4], 12, now);
        assert!(mgr.in_progress());

        assert_eq!(mgr.poll(12, 12, &progress_of(&[(4, 3)]), now), None);
        assert_eq!(mgr.poll(12, 12, &progress_of(&[(4, 12)]), now), Some(MembershipAction::Finalize));

        mgr.note_finalize_appended(13);
        assert_eq!(mgr.poll(13, 13, &progress_of(&[(4, 13)]), now), Some(MembershipAction::Completed));
        assert!(!mgr.in_progress());
    }

    #[test]
    fn uncommittable_joint_entry_aborts_without_a_blamed_node() {
        let mut mgr = manager();
        let (tx, mut rx) = oneshot::channel();
        let now = Instant::now();
        // A removal-only change has no joiners; if the joint entry can not
        // commit, no node is at fault.
        mgr.begin(tx, btreeset![], 10, now);

        let late = now + Duration::from_secs(31);
        assert_eq!(mgr.poll(9, 10, &BTreeMap::new(), late), Some(MembershipAction::Abort));

        mgr.note_abort_appended(11);
        assert_eq!(mgr.poll(11, 11, &BTreeMap::new(), late), Some(MembershipAction::Completed));
        match rx.try_recv() {
            Ok(Err(ChangeMembershipError::JointCommitTimeout)) => {}
            other => panic!("expected joint commit timeout, got {other:?}"),
        }
    }

    #[test]
    fn abandonment_fails_the_caller() {
        let mut mgr = manager();
        let (tx, mut rx) = oneshot::channel();
        mgr.begin(tx, btreeset![4], 10, Instant::now());
        mgr.abandon(ChangeMembershipError::NotLeader(Some(2)));
        assert!(!mgr.in_progress());
        assert!(matches!(rx.try_recv(), Ok(Err(ChangeMembershipError::NotLeader(Some(2))))));
    }
}
