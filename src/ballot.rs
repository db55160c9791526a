//! Vote arbitration.
//!
//! The decision of whether a node may grant its vote is a pure function of
//! the request and the voter's own state, kept free of any node plumbing so
//! it can be tested exhaustively in isolation.

use crate::NodeId;

/// Decide whether this node should grant its vote to `candidate`.
///
/// The rules are applied in order:
///
/// 1. a request from a stale term is rejected outright;
/// 2. the candidate's log must be at least as up to date as the voter's
///    (§5.4.1: last log term dominates, index breaks the tie);
/// 3. a node grants at most one vote per term, on a first-come basis —
///    a repeated request from the same candidate is granted again, which
///    keeps the decision idempotent under duplicated messages.
#[allow(clippy::too_many_arguments)]
pub fn should_vote_for(
    candidate: NodeId,
    request_term: u64,
    my_term: u64,
    my_last_appended: u64,
    request_last_log_index: u64,
    my_last_log_term: u64,
    request_last_log_term: u64,
    voted_for: Option<NodeId>,
) -> bool {
    if request_term < my_term {
        return false;
    }

    let log_up_to_date = my_last_log_term <= request_last_log_term && my_last_appended <= request_last_log_index;
    if !log_up_to_date {
        return false;
    }

    if request_term == my_term {
        if let Some(prior) = voted_for {
            if prior != candidate {
                return false;
            }
        }
    }

    true
}
