//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious use
//! cases are to expose these metrics to a metrics collection system. Another
//! use case is to monitor the cluster from a client: awaiting a leader before
//! submitting writes, or tracking commit progress.

use serde::Deserialize;
use serde::Serialize;

use crate::message::MembershipConfig;
use crate::NodeId;

/// The role a node currently occupies in its cluster.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleTag {
    /// The node is replicating the leader's log.
    Follower,
    /// The node has called an election and is gathering votes.
    Candidate,
    /// The node is the cluster leader.
    Leader,
}

/// Whether a node is fit to participate in consensus.
///
/// A storage failure flips a node to `Unhealthy` permanently: a node which
/// can not durably record its promises refuses all further participation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
}

/// A set of metrics describing the current state of a Raft node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// Whether the node is fit to participate.
    pub health: NodeHealth,
    /// The role of the Raft node.
    pub role: RoleTag,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index which has been appended to this node's log.
    pub last_log_index: u64,
    /// The last log index known committed by the cluster.
    pub commit_index: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<NodeId>,
    /// The current membership config of the cluster.
    pub membership_config: MembershipConfig,
}

impl RaftMetrics {
    /// The metrics of a freshly started, uninitialized node.
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            health: NodeHealth::Healthy,
            role: RoleTag::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            current_leader: None,
            membership_config: MembershipConfig::default(),
        }
    }
}
