//! Wire message shapes and the log entry model.
//!
//! Messages are directed and fire-and-forget: a node reacts to an inbound
//! message by emitting zero or more outbound messages through the transport,
//! never by blocking on a reply. Every shape carries the [`ClusterId`] token
//! of the store it belongs to so that cross-cluster traffic can be rejected
//! before it reaches the state machine.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::types::ClusterId;
use crate::types::LogId;
use crate::AppData;
use crate::NodeId;

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub cluster: ClusterId,
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate: NodeId,
    /// The index of the candidate's last appended log entry.
    pub last_log_index: u64,
    /// The term of the candidate's last appended log entry.
    pub last_log_term: u64,
}

/// The response to a `VoteRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub cluster: ClusterId,
    /// The responding node.
    pub from: NodeId,
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub granted: bool,
}

/// An RPC sent by the cluster leader to replicate log entries (§5.3).
///
/// Unlike the original Raft paper, heartbeats are a dedicated message shape
/// ([`Heartbeat`]); an `AppendEntriesRequest` always carries entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    pub cluster: ClusterId,
    /// The leader's current term.
    pub leader_term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader: NodeId,
    /// The log index immediately preceding the new entries.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// The new log entries to store, batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub cluster: ClusterId,
    /// The responding node.
    pub from: NodeId,
    /// The responding node's current term, for the leader to update itself.
    pub term: u64,
    /// True if the follower contained an entry matching `prev_log_index` and `prev_log_term`.
    pub success: bool,
    /// The highest index the follower knows to match the leader's log.
    ///
    /// On failure the leader backs its replication cursor off to this index
    /// and retransmits from the entry after it, never skipping entries.
    pub match_index: u64,
    /// The highest index physically present in the follower's log.
    pub append_index: u64,
}

/// A leader liveness probe; never carries entries (§5.2).
///
/// Carries the term of the entry at the leader's commit index so a follower
/// can verify it holds the same entry before advancing its own commit index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub cluster: ClusterId,
    /// The leader's ID.
    pub leader: NodeId,
    /// The leader's current term.
    pub leader_term: u64,
    /// The leader's commit index.
    pub commit_index: u64,
    /// The term of the entry at `commit_index`.
    pub commit_index_term: u64,
}

/// A follower's acknowledgement of a [`Heartbeat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub cluster: ClusterId,
    /// The responding node.
    pub from: NodeId,
    /// The responding node's current term.
    pub term: u64,
}

/// A notice from the leader that the entries a follower needs have been
/// pruned from the leader's log; the follower must catch up externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCompactionInfo {
    pub cluster: ClusterId,
    /// The leader's ID.
    pub leader: NodeId,
    /// The leader's current term.
    pub leader_term: u64,
    /// The last index no longer available from the leader's log.
    pub prev_index: u64,
}

/// A client-submitted entry to be replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntryRequest<D: AppData> {
    pub cluster: ClusterId,
    /// The application specific content to replicate.
    #[serde(bound = "D: AppData")]
    pub content: D,
}

/// A batch of client-submitted entries coalesced by the message batcher.
///
/// Contents are ordered by submission; the leader appends them as consecutive
/// log entries in that order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntryBatch<D: AppData> {
    pub cluster: ClusterId,
    #[serde(bound = "D: AppData")]
    pub contents: Vec<D>,
}

/// The set of all messages exchanged between cluster members (plus client
/// submissions entering through the same inbound path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_more::From)]
#[serde(bound = "D: AppData")]
pub enum Message<D: AppData> {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest<D>),
    AppendEntriesResponse(AppendEntriesResponse),
    Heartbeat(Heartbeat),
    HeartbeatResponse(HeartbeatResponse),
    LogCompactionInfo(LogCompactionInfo),
    NewEntry(NewEntryRequest<D>),
    NewEntryBatch(NewEntryBatch<D>),
}

impl<D: AppData> Message<D> {
    /// The cluster token this message was stamped with.
    pub fn cluster(&self) -> ClusterId {
        match self {
            Message::VoteRequest(m) => m.cluster,
            Message::VoteResponse(m) => m.cluster,
            Message::AppendEntries(m) => m.cluster,
            Message::AppendEntriesResponse(m) => m.cluster,
            Message::Heartbeat(m) => m.cluster,
            Message::HeartbeatResponse(m) => m.cluster,
            Message::LogCompactionInfo(m) => m.cluster,
            Message::NewEntry(m) => m.cluster,
            Message::NewEntryBatch(m) => m.cluster,
        }
    }

    /// A short human readable description for logging.
    pub fn summary(&self) -> &'static str {
        match self {
            Message::VoteRequest(_) => "VoteRequest",
            Message::VoteResponse(_) => "VoteResponse",
            Message::AppendEntries(_) => "AppendEntries",
            Message::AppendEntriesResponse(_) => "AppendEntriesResponse",
            Message::Heartbeat(_) => "Heartbeat",
            Message::HeartbeatResponse(_) => "HeartbeatResponse",
            Message::LogCompactionInfo(_) => "LogCompactionInfo",
            Message::NewEntry(_) => "NewEntry",
            Message::NewEntryBatch(_) => "NewEntryBatch",
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A Raft log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    pub fn index(&self) -> u64 {
        self.log_id.index
    }

    pub fn term(&self) -> u64 {
        self.log_id.term
    }
}

/// Log entry payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A normal client-submitted entry.
    #[serde(bound = "D: AppData")]
    Normal(D),
    /// A membership change, replicated and committed like any other entry.
    Membership(MembershipConfig),
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The membership configuration of the cluster.
///
/// While a reconfiguration is in flight, `target` holds the voting set being
/// moved to. Members of the target set which are not yet voters are
/// replication targets only and do not count toward any majority until the
/// change is finalized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// The current voting members of the cluster.
    pub voting: BTreeSet<NodeId>,
    /// The voting set being transitioned to, if a reconfiguration is in flight.
    pub target: Option<BTreeSet<NodeId>>,
}

impl MembershipConfig {
    /// Create a new initial config containing only the given node ID.
    pub fn new_initial(id: NodeId) -> Self {
        let mut voting = BTreeSet::new();
        voting.insert(id);
        Self { voting, target: None }
    }

    /// All nodes which must receive replicated entries: the voting set plus
    /// any joining members of the target set.
    pub fn all_targets(&self) -> BTreeSet<NodeId> {
        let mut all = self.voting.clone();
        if let Some(target) = &self.target {
            all.extend(target);
        }
        all
    }

    /// Check if the given node exists in this membership config.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.voting.contains(id) || self.target.as_ref().map(|t| t.contains(id)).unwrap_or(false)
    }

    /// Check if the given set of grants forms a strict majority of the
    /// current voting set.
    ///
    /// Majority is always computed against the live voting set, never a
    /// cached snapshot, so a reconfiguration mid-election is accounted for.
    pub fn is_majority(&self, granted: &BTreeSet<NodeId>) -> bool {
        let votes = granted.iter().filter(|id| self.voting.contains(id)).count();
        votes >= self.majority_size()
    }

    /// The number of votes required for a strict majority of the voting set.
    pub fn majority_size(&self) -> usize {
        self.voting.len() / 2 + 1
    }

    /// Check if a reconfiguration is currently in flight.
    pub fn in_transition(&self) -> bool {
        self.target.is_some()
    }

    /// The config this one finalizes into once its change entry commits.
    pub fn finalized(&self) -> Self {
        match &self.target {
            None => self.clone(),
            Some(target) => Self {
                voting: target.clone(),
                target: None,
            },
        }
    }
}
