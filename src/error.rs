//! Error types exposed by this crate.

use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the storage layer.
    #[error("{0}")]
    RaftStorage(#[from] StorageError),
    /// A message handle was attempted while a previous handle was still in
    /// progress.
    ///
    /// Handling is strictly serialized through the inbound queue; overlapping
    /// handles indicate a broken driver and are failed fast rather than
    /// risking interleaved state mutation.
    #[error("a message handle is already in progress")]
    ConcurrentHandle,
    /// The node has failed a storage operation and refuses to participate
    /// further; see [`StorageError`].
    #[error("Raft node is unhealthy after a storage failure")]
    Unhealthy,
    /// The Raft node is shutting down.
    #[error("Raft node is shutting down")]
    ShuttingDown,
}

/// An error from the storage layer.
///
/// Storage errors are treated as fatal: a node that cannot durably record its
/// term, vote or log cannot safely continue to participate and stops instead.
#[derive(Debug, thiserror::Error)]
#[error("storage error: {0}")]
pub struct StorageError(#[from] pub anyhow::Error);

/// An error related to a client write request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientWriteError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// No leader was available within the configured wait.
    ///
    /// This condition is transient; the caller should retry after a backoff.
    /// When a leader was last known, its ID is included so callers on a
    /// non-leader node can redirect.
    #[error("no cluster leader available to handle the write")]
    NoLeader(Option<NodeId>),
}

impl ClientWriteError {
    /// Whether the write may simply be retried against the cluster.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientWriteError::NoLeader(_))
    }
}

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The min & max election timeout values are invalid: max must be greater than min.
    #[error("given values for election timeout min & max are invalid: max must be greater than min")]
    InvalidElectionTimeoutMinMax,
    /// The heartbeat interval must be smaller than the minimum election timeout.
    #[error("heartbeat interval must be smaller than the minimum election timeout")]
    HeartbeatIntervalTooLarge,
    /// The given value for max_payload_entries is too small, must be > 0.
    #[error("the given value for max_payload_entries is too small, must be > 0")]
    MaxPayloadEntriesTooSmall,
    /// The given value for max_batch_size is too small, must be > 0.
    #[error("the given value for max_batch_size is too small, must be > 0")]
    MaxBatchSizeTooSmall,
}

/// The set of errors which may take place when requesting to propose a config change.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChangeMembershipError {
    /// An error related to the internals of Raft.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The node handling the request is not the leader.
    #[error("this node is not the Raft leader, the current leader is {0:?}")]
    NotLeader(Option<NodeId>),
    /// A membership change is already in flight; only one may run at a time.
    #[error("a membership change is already in progress")]
    InProgress,
    /// The proposed voting set was empty.
    #[error("the proposed membership can not be empty")]
    EmptyMembership,
    /// A joining member failed to catch up within the configured timeout.
    #[error("node {0} failed to catch up with the leader's log in time")]
    CatchUpTimeout(NodeId),
    /// The joint entry failed to commit within the configured timeout.
    #[error("the joint membership entry did not commit in time")]
    JointCommitTimeout,
}
