use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a raft log entry.
///
/// A term and an index identifies a log entry globally.
#[derive(Debug, Default, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl From<(u64, u64)> for LogId {
    fn from(v: (u64, u64)) -> Self {
        LogId { term: v.0, index: v.1 }
    }
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// An opaque token identifying the cluster/store a message belongs to.
///
/// Every wire message carries one; messages whose token does not match the
/// local node's are dropped at the boundary and never reach the state machine.
#[derive(Debug, Default, Copy, Clone, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterId(pub u64);

impl Display for ClusterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cluster-{}", self.0)
    }
}

/// An update action with option to update with some value or just ignore this update.
#[derive(Debug, Clone, PartialOrd, PartialEq, Eq, Serialize, Deserialize)]
pub enum Update<T> {
    Update(T),
    Ignore,
}

impl<T> Update<T> {
    pub fn is_ignore(&self) -> bool {
        matches!(self, Update::Ignore)
    }
}

impl<T> Default for Update<T> {
    fn default() -> Self {
        Update::Ignore
    }
}
