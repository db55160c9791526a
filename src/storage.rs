//! The interface to the durable storage layer, along with in-memory
//! implementations suitable for testing.
//!
//! Storage calls are synchronous and made from the node's single message
//! handling task, so implementations never see concurrent access. Any update
//! to term, vote or membership is persisted through [`StateStore`] before the
//! node acts on it; a crash therefore never forgets a promise already visible
//! to the rest of the cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::anyhow;
use serde::Deserialize;
use serde::Serialize;

use crate::error::StorageError;
use crate::message::Entry;
use crate::message::MembershipConfig;
use crate::AppData;
use crate::NodeId;

/// A result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A record holding the hard state of a Raft node.
///
/// The fields a node must never forget across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in `current_term`.
    pub voted_for: Option<NodeId>,
    /// The latest membership configuration known to this node.
    pub membership: MembershipConfig,
}

/// The durable Raft log of a single node.
///
/// Indices start at 1; index 0 denotes the empty prefix and is never a real
/// entry. The log tracks two cursors: the append index (highest entry
/// physically present) and the commit index (highest entry known safe), with
/// `commit_index <= append_index` at all times.
pub trait RaftLog<D: AppData>: Send + Sync + 'static {
    /// Append a single entry after the current append index, returning its index.
    fn append(&mut self, entry: Entry<D>) -> StorageResult<u64>;

    /// Mark all entries up to `index` as committed.
    ///
    /// The commit index never moves backwards; an `index` at or below the
    /// current commit index is a no-op.
    fn commit(&mut self, index: u64) -> StorageResult<()>;

    /// Delete all entries from `from` (inclusive) through the append index.
    ///
    /// Only uncommitted entries may be truncated.
    fn truncate(&mut self, from: u64) -> StorageResult<()>;

    /// Get the entry at the given index, if present.
    fn entry_at(&self, index: u64) -> StorageResult<Option<Entry<D>>>;

    /// Get the term of the entry at the given index.
    ///
    /// Index 0 reports term 0. `None` means the index is not in the log.
    fn term_at(&self, index: u64) -> StorageResult<Option<u64>>;

    /// Get a range of entries `[start, end)`.
    fn range(&self, start: u64, end: u64) -> StorageResult<Vec<Entry<D>>>;

    /// The index of the highest entry physically present, 0 when empty.
    fn append_index(&self) -> u64;

    /// The index of the highest committed entry, 0 when nothing is committed.
    fn commit_index(&self) -> u64;

    /// The lowest index still present; entries below it have been pruned.
    fn first_index(&self) -> u64;
}

/// Durable storage of a node's [`HardState`].
pub trait StateStore: Send + Sync + 'static {
    /// Persist the given hard state, overwriting any previous record.
    fn persist(&self, hs: &HardState) -> StorageResult<()>;

    /// Load the persisted hard state, `None` when the node is pristine.
    fn load(&self) -> StorageResult<Option<HardState>>;
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory `RaftLog`, mainly for testing and for building block examples.
#[derive(Debug)]
pub struct InMemoryLog<D: AppData> {
    entries: BTreeMap<u64, Entry<D>>,
    commit_index: u64,
    first_index: u64,
}

impl<D: AppData> Default for InMemoryLog<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: AppData> InMemoryLog<D> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            commit_index: 0,
            first_index: 1,
        }
    }

    /// Fabricate a pruned prefix, as if entries below `first` were compacted.
    #[cfg(test)]
    pub(crate) fn set_first_index(&mut self, first: u64) {
        self.first_index = first;
    }
}

impl<D: AppData> RaftLog<D> for InMemoryLog<D> {
    fn append(&mut self, entry: Entry<D>) -> StorageResult<u64> {
        let index = self.append_index() + 1;
        if entry.index() != index {
            return Err(StorageError(anyhow!(
                "append of entry {} does not follow append index {}",
                entry.index(),
                index - 1,
            )));
        }
        self.entries.insert(index, entry);
        Ok(index)
    }

    fn commit(&mut self, index: u64) -> StorageResult<()> {
        if index > self.append_index() {
            return Err(StorageError(anyhow!(
                "commit of {} is beyond append index {}",
                index,
                self.append_index()
            )));
        }
        if index > self.commit_index {
            self.commit_index = index;
        }
        Ok(())
    }

    fn truncate(&mut self, from: u64) -> StorageResult<()> {
        if from <= self.commit_index {
            return Err(StorageError(anyhow!(
                "truncate from {} would delete committed entries (commit index {})",
                from,
                self.commit_index
            )));
        }
        self.entries.split_off(&from);
        Ok(())
    }

    fn entry_at(&self, index: u64) -> StorageResult<Option<Entry<D>>> {
        Ok(self.entries.get(&index).cloned())
    }

    fn term_at(&self, index: u64) -> StorageResult<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        Ok(self.entries.get(&index).map(|e| e.term()))
    }

    fn range(&self, start: u64, end: u64) -> StorageResult<Vec<Entry<D>>> {
        Ok(self.entries.range(start..end).map(|(_, e)| e.clone()).collect())
    }

    fn append_index(&self) -> u64 {
        self.entries.keys().next_back().copied().unwrap_or(self.first_index - 1)
    }

    fn commit_index(&self) -> u64 {
        self.commit_index
    }

    fn first_index(&self) -> u64 {
        self.first_index
    }
}

/// An in-memory `StateStore`, mainly for testing.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStateStore {
    hs: Arc<RwLock<Option<HardState>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn persist(&self, hs: &HardState) -> StorageResult<()> {
        let mut guard = self.hs.write().map_err(|_| StorageError(anyhow!("state store lock poisoned")))?;
        *guard = Some(hs.clone());
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<HardState>> {
        let guard = self.hs.read().map_err(|_| StorageError(anyhow!("state store lock poisoned")))?;
        Ok(guard.clone())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
