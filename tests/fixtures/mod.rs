//! Test fixtures for an in-process cluster wired over an in-memory router.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use coraft::message::Message;
use coraft::metrics::RoleTag;
use coraft::storage::InMemoryLog;
use coraft::storage::InMemoryStateStore;
use coraft::ClusterId;
use coraft::Config;
use coraft::NodeId;
use coraft::Raft;
use coraft::RaftNetwork;
use tokio::sync::RwLock;

pub type MemRaft = Raft<u64>;

pub const CLUSTER: ClusterId = ClusterId(1);

/// Initialize the tracing subscriber for a test, honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fast config suitable for in-process clusters.
pub fn test_config() -> Config {
    Config::build("test")
        .election_timeout_min(50)
        .election_timeout_max(100)
        .heartbeat_interval(10)
        .validate()
        .expect("test config must validate")
}

/// An in-memory network routing messages directly between node handles.
///
/// Nodes can be isolated, which silently drops their inbound traffic the way
/// a partition would.
pub struct RaftRouter {
    nodes: RwLock<BTreeMap<NodeId, Arc<MemRaft>>>,
    isolated: RwLock<BTreeSet<NodeId>>,
}

impl RaftRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(BTreeSet::new()),
        })
    }

    /// Create a new pristine node attached to this router.
    pub async fn new_node(self: &Arc<Self>, id: NodeId) -> Result<Arc<MemRaft>> {
        let raft = Arc::new(Raft::new(
            id,
            CLUSTER,
            test_config(),
            self.clone(),
            InMemoryLog::new(),
            InMemoryStateStore::new(),
        )?);
        self.nodes.write().await.insert(id, raft.clone());
        Ok(raft)
    }

    pub async fn node(&self, id: NodeId) -> Arc<MemRaft> {
        self.nodes.read().await.get(&id).cloned().expect("unknown node")
    }

    /// Shut a node down and detach it from the router, as a crash would.
    pub async fn remove_node(&self, id: NodeId) {
        let node = self.nodes.write().await.remove(&id);
        if let Some(node) = node {
            let _ = node.shutdown().await;
        }
    }

    pub async fn isolate(&self, id: NodeId) {
        self.isolated.write().await.insert(id);
    }

    pub async fn restore(&self, id: NodeId) {
        self.isolated.write().await.remove(&id);
    }

    /// The current leader, when exactly the expected number of nodes agree a
    /// leader exists and that node claims the role itself.
    pub async fn current_leader(&self) -> Option<NodeId> {
        let nodes = self.nodes.read().await;
        let mut leader = None;
        for raft in nodes.values() {
            let metrics = raft.metrics().borrow().clone();
            if metrics.role == RoleTag::Leader {
                if leader.replace(metrics.id).is_some() {
                    return None;
                }
            }
        }
        leader
    }

    /// Wait until one node claims leadership.
    pub async fn wait_for_leader(&self, within: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if let Some(leader) = self.current_leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("no leader emerged within {within:?}"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every non-isolated node's commit index reaches `index`.
    pub async fn wait_for_commit(&self, index: u64, within: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let nodes = self.nodes.read().await;
            let isolated = self.isolated.read().await;
            let lagging: Vec<NodeId> = nodes
                .values()
                .filter(|raft| !isolated.contains(&raft.id()))
                .filter(|raft| raft.metrics().borrow().commit_index < index)
                .map(|raft| raft.id())
                .collect();
            drop(nodes);
            drop(isolated);
            if lagging.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("nodes {lagging:?} did not reach commit index {index} within {within:?}"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown_all(&self) {
        let nodes = self.nodes.read().await;
        for raft in nodes.values() {
            let _ = raft.shutdown().await;
        }
    }
}

#[async_trait]
impl RaftNetwork<u64> for RaftRouter {
    async fn send(&self, target: NodeId, msg: Message<u64>) {
        if self.isolated.read().await.contains(&target) {
            return;
        }
        let node = self.nodes.read().await.get(&target).cloned();
        if let Some(node) = node {
            let _ = node.handle_message(msg).await;
        }
    }
}
