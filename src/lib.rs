//! Leader election and log replication for a replicated state-machine cluster.
//!
//! This crate implements the consensus core only: the per-node role state
//! machine, vote arbitration, the renewable timeout service driving elections
//! and heartbeats, client entry batching, leader-side log shipping and
//! membership-change tracking. Durable log storage, the wire transport and
//! the downstream store applying committed entries are consumed through the
//! narrow interfaces in [`storage`] and [`network`].

pub mod ballot;
mod batch;
pub mod config;
mod core;
mod engine;
pub mod error;
mod membership;
pub mod message;
pub mod metrics;
pub mod network;
mod replication;
pub mod storage;
mod timeout;
mod types;

pub use async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::Raft;
pub use crate::error::ChangeMembershipError;
pub use crate::error::ClientWriteError;
pub use crate::error::ConfigError;
pub use crate::error::RaftError;
pub use crate::message::MembershipConfig;
pub use crate::message::Message;
pub use crate::metrics::NodeHealth;
pub use crate::metrics::RaftMetrics;
pub use crate::metrics::RoleTag;
pub use crate::network::RaftNetwork;
pub use crate::storage::RaftLog;
pub use crate::storage::StateStore;
pub use crate::types::ClusterId;
pub use crate::types::LogId;

/// A Raft node's ID.
pub type NodeId = u64;

/// A trait defining application specific replicated content.
///
/// The consensus core never inspects this data; it only decides its order and
/// commitment. Applications present their data models as-is and read them
/// back out of the log once the commit watch reports them committed, without
/// a round trip through any serialization of the core's own.
pub trait AppData: Clone + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}
