//! The Raft network interface.

use async_trait::async_trait;

use crate::message::Message;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for a Raft network between cluster members.
///
/// Delivery is directed and fire-and-forget: the node never awaits a reply
/// through this interface, replies arrive as independent inbound messages.
/// Implementations should return once the message is handed to the transport;
/// loss, duplication and reordering are tolerated by the consensus protocol
/// and must not be compensated for here.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send the given message to the target node.
    async fn send(&self, target: NodeId, msg: Message<D>);
}
