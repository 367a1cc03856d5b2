//! The playback-session collaborator.

use std::sync::Arc;

use async_trait::async_trait;

use audiolink_common::{NodeId, Result};

use crate::node::Node;

/// One playback session.
///
/// Players are implemented outside the pool; the pool only moves them
/// between nodes and parks them while no node is available. A player is
/// attached to at most one node at any instant.
#[async_trait]
pub trait Player: Send + Sync {
    /// Stable identifier, used for logging and player-set bookkeeping.
    fn id(&self) -> u64;

    /// Moves this player onto `node`.
    ///
    /// Must be idempotent when the player is already on `node`, and must
    /// detach from the previous node and attach to the new one as a single
    /// logical step: no observer may see the player on two nodes.
    async fn change_node(&self, node: Arc<Node>) -> Result<()>;

    /// The node this player was displaced from during an outage, if any.
    ///
    /// Written only by the failover controller.
    fn original_node(&self) -> Option<NodeId>;

    fn set_original_node(&self, node: Option<NodeId>);
}

pub type PlayerRef = Arc<dyn Player>;
