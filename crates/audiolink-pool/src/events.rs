//! Node lifecycle notifications for external observers.

use audiolink_common::NodeId;

/// Fire-and-forget notification emitted by the pool.
///
/// Delivered over a broadcast channel: sends never block, and an observer
/// that falls behind lags and drops messages rather than stalling node
/// processing.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A node established (or re-established) its connection.
    Connected { node: NodeId },
    /// A node lost its connection.
    Disconnected {
        node: NodeId,
        code: u16,
        reason: String,
    },
}
