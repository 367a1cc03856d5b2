//! Reacts to node lifecycle transitions.
//!
//! A single consumer task drains the lifecycle channel, so events for one
//! node are handled in emission order. On a disconnect it migrates the
//! node's players to the best replacement, or parks them in the pending
//! queue when none exists; on a connect it drains the queue and, when
//! configured, moves displaced players back to their original node.
//!
//! A player is always in exactly one place: attached to a node, or in the
//! pending queue. Individual reassignment failures are logged and the
//! player is parked; they never abort the rest of a migration batch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::events::NodeEvent;
use crate::node::{Lifecycle, LifecycleKind, Node};
use crate::player::PlayerRef;
use crate::registry::NodeRegistry;
use crate::selector::{find_best, SelectionCriteria};

pub struct FailoverController {
    registry: Arc<NodeRegistry>,
    /// Players with no eligible node, in arrival order.
    pending: Mutex<VecDeque<PlayerRef>>,
    events: broadcast::Sender<NodeEvent>,
    /// Reassign players to their original node when it comes back.
    connect_back: bool,
    shutting_down: AtomicBool,
}

impl FailoverController {
    pub(crate) fn new(
        registry: Arc<NodeRegistry>,
        events: broadcast::Sender<NodeEvent>,
        connect_back: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pending: Mutex::new(VecDeque::new()),
            events,
            connect_back,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Starts the single consumer task over the lifecycle channel.
    pub(crate) fn spawn(
        self: Arc<Self>,
        mut lifecycle: mpsc::UnboundedReceiver<Lifecycle>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = lifecycle.recv().await {
                match event.kind {
                    LifecycleKind::Connected => self.handle_connected(event.node).await,
                    LifecycleKind::Disconnected { code, reason } => {
                        self.handle_disconnected(event.node, code, reason).await
                    }
                }
            }
        })
    }

    /// Suppresses disconnect handling during teardown.
    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Players currently parked without a node, in arrival order.
    pub async fn pending_players(&self) -> Vec<PlayerRef> {
        self.pending.lock().await.iter().cloned().collect()
    }

    async fn handle_connected(&self, node: Arc<Node>) {
        // Search-only nodes never qualify for playback assignment.
        if !node.search_only() {
            self.drain_pending(&node).await;
            if self.connect_back {
                self.reclaim_original_players(&node).await;
            }
        }
        let _ = self.events.send(NodeEvent::Connected { node: node.id() });
    }

    /// Moves queued players onto `node`, keeping the relative order of any
    /// that fail to move.
    async fn drain_pending(&self, node: &Arc<Node>) {
        let queued: Vec<PlayerRef> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };
        if queued.is_empty() {
            return;
        }

        let mut still_pending = VecDeque::new();
        for player in queued {
            match player.change_node(Arc::clone(node)).await {
                Ok(()) => debug!(
                    "Player {} moved from the queue to node {}",
                    player.id(),
                    node.name()
                ),
                Err(e) => {
                    warn!(
                        "Player {} could not leave the queue for node {}: {}",
                        player.id(),
                        node.name(),
                        e
                    );
                    still_pending.push_back(player);
                }
            }
        }

        if !still_pending.is_empty() {
            let mut pending = self.pending.lock().await;
            // Anything parked while we were draining queued after these.
            for player in still_pending.into_iter().rev() {
                pending.push_front(player);
            }
        }
    }

    /// Brings players displaced from `node` during an earlier outage back.
    async fn reclaim_original_players(&self, node: &Arc<Node>) {
        for other in self.registry.all().await {
            if other.id() == node.id() {
                continue;
            }
            let displaced: Vec<PlayerRef> = other
                .players()
                .await
                .into_iter()
                .filter(|p| p.original_node() == Some(node.id()))
                .collect();
            for player in displaced {
                match player.change_node(Arc::clone(node)).await {
                    Ok(()) => {
                        player.set_original_node(None);
                        debug!(
                            "Player {} reconnected back to node {}",
                            player.id(),
                            node.name()
                        );
                    }
                    Err(e) => warn!(
                        "Player {} failed to reconnect back to node {}: {}",
                        player.id(),
                        node.name(),
                        e
                    ),
                }
            }
        }
    }

    async fn handle_disconnected(&self, node: Arc<Node>, code: u16, reason: String) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(NodeEvent::Disconnected {
            node: node.id(),
            code,
            reason,
        });

        let players = node.drain_players().await;
        if players.is_empty() {
            return;
        }

        let criteria = SelectionCriteria {
            region: node.region().map(str::to_string),
            ..Default::default()
        };
        let replacement = match find_best(&self.registry.snapshots().await, &criteria) {
            Some(id) => self.registry.get(id).await,
            None => None,
        };

        let Some(replacement) = replacement else {
            error!(
                "Unable to move players, no available nodes! Waiting for a node to become available."
            );
            let mut pending = self.pending.lock().await;
            pending.extend(players);
            return;
        };

        info!(
            "Moving {} players from node {} to node {}",
            players.len(),
            node.name(),
            replacement.name()
        );
        for player in players {
            if self.connect_back {
                player.set_original_node(Some(node.id()));
            }
            if let Err(e) = player.change_node(Arc::clone(&replacement)).await {
                warn!(
                    "Player {} could not move to node {}: {}",
                    player.id(),
                    replacement.name(),
                    e
                );
                self.pending.lock().await.push_back(player);
            }
        }
    }
}
