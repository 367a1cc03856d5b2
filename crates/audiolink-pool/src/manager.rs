//! Composition root of the node pool.
//!
//! The manager owns the registry, the shared outbound HTTP session, the
//! lifecycle channel and the failover controller. It is the entry point the
//! rest of the application goes through: adding and removing nodes, bulk
//! connecting from the configuration store, selection, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use audiolink_common::{AudiolinkError, NodeConfig, NodeConfigStore, Result};

use crate::events::NodeEvent;
use crate::failover::FailoverController;
use crate::node::{Lifecycle, Node};
use crate::player::PlayerRef;
use crate::region::KNOWN_REGIONS;
use crate::registry::NodeRegistry;
use crate::selector::{find_best, SelectionCriteria};

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Client id sent in the node handshake.
    pub client_id: u64,
    /// Client name sent in the node handshake.
    pub client_name: String,
    /// Move players back to their original node when it reconnects.
    pub connect_back: bool,
    /// Total-request timeout on the shared outbound session.
    pub request_timeout: Duration,
    /// How long the initial connection round waits per node.
    pub connect_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            client_id: 0,
            client_name: concat!("audiolink/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_back: false,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(60),
        }
    }
}

pub struct NodeManager {
    registry: Arc<NodeRegistry>,
    session: reqwest::Client,
    config_store: Arc<dyn NodeConfigStore>,
    failover: Arc<FailoverController>,
    lifecycle_tx: mpsc::UnboundedSender<Lifecycle>,
    events: broadcast::Sender<NodeEvent>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    options: ManagerOptions,
    // Kept so the consumer task is not detached from the manager's lifetime.
    _failover_handle: tokio::task::JoinHandle<()>,
}

impl NodeManager {
    /// Builds the manager and its shared outbound session.
    ///
    /// Failure to build the session is fatal: everything downstream depends
    /// on it, so startup must abort.
    pub fn new(config_store: Arc<dyn NodeConfigStore>, options: ManagerOptions) -> Result<Self> {
        let session = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| AudiolinkError::SessionInit(e.to_string()))?;

        let registry = Arc::new(NodeRegistry::new());
        let (events, _) = broadcast::channel(64);
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let failover =
            FailoverController::new(Arc::clone(&registry), events.clone(), options.connect_back);
        let failover_handle = Arc::clone(&failover).spawn(lifecycle_rx);
        let (ready_tx, ready_rx) = watch::channel(false);

        Ok(Self {
            registry,
            session,
            config_store,
            failover,
            lifecycle_tx,
            events,
            ready_tx,
            ready_rx,
            options,
            _failover_handle: failover_handle,
        })
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// The shared outbound HTTP session.
    pub fn session(&self) -> &reqwest::Client {
        &self.session
    }

    /// Subscribes to node lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Players parked without a node, in arrival order.
    pub async fn pending_players(&self) -> Vec<PlayerRef> {
        self.failover.pending_players().await
    }

    /// Creates a node, registers it, persists its configuration and kicks
    /// off its connection attempt in the background.
    pub async fn add_node(&self, config: NodeConfig) -> Result<Arc<Node>> {
        self.add_node_inner(config, false).await
    }

    /// [`add_node`](Self::add_node) without touching the configuration
    /// store, for configs that are already persisted.
    pub async fn add_node_unpersisted(&self, config: NodeConfig) -> Result<Arc<Node>> {
        self.add_node_inner(config, true).await
    }

    async fn add_node_inner(&self, config: NodeConfig, skip_store: bool) -> Result<Arc<Node>> {
        config.validate()?;
        let node = Node::new(
            config.clone(),
            self.session.clone(),
            self.options.client_id,
            self.options.client_name.clone(),
            self.lifecycle_tx.clone(),
        );
        self.registry.insert(Arc::clone(&node)).await?;
        info!("Node {} added to the registry", node.name());

        if !skip_store {
            if let Err(e) = self.config_store.add_node(&config).await {
                self.registry.remove(node.id()).await;
                return Err(e);
            }
        }

        let connecting = Arc::clone(&node);
        tokio::spawn(async move {
            if let Err(e) = connecting.connect().await {
                warn!("Node {} failed to connect: {}", connecting.name(), e);
            }
        });
        Ok(node)
    }

    /// Closes a node's transport, detaches it from the registry and deletes
    /// its persisted configuration unless the node is managed.
    pub async fn remove_node(&self, node: &Arc<Node>) -> Result<()> {
        node.close().await;
        self.registry.remove(node.id()).await;
        info!("Node {} removed from the registry", node.name());
        if !node.managed() {
            self.config_store.delete(node.id()).await?;
            debug!("Node {} configuration deleted from the store", node.name());
        }
        Ok(())
    }

    /// Loads every unmanaged node configuration from the store, adds each
    /// as a node, and waits for the resulting connection attempts together.
    ///
    /// A malformed stored configuration is skipped with a warning; a node
    /// that cannot connect within the configured window is left to keep
    /// retrying in the background. Store unavailability is a startup
    /// failure and propagates.
    pub async fn connect_to_all_nodes(&self) -> Result<()> {
        let mut nodes = Vec::new();
        for config in self.config_store.get_all_unmanaged_nodes().await? {
            let id = config.id;
            let name = config.name.clone();
            match self.add_node_unpersisted(config).await {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    warn!("Node {} ({}): invalid stored configuration, skipping: {}", name, id, e);
                }
            }
        }

        if nodes.is_empty() {
            warn!("No nodes found, please add some nodes.");
        } else {
            let connect_timeout = self.options.connect_timeout;
            let waits = nodes
                .iter()
                .map(|n| n.wait_until_connected(Some(connect_timeout)));
            for (node, result) in nodes.iter().zip(join_all(waits).await) {
                if let Err(e) = result {
                    warn!(
                        "Node {} did not finish its initial connection round: {}",
                        node.name(),
                        e
                    );
                }
            }
        }

        let _ = self.ready_tx.send(true);
        Ok(())
    }

    /// Blocks until the initial connection round has finished.
    pub async fn wait_until_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let mut ready = self.ready_rx.clone();
        let wait = async move {
            ready
                .wait_for(|ready| *ready)
                .await
                .map(|_| ())
                .map_err(|_| AudiolinkError::Connection("manager dropped".to_string()))
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| AudiolinkError::Timeout(limit.as_millis() as u64))?,
            None => wait.await,
        }
    }

    /// Picks the least-loaded node satisfying `criteria`, if any.
    pub async fn find_best_node(&self, criteria: &SelectionCriteria) -> Option<Arc<Node>> {
        let snapshots = self.registry.snapshots().await;
        let id = find_best(&snapshots, criteria)?;
        self.registry.get(id).await
    }

    /// Resolves a voice-server endpoint to a region label that at least one
    /// available node serves.
    pub async fn get_region(&self, endpoint: Option<&str>) -> Option<&'static str> {
        let endpoint = endpoint?;
        let endpoint = endpoint.strip_prefix("vip-").unwrap_or(endpoint);
        let regions = self.registry.available_regions().await;
        KNOWN_REGIONS
            .iter()
            .copied()
            .filter(|region| regions.contains(*region))
            .find(|region| endpoint.starts_with(region))
    }

    /// Shuts the pool down: suppresses failover churn, then closes every
    /// node.
    pub async fn close(&self) {
        self.failover.begin_shutdown();
        for node in self.registry.all().await {
            node.close().await;
        }
        info!("Node manager shut down");
    }
}
