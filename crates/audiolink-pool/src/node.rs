//! A handle to one remote audio-processing backend.
//!
//! A node owns its persistent WebSocket, the set of players currently
//! attached to it, and the load penalty derived from the node's own stats
//! reports. Connection-state transitions are pushed to the failover
//! controller as lifecycle events; that channel is the only way the rest of
//! the pool learns about node health.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use audiolink_common::protocol::{IncomingMessage, NodeInfo};
use audiolink_common::transport::{NodeSocket, SocketEvent};
use audiolink_common::{AudiolinkError, NodeConfig, NodeId, Result};

use crate::player::PlayerRef;
use crate::region::region_from_endpoint;
use crate::selector::NodeSnapshot;

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Close code reported on the final lifecycle event of a locally closed node.
const LOCAL_CLOSE_CODE: u16 = 1000;

/// Connection state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Terminal; a closed node must be recreated.
    Closed,
}

#[derive(Debug)]
pub(crate) enum LifecycleKind {
    Connected,
    Disconnected { code: u16, reason: String },
}

/// One lifecycle transition, in per-node emission order.
///
/// Carries the node handle itself so the failover controller can migrate
/// players off a node that has already left the registry.
pub(crate) struct Lifecycle {
    pub node: Arc<Node>,
    pub kind: LifecycleKind,
}

pub struct Node {
    config: NodeConfig,
    region: Option<String>,
    session: reqwest::Client,
    client_id: u64,
    client_name: String,

    me: Weak<Node>,
    lifecycle: mpsc::UnboundedSender<Lifecycle>,
    status_tx: watch::Sender<NodeStatus>,
    status_rx: watch::Receiver<NodeStatus>,
    penalty: std::sync::RwLock<f64>,
    capabilities: std::sync::RwLock<HashSet<String>>,
    players: Mutex<Vec<PlayerRef>>,
    closed: AtomicBool,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Node {
    pub(crate) fn new(
        config: NodeConfig,
        session: reqwest::Client,
        client_id: u64,
        client_name: String,
        lifecycle: mpsc::UnboundedSender<Lifecycle>,
    ) -> Arc<Self> {
        let region = config
            .region
            .clone()
            .or_else(|| region_from_endpoint(&config.host).map(str::to_string));
        let (status_tx, status_rx) = watch::channel(NodeStatus::Disconnected);

        Arc::new_cyclic(|me| Self {
            config,
            region,
            session,
            client_id,
            client_name,
            me: me.clone(),
            lifecycle,
            status_tx,
            status_rx,
            penalty: std::sync::RwLock::new(0.0),
            capabilities: std::sync::RwLock::new(HashSet::new()),
            players: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            task: std::sync::Mutex::new(None),
        })
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn status(&self) -> NodeStatus {
        *self.status_rx.borrow()
    }

    /// Connected and eligible for work.
    pub fn available(&self) -> bool {
        self.status() == NodeStatus::Connected
    }

    pub fn search_only(&self) -> bool {
        self.config.search_only
    }

    pub fn managed(&self) -> bool {
        self.config.managed
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Load score from the node's latest stats report; 0 before the first.
    pub fn penalty(&self) -> f64 {
        *self.penalty.read().unwrap()
    }

    pub fn has_capability(&self, feature: &str) -> bool {
        self.capabilities.read().unwrap().contains(feature)
    }

    pub fn capabilities(&self) -> HashSet<String> {
        self.capabilities.read().unwrap().clone()
    }

    /// Point-in-time view for the selection policy.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.config.id,
            available: self.available(),
            search_only: self.config.search_only,
            region: self.region.clone(),
            penalty: self.penalty(),
            capabilities: self.capabilities(),
        }
    }

    /// Players currently attached to this node, in attachment order.
    pub async fn players(&self) -> Vec<PlayerRef> {
        self.players.lock().await.clone()
    }

    pub async fn player_count(&self) -> usize {
        self.players.lock().await.len()
    }

    /// Attaches a player; attaching one that is already here is a no-op.
    pub async fn attach_player(&self, player: PlayerRef) {
        let mut players = self.players.lock().await;
        if players.iter().all(|p| p.id() != player.id()) {
            players.push(player);
        }
    }

    pub async fn detach_player(&self, player_id: u64) -> Option<PlayerRef> {
        let mut players = self.players.lock().await;
        let position = players.iter().position(|p| p.id() == player_id)?;
        Some(players.remove(position))
    }

    pub(crate) async fn drain_players(&self) -> Vec<PlayerRef> {
        std::mem::take(&mut *self.players.lock().await)
    }

    /// Establishes the connection, then keeps it alive in the background.
    ///
    /// Idempotent: connecting a node that is already connecting or connected
    /// is a no-op. A closed node cannot be reconnected.
    pub async fn connect(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AudiolinkError::NodeClosed);
        }
        let begin = self.status_tx.send_if_modified(|status| {
            if matches!(status, NodeStatus::Disconnected) {
                *status = NodeStatus::Connecting;
                true
            } else {
                false
            }
        });
        if !begin {
            return Ok(());
        }

        match self.establish_and_identify().await {
            Ok(socket) => {
                self.set_status(NodeStatus::Connected);
                info!("Node {} successfully established its connection", self.name());
                self.emit(LifecycleKind::Connected);
                self.spawn_read_loop(socket);
                Ok(())
            }
            Err(e) => {
                self.set_status(NodeStatus::Disconnected);
                Err(e)
            }
        }
    }

    /// Waits for the node to reach `Connected`.
    ///
    /// Only the caller's wait is bounded by `timeout`; the connection
    /// attempt itself keeps running.
    pub async fn wait_until_connected(&self, timeout: Option<Duration>) -> Result<()> {
        let mut status = self.status_rx.clone();
        let wait = async move {
            let reached = status
                .wait_for(|s| matches!(s, NodeStatus::Connected | NodeStatus::Closed))
                .await
                .map_err(|_| AudiolinkError::NodeClosed)?;
            match *reached {
                NodeStatus::Connected => Ok(()),
                _ => Err(AudiolinkError::NodeClosed),
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| AudiolinkError::Timeout(limit.as_millis() as u64))?,
            None => wait.await,
        }
    }

    /// Terminates the transport and marks the node closed.
    ///
    /// Closing is terminal. The final `disconnected` signal is handed to the
    /// failover controller before this returns, so attached players get
    /// migrated or parked; no lifecycle event is emitted afterwards.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        let was_live = matches!(
            self.status(),
            NodeStatus::Connected | NodeStatus::Connecting
        );
        self.status_tx.send_replace(NodeStatus::Closed);
        if was_live {
            self.send_lifecycle(LifecycleKind::Disconnected {
                code: LOCAL_CLOSE_CODE,
                reason: "node closed".to_string(),
            });
        }
        info!("Node {} closed", self.name());
    }

    fn set_status(&self, status: NodeStatus) {
        self.status_tx.send_if_modified(|current| {
            // Closed is terminal; a racing connect attempt must not revive it.
            if *current == NodeStatus::Closed || *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn emit(&self, kind: LifecycleKind) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.send_lifecycle(kind);
    }

    fn send_lifecycle(&self, kind: LifecycleKind) {
        if let Some(node) = self.me.upgrade() {
            let _ = self.lifecycle.send(Lifecycle { node, kind });
        }
    }

    fn spawn_read_loop(&self, socket: NodeSocket) {
        let Some(node) = self.me.upgrade() else {
            return;
        };
        let handle = tokio::spawn(node.run(socket));
        if let Some(previous) = self.task.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Connection attempt loop with exponential backoff.
    async fn establish(&self) -> Result<NodeSocket> {
        let mut attempt: i32 = 0;
        let mut delay = RECONNECT_BASE_DELAY;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(AudiolinkError::NodeClosed);
            }
            match NodeSocket::connect(
                &self.config.host,
                self.config.port,
                self.config.ssl,
                &self.config.password,
                self.client_id,
                &self.client_name,
            )
            .await
            {
                Ok(socket) => return Ok(socket),
                // A rejected password will not heal on retry.
                Err(e @ AudiolinkError::Unauthorized(_)) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if self.config.reconnect_attempts >= 0
                        && attempt >= self.config.reconnect_attempts
                    {
                        return Err(e);
                    }
                    debug!(
                        "Node {} connection attempt {} failed: {}; retrying in {:?}",
                        self.name(),
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                }
            }
        }
    }

    async fn establish_and_identify(&self) -> Result<NodeSocket> {
        let socket = self.establish().await?;
        match self.refresh_info().await {
            Ok(()) => {}
            Err(e @ (AudiolinkError::UnsupportedVersion(_) | AudiolinkError::Unauthorized(_))) => {
                return Err(e)
            }
            Err(e) => warn!(
                "Node {}: info fetch failed, keeping configured capabilities: {}",
                self.name(),
                e
            ),
        }
        Ok(socket)
    }

    /// Fetches `/v4/info` through the shared session and refreshes the
    /// capability set from the advertised sources and plugins.
    async fn refresh_info(&self) -> Result<()> {
        let scheme = if self.config.ssl { "https" } else { "http" };
        let url = format!(
            "{}://{}:{}/v4/info",
            scheme, self.config.host, self.config.port
        );
        let response = self
            .session
            .get(&url)
            .header("Authorization", self.config.password.as_str())
            .send()
            .await
            .map_err(|e| AudiolinkError::Connection(e.to_string()))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AudiolinkError::Unauthorized(format!(
                "{}:{}",
                self.config.host, self.config.port
            )));
        }
        let info: NodeInfo = response
            .json()
            .await
            .map_err(|e| AudiolinkError::Connection(e.to_string()))?;
        if info.version.major < 4 {
            return Err(AudiolinkError::UnsupportedVersion(info.version.semver));
        }

        let mut capabilities: HashSet<String> = info
            .source_managers
            .into_iter()
            .chain(info.plugins.into_iter().map(|p| p.name))
            .collect();
        for source in &self.config.disabled_sources {
            capabilities.remove(source);
        }
        debug!(
            "Node {} advertises {} capabilities",
            self.name(),
            capabilities.len()
        );
        self.set_capabilities(capabilities);
        Ok(())
    }

    fn set_capabilities(&self, capabilities: HashSet<String>) {
        *self.capabilities.write().unwrap() = capabilities;
    }

    /// Read loop for an established connection, plus reconnection.
    async fn run(self: Arc<Self>, mut socket: NodeSocket) {
        loop {
            let (code, reason) = self.read_until_close(&mut socket).await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            self.set_status(NodeStatus::Disconnected);
            warn!(
                "Node {} lost its connection with code {} and reason {}",
                self.name(),
                code,
                reason
            );
            self.emit(LifecycleKind::Disconnected { code, reason });

            self.set_status(NodeStatus::Connecting);
            match self.establish_and_identify().await {
                Ok(new_socket) => {
                    socket = new_socket;
                    self.set_status(NodeStatus::Connected);
                    info!("Node {} re-established its connection", self.name());
                    self.emit(LifecycleKind::Connected);
                }
                Err(e) => {
                    self.set_status(NodeStatus::Disconnected);
                    warn!("Node {} gave up reconnecting: {}", self.name(), e);
                    return;
                }
            }
        }
    }

    async fn read_until_close(&self, socket: &mut NodeSocket) -> (u16, String) {
        loop {
            match socket.next_event().await {
                SocketEvent::Message(message) => self.handle_message(message),
                SocketEvent::Closed { code, reason } => return (code, reason),
            }
        }
    }

    fn handle_message(&self, message: IncomingMessage) {
        match message {
            IncomingMessage::Ready(ready) => {
                debug!(
                    "Node {} ready (session {}, resumed: {})",
                    self.name(),
                    ready.session_id,
                    ready.resumed
                );
            }
            IncomingMessage::Stats(stats) => {
                let penalty = stats.penalty();
                *self.penalty.write().unwrap() = penalty;
                debug!("Node {} penalty is now {:.2}", self.name(), penalty);
            }
            IncomingMessage::Unknown => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, status: NodeStatus) {
        self.status_tx.send_replace(status);
    }

    #[cfg(test)]
    pub(crate) fn force_capabilities(&self, capabilities: HashSet<String>) {
        self.set_capabilities(capabilities);
    }

    #[cfg(test)]
    pub(crate) fn force_penalty(&self, penalty: f64) {
        *self.penalty.write().unwrap() = penalty;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.config.id)
            .field("name", &self.config.name)
            .field("status", &self.status())
            .field("region", &self.region)
            .finish()
    }
}
