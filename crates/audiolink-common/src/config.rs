//! Persisted node configuration and the store it lives in.
//!
//! The pool treats configuration storage as an external collaborator behind
//! [`NodeConfigStore`]. Two implementations ship with the crate: an
//! in-memory store for tests and embedders that persist elsewhere, and a
//! JSON-file-backed store for standalone deployments.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{AudiolinkError, Result};

/// Stable unique identifier of a node. Assigned at creation, never reused.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_reconnect_attempts() -> i32 {
    -1
}

fn default_resume_timeout() -> u32 {
    60
}

/// Everything needed to reach and authenticate against one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Human-readable name, used in logs.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
    /// Excluded from playback assignment; still eligible for search routing.
    #[serde(default)]
    pub search_only: bool,
    /// Lifecycle owned by this process rather than an operator.
    #[serde(default)]
    pub managed: bool,
    /// Reconnection attempts per outage; `-1` retries forever.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: i32,
    /// Seconds the node holds players for a resumed session.
    #[serde(default = "default_resume_timeout")]
    pub resume_timeout: u32,
    /// Capabilities to strip from whatever the node advertises.
    #[serde(default)]
    pub disabled_sources: Vec<String>,
    /// Explicit region label; derived from the host when absent.
    #[serde(default)]
    pub region: Option<String>,
}

impl NodeConfig {
    /// Checks the fields a connection attempt actually needs.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(AudiolinkError::InvalidNodeConfig(format!(
                "node {}: empty host",
                self.id
            )));
        }
        if self.port == 0 {
            return Err(AudiolinkError::InvalidNodeConfig(format!(
                "node {}: port must be non-zero",
                self.id
            )));
        }
        if self.password.is_empty() {
            return Err(AudiolinkError::InvalidNodeConfig(format!(
                "node {}: empty password",
                self.id
            )));
        }
        Ok(())
    }
}

/// External configuration store the pool persists node specs into.
#[async_trait]
pub trait NodeConfigStore: Send + Sync {
    /// Persists (or replaces) a node configuration.
    async fn add_node(&self, config: &NodeConfig) -> Result<NodeConfig>;

    async fn get_node_config(&self, id: NodeId) -> Result<NodeConfig>;

    /// All stored configurations whose lifecycle is operator-owned.
    async fn get_all_unmanaged_nodes(&self) -> Result<Vec<NodeConfig>>;

    async fn delete(&self, id: NodeId) -> Result<()>;
}

/// In-memory store; contents die with the process.
#[derive(Default)]
pub struct MemoryConfigStore {
    nodes: Mutex<BTreeMap<u64, NodeConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeConfigStore for MemoryConfigStore {
    async fn add_node(&self, config: &NodeConfig) -> Result<NodeConfig> {
        let mut nodes = self.nodes.lock().await;
        nodes.insert(config.id.0, config.clone());
        Ok(config.clone())
    }

    async fn get_node_config(&self, id: NodeId) -> Result<NodeConfig> {
        let nodes = self.nodes.lock().await;
        nodes.get(&id.0).cloned().ok_or(AudiolinkError::NodeNotFound(id))
    }

    async fn get_all_unmanaged_nodes(&self) -> Result<Vec<NodeConfig>> {
        let nodes = self.nodes.lock().await;
        Ok(nodes.values().filter(|c| !c.managed).cloned().collect())
    }

    async fn delete(&self, id: NodeId) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        nodes.remove(&id.0);
        Ok(())
    }
}

/// Store backed by a single JSON file, keyed by node id.
///
/// Every mutation rewrites the whole file; the map is small enough that
/// this is cheaper than being clever about partial updates.
pub struct FileConfigStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<u64, NodeConfig>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, nodes: &BTreeMap<u64, NodeConfig>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(nodes)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl NodeConfigStore for FileConfigStore {
    async fn add_node(&self, config: &NodeConfig) -> Result<NodeConfig> {
        let _guard = self.lock.lock().await;
        let mut nodes = self.load().await?;
        nodes.insert(config.id.0, config.clone());
        self.save(&nodes).await?;
        Ok(config.clone())
    }

    async fn get_node_config(&self, id: NodeId) -> Result<NodeConfig> {
        let _guard = self.lock.lock().await;
        let nodes = self.load().await?;
        nodes.get(&id.0).cloned().ok_or(AudiolinkError::NodeNotFound(id))
    }

    async fn get_all_unmanaged_nodes(&self) -> Result<Vec<NodeConfig>> {
        let _guard = self.lock.lock().await;
        let nodes = self.load().await?;
        Ok(nodes.values().filter(|c| !c.managed).cloned().collect())
    }

    async fn delete(&self, id: NodeId) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut nodes = self.load().await?;
        nodes.remove(&id.0);
        self.save(&nodes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: u64) -> NodeConfig {
        NodeConfig {
            id: NodeId(id),
            name: format!("node-{}", id),
            host: "localhost".to_string(),
            port: 2333,
            password: "changeme".to_string(),
            ssl: false,
            search_only: false,
            managed: false,
            reconnect_attempts: -1,
            resume_timeout: 60,
            disabled_sources: Vec::new(),
            region: None,
        }
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        assert!(config(1).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let mut broken = config(1);
        broken.host = String::new();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut broken = config(1);
        broken.port = 0;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_password() {
        let mut broken = config(1);
        broken.password = String::new();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_config_defaults_from_minimal_json() {
        let parsed: NodeConfig = serde_json::from_str(
            r#"{"id": 7, "name": "n", "host": "h", "port": 2333, "password": "pw"}"#,
        )
        .unwrap();
        assert_eq!(parsed.reconnect_attempts, -1);
        assert_eq!(parsed.resume_timeout, 60);
        assert!(!parsed.ssl);
        assert!(!parsed.managed);
        assert!(parsed.region.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryConfigStore::new();
        store.add_node(&config(1)).await.unwrap();
        let loaded = store.get_node_config(NodeId(1)).await.unwrap();
        assert_eq!(loaded, config(1));
    }

    #[tokio::test]
    async fn test_memory_store_missing_node_errors() {
        let store = MemoryConfigStore::new();
        assert!(matches!(
            store.get_node_config(NodeId(42)).await,
            Err(AudiolinkError::NodeNotFound(NodeId(42)))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_unmanaged_filter() {
        let store = MemoryConfigStore::new();
        store.add_node(&config(1)).await.unwrap();
        let mut managed = config(2);
        managed.managed = true;
        store.add_node(&managed).await.unwrap();

        let unmanaged = store.get_all_unmanaged_nodes().await.unwrap();
        assert_eq!(unmanaged.len(), 1);
        assert_eq!(unmanaged[0].id, NodeId(1));
    }

    #[tokio::test]
    async fn test_memory_store_delete() {
        let store = MemoryConfigStore::new();
        store.add_node(&config(1)).await.unwrap();
        store.delete(NodeId(1)).await.unwrap();
        assert!(store.get_node_config(NodeId(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let store = FileConfigStore::new(&path);
        store.add_node(&config(1)).await.unwrap();
        store.add_node(&config(2)).await.unwrap();
        drop(store);

        let reopened = FileConfigStore::new(&path);
        let all = reopened.get_all_unmanaged_nodes().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(
            reopened.get_node_config(NodeId(2)).await.unwrap().name,
            "node-2"
        );
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("absent.json"));
        assert!(store.get_all_unmanaged_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_delete_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let store = FileConfigStore::new(&path);
        store.add_node(&config(1)).await.unwrap();
        store.delete(NodeId(1)).await.unwrap();

        let reopened = FileConfigStore::new(&path);
        assert!(reopened.get_node_config(NodeId(1)).await.is_err());
    }
}
