//! The set of all known nodes.
//!
//! Insertion order is preserved: iteration, snapshots and therefore
//! selection tie-breaks are deterministic. Mutations go through a single
//! writer lock; readers observe either the pre- or post-mutation set, never
//! a partial one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use audiolink_common::{AudiolinkError, NodeId, Result};

use crate::node::Node;
use crate::selector::NodeSnapshot;

#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<Vec<Arc<Node>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a node; a second node with the same identifier is rejected.
    pub async fn insert(&self, node: Arc<Node>) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.iter().any(|n| n.id() == node.id()) {
            return Err(AudiolinkError::DuplicateNode(node.id()));
        }
        nodes.push(node);
        Ok(())
    }

    pub async fn remove(&self, id: NodeId) -> Option<Arc<Node>> {
        let mut nodes = self.nodes.write().await;
        let position = nodes.iter().position(|n| n.id() == id)?;
        Some(nodes.remove(position))
    }

    pub async fn get(&self, id: NodeId) -> Option<Arc<Node>> {
        let nodes = self.nodes.read().await;
        nodes.iter().find(|n| n.id() == id).cloned()
    }

    /// All nodes, in insertion order.
    pub async fn all(&self) -> Vec<Arc<Node>> {
        self.nodes.read().await.clone()
    }

    /// Connected nodes, in insertion order.
    pub async fn available(&self) -> Vec<Arc<Node>> {
        let nodes = self.nodes.read().await;
        nodes.iter().filter(|n| n.available()).cloned().collect()
    }

    /// Nodes whose process lifecycle this pool owns.
    pub async fn managed(&self) -> Vec<Arc<Node>> {
        let nodes = self.nodes.read().await;
        nodes.iter().filter(|n| n.managed()).cloned().collect()
    }

    /// Connected nodes reserved for search routing.
    pub async fn search_only(&self) -> Vec<Arc<Node>> {
        let nodes = self.nodes.read().await;
        nodes
            .iter()
            .filter(|n| n.available() && n.search_only())
            .cloned()
            .collect()
    }

    /// Snapshots of every node for the selection policy.
    pub async fn snapshots(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read().await;
        nodes.iter().map(|n| n.snapshot()).collect()
    }

    /// Region label to the available nodes in it.
    ///
    /// Recomputed on every call so it can never go stale against live node
    /// state.
    pub async fn regions(&self) -> HashMap<String, Vec<NodeId>> {
        let nodes = self.nodes.read().await;
        let mut regions: HashMap<String, Vec<NodeId>> = HashMap::new();
        for node in nodes.iter().filter(|n| n.available()) {
            if let Some(region) = node.region() {
                regions.entry(region.to_string()).or_default().push(node.id());
            }
        }
        regions
    }

    /// Capability name to the available nodes advertising it.
    pub async fn capabilities(&self) -> HashMap<String, Vec<NodeId>> {
        let nodes = self.nodes.read().await;
        let mut capabilities: HashMap<String, Vec<NodeId>> = HashMap::new();
        for node in nodes.iter().filter(|n| n.available()) {
            for capability in node.capabilities() {
                capabilities.entry(capability).or_default().push(node.id());
            }
        }
        capabilities
    }

    /// Region labels present among available nodes.
    pub async fn available_regions(&self) -> HashSet<String> {
        let nodes = self.nodes.read().await;
        nodes
            .iter()
            .filter(|n| n.available())
            .filter_map(|n| n.region().map(str::to_string))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeStatus;
    use audiolink_common::NodeConfig;
    use tokio::sync::mpsc;

    fn build_node(id: u64, host: &str) -> Arc<Node> {
        let (tx, _rx) = mpsc::unbounded_channel();
        // Receiver dropped on purpose; these nodes never emit.
        let config = NodeConfig {
            id: NodeId(id),
            name: format!("node-{}", id),
            host: host.to_string(),
            port: 2333,
            password: "pw".to_string(),
            ssl: false,
            search_only: false,
            managed: false,
            reconnect_attempts: 1,
            resume_timeout: 60,
            disabled_sources: Vec::new(),
            region: None,
        };
        Node::new(config, reqwest::Client::new(), 0, "audiolink/test".into(), tx)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let registry = NodeRegistry::new();
        let node = build_node(1, "localhost");
        registry.insert(Arc::clone(&node)).await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(NodeId(1)).await.is_some());
        assert!(registry.get(NodeId(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_identifier_rejected() {
        let registry = NodeRegistry::new();
        registry.insert(build_node(1, "a")).await.unwrap();
        let result = registry.insert(build_node(1, "b")).await;
        assert!(matches!(
            result,
            Err(AudiolinkError::DuplicateNode(NodeId(1)))
        ));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_iteration_preserves_insertion_order() {
        let registry = NodeRegistry::new();
        for id in [3, 1, 2] {
            registry.insert(build_node(id, "localhost")).await.unwrap();
        }
        let ids: Vec<NodeId> = registry.all().await.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec![NodeId(3), NodeId(1), NodeId(2)]);
    }

    #[tokio::test]
    async fn test_remove_returns_node() {
        let registry = NodeRegistry::new();
        registry.insert(build_node(1, "localhost")).await.unwrap();
        let removed = registry.remove(NodeId(1)).await;
        assert_eq!(removed.unwrap().id(), NodeId(1));
        assert!(registry.is_empty().await);
        assert!(registry.remove(NodeId(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_available_filters_by_status() {
        let registry = NodeRegistry::new();
        let online = build_node(1, "localhost");
        online.force_status(NodeStatus::Connected);
        registry.insert(online).await.unwrap();
        registry.insert(build_node(2, "localhost")).await.unwrap();

        let available = registry.available().await;
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id(), NodeId(1));
    }

    #[tokio::test]
    async fn test_region_index_tracks_available_nodes_only() {
        let registry = NodeRegistry::new();
        let online = build_node(1, "us-east1.example.media");
        online.force_status(NodeStatus::Connected);
        registry.insert(online).await.unwrap();
        registry
            .insert(build_node(2, "us-east2.example.media"))
            .await
            .unwrap();

        let regions = registry.regions().await;
        assert_eq!(regions.get("us-east"), Some(&vec![NodeId(1)]));
        assert!(registry.available_regions().await.contains("us-east"));
    }

    #[tokio::test]
    async fn test_capability_index() {
        let registry = NodeRegistry::new();
        let node = build_node(1, "localhost");
        node.force_status(NodeStatus::Connected);
        node.force_capabilities(["http".to_string()].into_iter().collect());
        registry.insert(node).await.unwrap();

        let capabilities = registry.capabilities().await;
        assert_eq!(capabilities.get("http"), Some(&vec![NodeId(1)]));
        assert!(capabilities.get("youtube").is_none());
    }

    #[tokio::test]
    async fn test_search_only_view() {
        let registry = NodeRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = NodeConfig {
            id: NodeId(9),
            name: "search".to_string(),
            host: "localhost".to_string(),
            port: 2333,
            password: "pw".to_string(),
            ssl: false,
            search_only: true,
            managed: false,
            reconnect_attempts: 1,
            resume_timeout: 60,
            disabled_sources: Vec::new(),
            region: None,
        };
        let node = Node::new(config, reqwest::Client::new(), 0, "audiolink/test".into(), tx);
        node.force_status(NodeStatus::Connected);
        registry.insert(node).await.unwrap();

        assert_eq!(registry.search_only().await.len(), 1);
    }
}
