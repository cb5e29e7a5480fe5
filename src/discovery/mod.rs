//! Directory of reachable peer nodes and the capabilities they advertise.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

use crate::core::{Node, NodeFilter, NodeId};

/// Accepts nodes with a direct radio link
#[derive(Debug, Clone, Copy, Default)]
pub struct NearbyFilter;

impl NodeFilter for NearbyFilter {
    fn accepts(&self, node: &Node) -> bool {
        node.is_nearby
    }
}

/// Accepts every node
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyFilter;

impl NodeFilter for AnyFilter {
    fn accepts(&self, _node: &Node) -> bool {
        true
    }
}

/// Pick one node out of a set.
///
/// Nearby nodes win; within the winning group the node with the smallest id
/// is chosen, so the same set always yields the same node. Returns `None`
/// only for an empty set.
pub fn pick_node<'a, I>(nodes: I) -> Option<Node>
where
    I: IntoIterator<Item = &'a Node>,
{
    nodes
        .into_iter()
        .min_by(|a, b| b.is_nearby.cmp(&a.is_nearby).then_with(|| a.id.cmp(&b.id)))
        .cloned()
}

/// Connected-node set and capability map, safe to query while being updated
#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: RwLock<HashMap<NodeId, Node>>,
    capabilities: RwLock<HashMap<String, HashSet<Node>>>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes_read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, Node>> {
        self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn nodes_write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, Node>> {
        self.nodes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn capabilities_read(&self) -> RwLockReadGuard<'_, HashMap<String, HashSet<Node>>> {
        self.capabilities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn capabilities_write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashSet<Node>>> {
        self.capabilities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the currently connected nodes
    pub fn connected_nodes(&self) -> HashSet<Node> {
        self.nodes_read().values().cloned().collect()
    }

    pub fn nearby_nodes(&self) -> HashSet<Node> {
        NearbyFilter.filter_nodes(&self.connected_nodes())
    }

    pub fn node_by_id(&self, id: &NodeId) -> Option<Node> {
        self.nodes_read().get(id).cloned()
    }

    /// Nodes providing `capability`; empty if the capability is unknown
    pub fn nodes_for_capability(&self, capability: &str) -> HashSet<Node> {
        if capability.is_empty() {
            error!("nodes_for_capability(): capability cannot be empty");
        }
        self.capabilities_read()
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    pub fn nodes_for_capability_filtered(&self, capability: &str, filter: &dyn NodeFilter) -> HashSet<Node> {
        filter.filter_nodes(&self.nodes_for_capability(capability))
    }

    /// Best node for `capability` according to [`pick_node`]
    pub fn pick_node_for_capability(&self, capability: &str) -> Option<Node> {
        pick_node(&self.nodes_for_capability(capability))
    }

    /// Best connected node according to [`pick_node`]
    pub fn pick_connected_node(&self) -> Option<Node> {
        pick_node(self.nodes_read().values())
    }

    pub fn known_capabilities(&self) -> Vec<String> {
        self.capabilities_read().keys().cloned().collect()
    }

    pub fn replace_nodes(&self, nodes: impl IntoIterator<Item = Node>) {
        let mut map = self.nodes_write();
        map.clear();
        map.extend(nodes.into_iter().map(|n| (n.id.clone(), n)));
        debug!("node directory now holds {} nodes", map.len());
    }

    pub fn peer_connected(&self, node: Node) {
        self.nodes_write().insert(node.id.clone(), node);
    }

    pub fn peer_disconnected(&self, node: &Node) {
        self.nodes_write().remove(&node.id);
    }

    pub fn set_capability(&self, capability: impl Into<String>, nodes: HashSet<Node>) {
        self.capabilities_write().insert(capability.into(), nodes);
    }

    pub fn replace_capabilities(&self, capabilities: HashMap<String, HashSet<Node>>) {
        *self.capabilities_write() = capabilities;
    }

    pub fn clear(&self) {
        self.nodes_write().clear();
        self.capabilities_write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Node> {
        vec![
            Node::new("n3", "watch", true),
            Node::new("n1", "tablet", false),
            Node::new("n2", "phone", true),
        ]
    }

    #[test]
    fn test_pick_prefers_nearby() {
        let picked = pick_node(&sample()).unwrap();
        assert!(picked.is_nearby);
        assert_eq!(picked.id.as_str(), "n2");
    }

    #[test]
    fn test_pick_falls_back_to_any_node() {
        let nodes = vec![Node::new("b", "b", false), Node::new("a", "a", false)];
        assert_eq!(pick_node(&nodes).unwrap().id.as_str(), "a");
        assert!(pick_node(&Vec::<Node>::new()).is_none());
    }

    #[test]
    fn test_unknown_capability_is_empty() {
        let directory = NodeDirectory::new();
        assert!(directory.nodes_for_capability("nothing").is_empty());
        assert!(directory.nodes_for_capability_filtered("nothing", &NearbyFilter).is_empty());
    }

    #[test]
    fn test_capability_filter() {
        let directory = NodeDirectory::new();
        directory.set_capability("cap", sample().into_iter().collect());

        let nearby = directory.nodes_for_capability_filtered("cap", &NearbyFilter);
        assert_eq!(nearby.len(), 2);
        assert!(nearby.iter().all(|n| n.is_nearby));

        let named = directory.nodes_for_capability_filtered("cap", &|n: &Node| n.display_name == "tablet");
        assert_eq!(named.len(), 1);
    }

    #[test]
    fn test_peer_updates() {
        let directory = NodeDirectory::new();
        directory.replace_nodes(sample());
        assert_eq!(directory.connected_nodes().len(), 3);
        assert_eq!(directory.nearby_nodes().len(), 2);

        let watch = directory.node_by_id(&NodeId::new("n3")).unwrap();
        directory.peer_disconnected(&watch);
        assert!(directory.node_by_id(&NodeId::new("n3")).is_none());
        assert_eq!(directory.pick_connected_node().unwrap().id.as_str(), "n2");
    }
}
