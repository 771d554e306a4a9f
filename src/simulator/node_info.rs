//! Node plus the pods bound to it, as seen by the placement simulation

use std::collections::HashMap;

use crate::api::resources::RESOURCE_PODS;
use crate::api::{Node, Pod, ResourceList};

/// A node and the pods placed on it
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    node: Option<Node>,
    pods: Vec<Pod>,
    requested: ResourceList,
}

impl NodeInfo {
    /// Create info for a node without pods
    pub fn new(node: Node) -> Self {
        Self {
            node: Some(node),
            ..Default::default()
        }
    }

    /// Create info for a node with the given pods
    pub fn with_pods(node: Node, pods: Vec<Pod>) -> Self {
        let mut info = Self::new(node);
        for pod in pods {
            info.add_pod(pod);
        }
        info
    }

    /// The node, absent when pods reference a node that is gone
    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    pub fn set_node(&mut self, node: Node) {
        self.node = Some(node);
    }

    pub fn pods(&self) -> &[Pod] {
        &self.pods
    }

    /// Place a pod on the node
    pub fn add_pod(&mut self, pod: Pod) {
        self.requested.add(&pod.requests());
        self.pods.push(pod);
    }

    /// Sum of the requests of every placed pod
    pub fn requested(&self) -> &ResourceList {
        &self.requested
    }

    /// Free capacity for a resource; pods are counted against the pod slots
    pub fn free(&self, resource: &str) -> i64 {
        let allocatable = self
            .node
            .as_ref()
            .map(|n| n.status.allocatable.get_or_zero(resource))
            .unwrap_or(0);
        let used = if resource == RESOURCE_PODS {
            self.pods.len() as i64
        } else {
            self.requested.get_or_zero(resource)
        };
        allocatable - used
    }
}

/// Group pods by node name and attach the matching nodes.
///
/// Pods bound to nodes missing from `nodes` produce entries without a node.
pub fn create_node_name_to_info_map(pods: &[Pod], nodes: &[Node]) -> HashMap<String, NodeInfo> {
    let mut infos: HashMap<String, NodeInfo> = HashMap::new();
    for pod in pods {
        if pod.spec.node_name.is_empty() {
            continue;
        }
        infos
            .entry(pod.spec.node_name.clone())
            .or_default()
            .add_pod(pod.clone());
    }
    for node in nodes {
        infos
            .entry(node.metadata.name.clone())
            .or_default()
            .set_node(node.clone());
    }
    infos
}
