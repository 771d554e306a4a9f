//! Cluster manifest - the node groups, nodes and workloads the binary runs against
//!
//! A manifest seeds an [`InMemoryCloudProvider`] and an [`InMemoryCluster`].
//! Instances created by a scale-up show up as ready nodes right away, and
//! deleted instances take their node and its pods with them.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::api::{Controller, DaemonSet, Node, Pod, PodDisruptionBudget};
use crate::cloudprovider::{InMemoryCloudProvider, ResourceLimiter};
use crate::kube::InMemoryCluster;

/// Errors that can occur while loading a manifest
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse manifest: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Duplicate node group: '{0}'")]
    DuplicateNodeGroup(String),

    #[error("Node group '{id}' has invalid sizes: min={min} max={max} nodes={nodes}")]
    InvalidSize {
        id: String,
        min: usize,
        max: usize,
        nodes: usize,
    },

    #[error("Pod '{0}' is bound to unknown node '{1}'")]
    UnknownNode(String, String),
}

/// Shape of every node in a group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeShape {
    /// Allocatable CPU in millicores
    pub cpu: i64,

    /// Allocatable memory in bytes
    pub memory: i64,

    #[serde(default)]
    pub gpus: i64,

    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl NodeShape {
    fn node(&self, name: &str, provider_id: &str) -> Node {
        let now = Utc::now();
        let mut node = Node::new(name)
            .with_provider_id(provider_id)
            .with_capacity(self.cpu, self.memory)
            .created_at(now)
            .with_ready(true, now);
        if self.gpus > 0 {
            node = node.with_gpus(self.gpus);
        }
        for (key, value) in &self.labels {
            node = node.with_label(key.clone(), value.clone());
        }
        node
    }
}

/// One autoscaled node group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: String,
    pub min: usize,
    pub max: usize,

    /// Ready nodes present at startup, named `<id>-<n>`
    #[serde(default)]
    pub nodes: usize,

    pub shape: NodeShape,

    /// Whether the group can describe a node it has not created yet
    #[serde(default = "default_true")]
    pub template: bool,
}

fn default_true() -> bool {
    true
}

/// A pod, bound to a node or pending
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodEntry {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    pub name: String,

    /// Node the pod runs on; pending when absent
    #[serde(default)]
    pub node: Option<String>,

    /// CPU request in millicores
    #[serde(default)]
    pub cpu: i64,

    /// Memory request in bytes
    #[serde(default)]
    pub memory: i64,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Controller as (kind, name)
    #[serde(default)]
    pub owner: Option<OwnerEntry>,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerEntry {
    pub kind: String,
    pub name: String,
}

impl PodEntry {
    fn pod(&self) -> Pod {
        let mut pod = Pod::new(self.namespace.clone(), self.name.clone()).with_requests(self.cpu, self.memory);
        if let Some(node) = &self.node {
            pod = pod.on_node(node.clone());
        }
        if let Some(owner) = &self.owner {
            pod = pod.owned_by(owner.kind.clone(), owner.name.clone());
        }
        for (key, value) in &self.labels {
            pod = pod.with_label(key.clone(), value.clone());
        }
        pod
    }
}

/// The complete manifest file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub groups: Vec<GroupEntry>,

    #[serde(default)]
    pub pods: Vec<PodEntry>,

    #[serde(default)]
    pub pdbs: Vec<PodDisruptionBudget>,

    #[serde(default)]
    pub daemonsets: Vec<DaemonSet>,

    #[serde(default)]
    pub controllers: Vec<Controller>,

    /// Cluster-wide resource limits
    #[serde(default)]
    pub limits: Option<ResourceLimiter>,
}

/// Provider and cluster seeded from a manifest
#[derive(Debug, Clone)]
pub struct SeededCluster {
    pub cloud_provider: Arc<InMemoryCloudProvider>,
    pub cluster: Arc<InMemoryCluster>,
}

// ============================================================================
// Pure parsing and validation (no I/O)
// ============================================================================

/// Parse and validate a manifest
pub fn parse_manifest(content: &str) -> Result<Manifest, ManifestError> {
    let manifest: Manifest = serde_yaml::from_str(content)?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

fn node_name(group: &str, index: usize) -> String {
    format!("{}-{}", group, index)
}

/// Check group ids, sizes and pod bindings
pub fn validate_manifest(manifest: &Manifest) -> Result<(), ManifestError> {
    let mut ids = HashSet::new();
    let mut node_names = HashSet::new();
    for group in &manifest.groups {
        if !ids.insert(group.id.as_str()) {
            return Err(ManifestError::DuplicateNodeGroup(group.id.clone()));
        }
        if group.min > group.max || group.nodes > group.max {
            return Err(ManifestError::InvalidSize {
                id: group.id.clone(),
                min: group.min,
                max: group.max,
                nodes: group.nodes,
            });
        }
        node_names.extend((0..group.nodes).map(|i| node_name(&group.id, i)));
    }

    for pod in &manifest.pods {
        if let Some(node) = &pod.node {
            if !node_names.contains(node) {
                return Err(ManifestError::UnknownNode(
                    format!("{}/{}", pod.namespace, pod.name),
                    node.clone(),
                ));
            }
        }
    }
    Ok(())
}

// ============================================================================
// I/O wrapper
// ============================================================================

/// Load and validate a manifest file
pub fn load_manifest_file(path: &Path) -> Result<Manifest, ManifestError> {
    let content = std::fs::read_to_string(path)?;
    parse_manifest(&content)
}

impl Manifest {
    /// Build the in-memory provider and cluster, wiring instance changes
    /// through to cluster nodes
    pub fn seed(&self) -> SeededCluster {
        let cloud_provider = Arc::new(InMemoryCloudProvider::new());
        let cluster = Arc::new(InMemoryCluster::new());

        let mut shapes = HashMap::new();
        for entry in &self.groups {
            let template = entry
                .template
                .then(|| entry.shape.node(&format!("{}-template", entry.id), ""));
            let group = cloud_provider.add_node_group(entry.id.clone(), entry.min, entry.max, entry.nodes, template);
            for index in 0..entry.nodes {
                let provider_id = group.instance_id(index);
                group.add_instance(provider_id.clone());
                cluster.add_node(entry.shape.node(&node_name(&entry.id, index), &provider_id));
            }
            shapes.insert(entry.id.clone(), entry.shape.clone());
        }

        for pod in &self.pods {
            cluster.add_pod(pod.pod());
        }
        for pdb in &self.pdbs {
            cluster.add_pdb(pdb.clone());
        }
        for daemonset in &self.daemonsets {
            cluster.add_daemonset(daemonset.clone());
        }
        for controller in &self.controllers {
            cluster.add_controller(controller.clone());
        }
        cloud_provider.set_resource_limiter(self.limits.clone());

        let up_cluster = Arc::clone(&cluster);
        let down_cluster = Arc::clone(&cluster);
        cloud_provider.set_hooks(
            Arc::new(move |group: &str, provider_id: &str| {
                let Some(shape) = shapes.get(group) else {
                    return;
                };
                let name = provider_id.rsplit('/').next().unwrap_or(provider_id);
                debug!("Instance {} of {} registered as node {}", provider_id, group, name);
                up_cluster.add_node(shape.node(name, provider_id));
            }),
            Arc::new(move |group: &str, node: &str| {
                debug!("Node {} of {} deleted", node, group);
                down_cluster.remove_node(node);
            }),
        );

        SeededCluster {
            cloud_provider,
            cluster,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::{CloudProvider, NodeGroup};
    use crate::kube::ListerRegistry;

    const MANIFEST: &str = r#"
groups:
  - id: ng1
    min: 1
    max: 5
    nodes: 2
    shape:
      cpu: 2000
      memory: 4000000000
pods:
  - name: web-0
    node: ng1-0
    cpu: 500
    memory: 1000000000
    owner:
      kind: ReplicaSet
      name: web
  - name: pending
    cpu: 1500
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = parse_manifest(MANIFEST).unwrap();
        assert_eq!(manifest.groups.len(), 1);
        assert!(manifest.groups[0].template);
        assert_eq!(manifest.pods[1].namespace, "default");
        assert!(manifest.pods[1].node.is_none());
    }

    #[test]
    fn test_duplicate_group() {
        let content = r#"
groups:
  - {id: a, min: 0, max: 1, shape: {cpu: 1, memory: 1}}
  - {id: a, min: 0, max: 1, shape: {cpu: 1, memory: 1}}
"#;
        assert!(matches!(
            parse_manifest(content),
            Err(ManifestError::DuplicateNodeGroup(id)) if id == "a"
        ));
    }

    #[test]
    fn test_invalid_sizes() {
        let content = "groups:\n  - {id: a, min: 3, max: 1, shape: {cpu: 1, memory: 1}}\n";
        assert!(matches!(parse_manifest(content), Err(ManifestError::InvalidSize { .. })));
    }

    #[test]
    fn test_pod_on_unknown_node() {
        let content = "pods:\n  - {name: p, node: nowhere}\n";
        assert!(matches!(parse_manifest(content), Err(ManifestError::UnknownNode(_, _))));
    }

    #[test]
    fn test_seed_cluster() {
        let seeded = parse_manifest(MANIFEST).unwrap().seed();
        let nodes = seeded.cluster.all_nodes().unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.is_ready()));
        assert_eq!(seeded.cluster.unschedulable_pods().unwrap().len(), 1);

        let group = seeded
            .cloud_provider
            .node_group_for_node(&nodes[0])
            .unwrap()
            .unwrap();
        assert_eq!(group.id(), "ng1");
        assert!(group.template_node().is_ok());
    }

    #[tokio::test]
    async fn test_hooks_follow_instances() {
        let seeded = parse_manifest(MANIFEST).unwrap().seed();
        let group = seeded.cloud_provider.group("ng1").unwrap();

        group.increase_size(1).await.unwrap();
        let node = seeded.cluster.node("ng1-2").unwrap();
        assert_eq!(node.spec.provider_id, group.instance_id(2));

        group.delete_nodes(&[node]).await.unwrap();
        assert!(seeded.cluster.node("ng1-2").is_none());
        assert_eq!(group.current_target(), 2);
    }
}
