//! Cloud provider capability contracts
//!
//! The core only talks to node groups through the [`NodeGroup`] and
//! [`CloudProvider`] traits. Concrete providers are composed behind them and
//! selected at startup; the in-memory provider in [`memory`] drives the
//! binary and the tests.

pub mod memory;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::resources::RESOURCE_NVIDIA_GPU;
use crate::api::Node;

pub use memory::{InMemoryCloudProvider, InMemoryNodeGroup};

/// Limit name for CPU, in cores
pub const LIMIT_CPU: &str = "cpu";

/// Limit name for memory, in bytes
pub const LIMIT_MEMORY: &str = "memory";

/// Errors from node group operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudProviderError {
    #[error("not implemented")]
    NotImplemented,

    #[error("node group '{0}' not found")]
    NodeGroupNotFound(String),

    #[error("size increase too large: desired {desired}, max {max}")]
    MaxSizeExceeded { desired: usize, max: usize },

    #[error("size decrease too large: desired {desired}, min {min}")]
    MinSizeReached { desired: usize, min: usize },

    #[error("{0}")]
    Api(String),
}

/// A cloud-managed set of homogeneous instances
#[async_trait]
pub trait NodeGroup: Send + Sync + std::fmt::Debug {
    /// Unique identifier of the group
    fn id(&self) -> &str;

    fn min_size(&self) -> usize;

    fn max_size(&self) -> usize;

    /// Size the cloud provider is currently driving towards
    async fn target_size(&self) -> Result<usize, CloudProviderError>;

    /// Grow the target size by `delta` instances
    async fn increase_size(&self, delta: usize) -> Result<(), CloudProviderError>;

    /// Delete the given nodes and shrink the target size accordingly
    async fn delete_nodes(&self, nodes: &[Node]) -> Result<(), CloudProviderError>;

    /// Shrink the target size by `delta` without deleting any running instance.
    /// Used to drop instances that were requested but never materialized.
    async fn decrease_target_size(&self, delta: usize) -> Result<(), CloudProviderError>;

    /// Provider ids of every instance in the group
    async fn nodes(&self) -> Result<Vec<String>, CloudProviderError>;

    /// A node shaped like the ones this group would create
    fn template_node(&self) -> Result<Node, CloudProviderError> {
        Err(CloudProviderError::NotImplemented)
    }

    /// Whether the group exists at the provider
    fn exist(&self) -> bool {
        true
    }

    /// Whether the group was created by the autoscaler
    fn autoprovisioned(&self) -> bool {
        false
    }
}

/// Access to the node groups of one cloud
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    /// All node groups managed by the autoscaler
    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>>;

    /// The group a node belongs to; `None` for nodes outside autoscaled groups
    fn node_group_for_node(
        &self,
        node: &Node,
    ) -> Result<Option<Arc<dyn NodeGroup>>, CloudProviderError>;

    /// Cluster-wide resource limits; `None` when no limits are configured
    fn get_resource_limiter(&self) -> Result<Option<ResourceLimiter>, CloudProviderError>;

    /// Refresh cached provider state before an iteration
    async fn refresh(&self) -> Result<(), CloudProviderError>;

    /// Instance id of the machine backing a node
    fn get_instance_id(&self, node: &Node) -> String {
        node.spec.provider_id.clone()
    }
}

/// Minimum and maximum totals per resource for the whole cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimiter {
    /// Resource name to minimum total
    #[serde(default)]
    pub min: HashMap<String, i64>,

    /// Resource name to maximum total
    #[serde(default)]
    pub max: HashMap<String, i64>,
}

impl ResourceLimiter {
    pub fn new(min: HashMap<String, i64>, max: HashMap<String, i64>) -> Self {
        Self { min, max }
    }

    /// Every resource with a configured limit, sorted
    pub fn get_resources(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self.min.keys().chain(self.max.keys()).collect();
        names.into_iter().cloned().collect()
    }

    /// Minimum total, zero when not configured
    pub fn get_min(&self, resource: &str) -> i64 {
        self.min.get(resource).copied().unwrap_or(0)
    }

    /// Maximum total, zero when not configured
    pub fn get_max(&self, resource: &str) -> i64 {
        self.max.get(resource).copied().unwrap_or(0)
    }

    pub fn has_max(&self, resource: &str) -> bool {
        self.max.contains_key(resource)
    }
}

/// Whether a limiter resource name refers to an accelerator type
pub fn is_gpu_resource(resource: &str) -> bool {
    resource != LIMIT_CPU && resource != LIMIT_MEMORY
}

/// Whether any accelerator limits are configured
pub fn contains_gpu_resources(resources: &[String]) -> bool {
    resources.iter().any(|r| is_gpu_resource(r))
}

/// Accelerator type and count of a node.
///
/// The type comes from `gpu_label`; nodes without the label have no
/// accelerators. Returns the label value with the allocatable count, which may
/// be zero while the device plugin has not reported yet.
pub fn node_gpu(node: &Node, gpu_label: &str) -> Option<(String, i64)> {
    let gpu_type = node.metadata.labels.get(gpu_label)?;
    let count = node
        .status
        .allocatable
        .get(RESOURCE_NVIDIA_GPU)
        .unwrap_or(0);
    Some((gpu_type.clone(), count))
}
