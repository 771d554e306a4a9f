//! Cluster API surface consumed by the autoscaler
//!
//! - [`KubeClient`]: live calls used while tainting and draining nodes
//! - [`ListerRegistry`]: cached, read-only listings refreshed every iteration
//! - [`events`]: fire-and-forget event recording
//! - [`taints`]: the to-be-deleted taint

pub mod events;
pub mod memory;
pub mod taints;

use async_trait::async_trait;
use thiserror::Error;

use crate::api::{Controller, DaemonSet, Node, Pod, PodDisruptionBudget};

pub use events::{EventRecorder, EventType, LogEventRecorder, RecordedEvent, RecordingEventRecorder};
pub use memory::InMemoryCluster;

/// Errors from cluster API calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Live cluster API calls
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch the current version of a node
    async fn get_node(&self, name: &str) -> Result<Node, ApiError>;

    /// Replace a node (taints and spec)
    async fn update_node(&self, node: &Node) -> Result<(), ApiError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ApiError>;

    /// Request eviction of a pod through the eviction API
    async fn evict_pod(&self, pod: &Pod, grace_period_seconds: i64) -> Result<(), ApiError>;

    /// Fetch a workload controller by kind, e.g. "ReplicaSet"
    async fn get_controller(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Controller, ApiError>;

    /// Pods bound to a node
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ApiError>;
}

/// Read-only cached listings
pub trait ListerRegistry: Send + Sync {
    fn all_nodes(&self) -> Result<Vec<Node>, ApiError>;

    fn ready_nodes(&self) -> Result<Vec<Node>, ApiError>;

    /// Pods bound to a node
    fn scheduled_pods(&self) -> Result<Vec<Pod>, ApiError>;

    /// Pods the scheduler could not place
    fn unschedulable_pods(&self) -> Result<Vec<Pod>, ApiError>;

    fn pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>, ApiError>;

    fn daemonsets(&self) -> Result<Vec<DaemonSet>, ApiError>;
}
