//! Workload controllers and disruption budgets

use serde::{Deserialize, Serialize};

use super::pod::{Pod, PodSpec};
use super::resources::{LabelSelector, ObjectMeta};

/// Limits voluntary evictions of the pods it selects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodDisruptionBudget {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: PodDisruptionBudgetSpec,

    #[serde(default)]
    pub status: PodDisruptionBudgetStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodDisruptionBudgetSpec {
    /// Pods covered by the budget
    #[serde(default)]
    pub selector: LabelSelector,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodDisruptionBudgetStatus {
    /// How many more pods may be disrupted right now
    #[serde(rename = "disruptionsAllowed")]
    #[serde(default)]
    pub disruptions_allowed: i32,
}

impl PodDisruptionBudget {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        selector: LabelSelector,
        disruptions_allowed: i32,
    ) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: PodDisruptionBudgetSpec { selector },
            status: PodDisruptionBudgetStatus {
                disruptions_allowed,
            },
        }
    }

    /// Whether the budget covers the pod
    pub fn covers(&self, pod: &Pod) -> bool {
        self.metadata.namespace == pod.metadata.namespace
            && self.spec.selector.matches(&pod.metadata.labels)
    }
}

/// Runs one pod on every matching node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSet {
    pub metadata: ObjectMeta,

    /// Template of the pods created on each node
    #[serde(default)]
    pub template: PodSpec,
}

impl DaemonSet {
    /// Build the pod this daemon set would place on `node_name`
    pub fn pod_for_node(&self, node_name: &str) -> Pod {
        let mut pod = Pod::new(
            self.metadata.namespace.clone(),
            format!("{}-{}", self.metadata.name, node_name),
        )
        .owned_by("DaemonSet", self.metadata.name.clone());
        pod.spec = self.template.clone();
        pod.spec.node_name = node_name.to_string();
        pod
    }
}

/// Kinds of workload controllers the drain logic understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerKind {
    ReplicationController,
    ReplicaSet,
    DaemonSet,
    Job,
    StatefulSet,
    Other(String),
}

impl From<&str> for ControllerKind {
    fn from(kind: &str) -> Self {
        match kind {
            "ReplicationController" => Self::ReplicationController,
            "ReplicaSet" => Self::ReplicaSet,
            "DaemonSet" => Self::DaemonSet,
            "Job" => Self::Job,
            "StatefulSet" => Self::StatefulSet,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A replicated workload controller as seen by the drain logic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Controller {
    pub metadata: ObjectMeta,

    /// Kind, e.g. "ReplicaSet"
    pub kind: String,

    /// Replicas currently running
    #[serde(default)]
    pub replicas: i32,
}

impl Controller {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        replicas: i32,
    ) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            kind: kind.into(),
            replicas,
        }
    }
}
