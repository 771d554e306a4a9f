//! Cluster object model
//!
//! Minimal, serde-friendly renditions of the cluster objects the autoscaler
//! reads and writes: nodes, pods, disruption budgets and workload controllers.

pub mod node;
pub mod pod;
pub mod policy;
pub mod resources;

use serde::{Deserialize, Serialize};

pub use node::{Node, NodeCondition, NodeConditionType, Readiness, Taint, TaintEffect};
pub use pod::{Pod, PodPhase, RestartPolicy, Toleration, TolerationOperator, VolumeSource};
pub use policy::{Controller, ControllerKind, DaemonSet, PodDisruptionBudget};
pub use resources::{LabelSelector, ObjectMeta, OwnerReference, ResourceList};

/// Pod annotation marking a pod safe (or unsafe) to evict
pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

/// Node annotation excluding the node from scale-down
pub const SCALE_DOWN_DISABLED_ANNOTATION: &str =
    "cluster-autoscaler.kubernetes.io/scale-down-disabled";

/// Annotation the kubelet sets on mirror pods
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Namespace of the cluster system components
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Status of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}
