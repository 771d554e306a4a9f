//! Node resource - represents a machine registered with the cluster
//!
//! A Node:
//! - Is backed by a cloud instance identified by its provider id
//! - Reports capacity and allocatable resources
//! - Reports readiness through status conditions
//! - May carry taints that keep pods away

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::resources::{ObjectMeta, ResourceList, RESOURCE_NVIDIA_GPU, RESOURCE_PODS};
use super::{ConditionStatus, SCALE_DOWN_DISABLED_ANNOTATION};

/// How long after creation a node that is not ready counts as still starting
pub const NODE_START_GRACE: i64 = 120;

/// A Node in the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Metadata about the node
    pub metadata: ObjectMeta,

    /// Node specification
    #[serde(default)]
    pub spec: NodeSpec,

    /// Current node status
    #[serde(default)]
    pub status: NodeStatus,
}

/// Node specification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Cloud instance backing this node, e.g. "aws:///us-east-1a/i-0abc"
    #[serde(rename = "providerID")]
    #[serde(default)]
    pub provider_id: String,

    /// Whether new pods are kept off this node
    #[serde(default)]
    pub unschedulable: bool,

    /// Taints applied to the node
    #[serde(default)]
    pub taints: Vec<Taint>,
}

/// Current status of a Node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Total resources of the machine
    #[serde(default)]
    pub capacity: ResourceList,

    /// Resources available to pods
    #[serde(default)]
    pub allocatable: ResourceList,

    /// Detailed conditions
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

/// Condition types reported by nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeConditionType {
    Ready,
    OutOfDisk,
    NetworkUnavailable,
    MemoryPressure,
    DiskPressure,
}

/// A node condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub condition_type: NodeConditionType,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Last transition time
    #[serde(rename = "lastTransitionTime")]
    #[serde(default = "Utc::now")]
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    #[serde(default)]
    pub reason: String,
}

/// Effect of a taint on pods that do not tolerate it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A taint on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,

    #[serde(default)]
    pub value: String,

    pub effect: TaintEffect,
}

/// Readiness as derived from node conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Whether the node can accept pods
    pub ready: bool,

    /// Latest transition among the readiness-related conditions
    pub last_transition: DateTime<Utc>,
}

impl Node {
    /// Create a new node with no resources and no conditions
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: NodeSpec::default(),
            status: NodeStatus::default(),
        }
    }

    /// Set the backing instance
    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.spec.provider_id = provider_id.into();
        self
    }

    /// Set capacity and allocatable CPU (millicores) and memory (bytes)
    pub fn with_capacity(mut self, cpu_millis: i64, memory: i64) -> Self {
        let list = ResourceList::cpu_memory(cpu_millis, memory).with(RESOURCE_PODS, 110);
        self.status.capacity = list.clone();
        self.status.allocatable = list;
        self
    }

    /// Set the number of accelerators
    pub fn with_gpus(mut self, count: i64) -> Self {
        self.status.capacity.insert(RESOURCE_NVIDIA_GPU, count);
        self.status.allocatable.insert(RESOURCE_NVIDIA_GPU, count);
        self
    }

    /// Set the creation timestamp
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.metadata.creation_timestamp = at;
        self
    }

    /// Set the Ready condition
    pub fn with_ready(mut self, ready: bool, transition: DateTime<Utc>) -> Self {
        let status = if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        self.set_condition(NodeConditionType::Ready, status, transition);
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    /// Add a taint
    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.spec.taints.push(taint);
        self
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Replace or add a condition
    pub fn set_condition(
        &mut self,
        condition_type: NodeConditionType,
        status: ConditionStatus,
        transition: DateTime<Utc>,
    ) {
        self.status
            .conditions
            .retain(|c| c.condition_type != condition_type);
        self.status.conditions.push(NodeCondition {
            condition_type,
            status,
            last_transition_time: transition,
            reason: String::new(),
        });
    }

    /// Derive readiness from the Ready, OutOfDisk and NetworkUnavailable conditions.
    ///
    /// Returns `None` when the node reports no Ready condition at all.
    pub fn readiness(&self) -> Option<Readiness> {
        let mut ready_found = false;
        let mut can_be_ready = true;
        let mut last_transition = DateTime::<Utc>::MIN_UTC;

        for condition in &self.status.conditions {
            let blocks = match condition.condition_type {
                NodeConditionType::Ready => {
                    ready_found = true;
                    condition.status != ConditionStatus::True
                }
                NodeConditionType::OutOfDisk | NodeConditionType::NetworkUnavailable => {
                    condition.status == ConditionStatus::True
                }
                _ => continue,
            };
            if blocks {
                can_be_ready = false;
            }
            if condition.last_transition_time > last_transition {
                last_transition = condition.last_transition_time;
            }
        }

        ready_found.then_some(Readiness {
            ready: can_be_ready,
            last_transition,
        })
    }

    /// Whether the node is ready, treating missing information as not ready
    pub fn is_ready(&self) -> bool {
        self.readiness().map(|r| r.ready).unwrap_or(false)
    }

    /// Whether the node is still in its start-up phase.
    ///
    /// A node is starting while a blocking condition flipped within the first
    /// two minutes of its life.
    pub fn is_still_starting(&self) -> bool {
        let grace = Duration::seconds(NODE_START_GRACE);
        let created = self.metadata.creation_timestamp;

        self.status.conditions.iter().any(|condition| {
            let blocking = match condition.condition_type {
                NodeConditionType::Ready => condition.status != ConditionStatus::True,
                NodeConditionType::OutOfDisk | NodeConditionType::NetworkUnavailable => {
                    condition.status == ConditionStatus::True
                }
                _ => false,
            };
            blocking && condition.last_transition_time - created < grace
        })
    }

    /// Whether scale-down has been disabled on this node by annotation
    pub fn has_scale_down_disabled(&self) -> bool {
        self.metadata
            .has_annotation(SCALE_DOWN_DISABLED_ANNOTATION, "true")
    }

    /// Find a taint by key
    pub fn taint(&self, key: &str) -> Option<&Taint> {
        self.spec.taints.iter().find(|t| t.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builder() {
        let node = Node::new("node-1")
            .with_provider_id("test:///node-1")
            .with_capacity(2000, 4096)
            .with_label("zone", "a");

        assert_eq!(node.name(), "node-1");
        assert_eq!(node.spec.provider_id, "test:///node-1");
        assert_eq!(node.status.allocatable.get("cpu"), Some(2000));
        assert_eq!(node.metadata.labels.get("zone").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_readiness_requires_ready_condition() {
        let node = Node::new("node-1");
        assert!(node.readiness().is_none());
        assert!(!node.is_ready());
    }

    #[test]
    fn test_readiness_blocked_by_network() {
        let now = Utc::now();
        let mut node = Node::new("node-1").with_ready(true, now - Duration::minutes(5));
        assert!(node.is_ready());

        node.set_condition(NodeConditionType::NetworkUnavailable, ConditionStatus::True, now);
        let readiness = node.readiness().unwrap();
        assert!(!readiness.ready);
        assert_eq!(readiness.last_transition, now);
    }

    #[test]
    fn test_still_starting() {
        let created = Utc::now() - Duration::minutes(10);

        let starting = Node::new("starting")
            .created_at(created)
            .with_ready(false, created + Duration::seconds(30));
        assert!(starting.is_still_starting());

        let broken_later = Node::new("broken")
            .created_at(created)
            .with_ready(false, created + Duration::minutes(5));
        assert!(!broken_later.is_still_starting());

        let ready = Node::new("ready")
            .created_at(created)
            .with_ready(true, created + Duration::seconds(30));
        assert!(!ready.is_still_starting());
    }

    #[test]
    fn test_scale_down_disabled_annotation() {
        let node = Node::new("node-1").with_annotation(SCALE_DOWN_DISABLED_ANNOTATION, "true");
        assert!(node.has_scale_down_disabled());
        assert!(!Node::new("node-2").has_scale_down_disabled());
    }
}
