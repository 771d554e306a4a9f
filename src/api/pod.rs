//! Pod resource - a unit of work bound to (or waiting for) a node

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::{Taint, TaintEffect};
use super::resources::{ObjectMeta, OwnerReference, ResourceList};
use super::{ConditionStatus, MIRROR_POD_ANNOTATION};

/// A Pod in the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    /// Metadata about the pod
    pub metadata: ObjectMeta,

    /// Pod specification
    #[serde(default)]
    pub spec: PodSpec,

    /// Current pod status
    #[serde(default)]
    pub status: PodStatus,
}

/// Pod specification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    /// Node the pod is bound to; empty while unscheduled
    #[serde(rename = "nodeName")]
    #[serde(default)]
    pub node_name: String,

    /// Containers in the pod
    #[serde(default)]
    pub containers: Vec<Container>,

    /// Volumes mounted by the pod
    #[serde(default)]
    pub volumes: Vec<Volume>,

    /// Restart policy
    #[serde(rename = "restartPolicy")]
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Labels a node must carry to host the pod
    #[serde(rename = "nodeSelector")]
    #[serde(default)]
    pub node_selector: HashMap<String, String>,

    /// Taints this pod tolerates
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Grace period requested for termination
    #[serde(rename = "terminationGracePeriodSeconds")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

/// A container and its resource requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    pub name: String,

    #[serde(default)]
    pub requests: ResourceList,
}

/// A volume mounted by a pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,

    /// Where the data lives
    pub source: VolumeSource,
}

/// Backing store of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    EmptyDir,
    HostPath { path: String },
    ConfigMap { name: String },
    Secret { name: String },
    PersistentVolumeClaim { claim_name: String },
}

/// Restart policy of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

/// Toleration operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

/// A toleration for node taints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Toleration {
    /// Taint key; empty with `Exists` tolerates everything
    #[serde(default)]
    pub key: String,

    #[serde(default)]
    pub operator: TolerationOperator,

    #[serde(default)]
    pub value: String,

    /// Effect to tolerate; `None` tolerates all effects
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Whether this toleration covers the taint
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => self.key == taint.key && self.value == taint.value,
        }
    }
}

/// Phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Pod condition types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodConditionType {
    PodScheduled,
    Ready,
}

/// A pod condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: PodConditionType,

    pub status: ConditionStatus,

    #[serde(default)]
    pub reason: String,
}

/// Current status of a Pod
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,

    #[serde(default)]
    pub conditions: Vec<PodCondition>,
}

impl Pod {
    /// Create a pending pod with no requests
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: PodSpec::default(),
            status: PodStatus::default(),
        }
    }

    /// Add a container requesting CPU (millicores) and memory (bytes)
    pub fn with_requests(mut self, cpu_millis: i64, memory: i64) -> Self {
        let index = self.spec.containers.len();
        self.spec.containers.push(Container {
            name: format!("c{}", index),
            requests: ResourceList::cpu_memory(cpu_millis, memory),
        });
        self
    }

    /// Bind the pod to a node and mark it running
    pub fn on_node(mut self, node_name: impl Into<String>) -> Self {
        self.spec.node_name = node_name.into();
        self.status.phase = PodPhase::Running;
        self
    }

    /// Set the managing controller
    pub fn owned_by(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.metadata
            .owner_references
            .push(OwnerReference::controller(kind, name));
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

    /// Add a volume
    pub fn with_volume(mut self, name: impl Into<String>, source: VolumeSource) -> Self {
        self.spec.volumes.push(Volume {
            name: name.into(),
            source,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Unique key, "namespace/name"
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    /// Sum of all container requests
    pub fn requests(&self) -> ResourceList {
        let mut total = ResourceList::new();
        for container in &self.spec.containers {
            total.add(&container.requests);
        }
        total
    }

    /// The managing controller, if any
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.metadata.owner_references.iter().find(|r| r.controller)
    }

    /// Static pods mirrored into the API by the kubelet
    pub fn is_mirror(&self) -> bool {
        self.metadata.annotations.contains_key(MIRROR_POD_ANNOTATION)
    }

    /// Pods created by a DaemonSet
    pub fn is_daemonset_pod(&self) -> bool {
        self.controller_ref()
            .map(|r| r.kind == "DaemonSet")
            .unwrap_or(false)
    }

    /// Whether the pod keeps data on the node itself
    pub fn has_local_storage(&self) -> bool {
        self.spec
            .volumes
            .iter()
            .any(|v| matches!(v.source, VolumeSource::EmptyDir | VolumeSource::HostPath { .. }))
    }

    /// Whether the pod has finished and will never run again
    pub fn is_terminal(&self) -> bool {
        match self.spec.restart_policy {
            RestartPolicy::Never => {
                matches!(self.status.phase, PodPhase::Succeeded | PodPhase::Failed)
            }
            RestartPolicy::OnFailure => self.status.phase == PodPhase::Succeeded,
            RestartPolicy::Always => self.status.phase == PodPhase::Failed,
        }
    }

    /// Whether the pod tolerates the taint
    pub fn tolerates(&self, taint: &Taint) -> bool {
        self.spec.tolerations.iter().any(|t| t.tolerates(taint))
    }

    /// Whether the scheduler reported the pod as unschedulable
    pub fn is_unschedulable(&self) -> bool {
        self.spec.node_name.is_empty()
            && self.status.conditions.iter().any(|c| {
                c.condition_type == PodConditionType::PodScheduled
                    && c.status == ConditionStatus::False
                    && c.reason == "Unschedulable"
            })
    }

    /// Mark the pod as rejected by the scheduler
    pub fn mark_unschedulable(mut self) -> Self {
        self.status.conditions.push(PodCondition {
            condition_type: PodConditionType::PodScheduled,
            status: ConditionStatus::False,
            reason: "Unschedulable".to_string(),
        });
        self
    }

    /// Whether deletion started before `cutoff`
    pub fn deleted_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.metadata
            .deletion_timestamp
            .map(|t| t < cutoff)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_requests_sum_containers() {
        let pod = Pod::new("default", "web")
            .with_requests(100, 256)
            .with_requests(200, 256);
        let requests = pod.requests();
        assert_eq!(requests.get("cpu"), Some(300));
        assert_eq!(requests.get("memory"), Some(512));
        assert_eq!(pod.key(), "default/web");
    }

    #[test]
    fn test_terminal_phases() {
        let mut pod = Pod::new("default", "job");
        pod.spec.restart_policy = RestartPolicy::Never;
        pod.status.phase = PodPhase::Succeeded;
        assert!(pod.is_terminal());

        pod.spec.restart_policy = RestartPolicy::OnFailure;
        pod.status.phase = PodPhase::Failed;
        assert!(!pod.is_terminal());

        pod.spec.restart_policy = RestartPolicy::Always;
        assert!(pod.is_terminal());
        pod.status.phase = PodPhase::Running;
        assert!(!pod.is_terminal());
    }

    #[test]
    fn test_toleration_matching() {
        let taint = Taint {
            key: "dedicated".to_string(),
            value: "gpu".to_string(),
            effect: TaintEffect::NoSchedule,
        };

        let exact = Toleration {
            key: "dedicated".to_string(),
            operator: TolerationOperator::Equal,
            value: "gpu".to_string(),
            effect: Some(TaintEffect::NoSchedule),
        };
        assert!(exact.tolerates(&taint));

        let wildcard = Toleration {
            operator: TolerationOperator::Exists,
            ..Default::default()
        };
        assert!(wildcard.tolerates(&taint));

        let wrong_effect = Toleration {
            effect: Some(TaintEffect::NoExecute),
            ..exact
        };
        assert!(!wrong_effect.tolerates(&taint));
    }

    #[test]
    fn test_local_storage_and_controller() {
        let pod = Pod::new("default", "cache")
            .owned_by("ReplicaSet", "cache-rs")
            .with_volume("scratch", VolumeSource::EmptyDir);
        assert!(pod.has_local_storage());
        assert_eq!(pod.controller_ref().map(|r| r.kind.as_str()), Some("ReplicaSet"));
        assert!(!pod.is_daemonset_pod());
    }
}
