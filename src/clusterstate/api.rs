//! Status snapshot published by the cluster state registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a status condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Health,
    ScaleUp,
    ScaleDown,
}

/// Value of a status condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    Healthy,
    Unhealthy,
    InProgress,
    NoActivity,
    Backoff,
    CandidatesPresent,
    NoCandidates,
}

/// One condition of the cluster or of a node group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    pub status: ConditionStatus,

    /// Counters behind the status
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// When the condition was computed
    #[serde(rename = "lastProbeTime")]
    pub last_probe_time: DateTime<Utc>,

    /// When the status last changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl AutoscalerCondition {
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        message: String,
        probe_time: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type,
            status,
            message,
            reason: String::new(),
            last_probe_time: probe_time,
            last_transition_time: probe_time,
        }
    }
}

/// Conditions of one node group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupStatus {
    /// Node group id
    #[serde(rename = "providerID")]
    pub provider_id: String,

    pub conditions: Vec<AutoscalerCondition>,
}

/// Full status snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerStatus {
    #[serde(rename = "nodeGroupStatuses")]
    pub node_group_statuses: Vec<NodeGroupStatus>,

    #[serde(rename = "clusterwideConditions")]
    pub clusterwide_conditions: Vec<AutoscalerCondition>,
}

impl AutoscalerStatus {
    /// Cluster-wide condition of a type
    pub fn clusterwide(&self, condition_type: ConditionType) -> Option<&AutoscalerCondition> {
        self.clusterwide_conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Condition of a type for one node group
    pub fn node_group(&self, id: &str, condition_type: ConditionType) -> Option<&AutoscalerCondition> {
        self.node_group_statuses
            .iter()
            .find(|s| s.provider_id == id)
            .and_then(|s| s.conditions.iter().find(|c| c.condition_type == condition_type))
    }
}

/// Keep transition times of conditions whose status did not change
pub(crate) fn carry_over_transitions(old: &AutoscalerStatus, new: &mut AutoscalerStatus) {
    fn carry(old: &[AutoscalerCondition], new: &mut [AutoscalerCondition]) {
        for condition in new.iter_mut() {
            condition.last_transition_time = match old
                .iter()
                .find(|c| c.condition_type == condition.condition_type)
            {
                Some(previous) if previous.status == condition.status => previous.last_transition_time,
                _ => condition.last_probe_time,
            };
        }
    }

    carry(&old.clusterwide_conditions, &mut new.clusterwide_conditions);
    for group in new.node_group_statuses.iter_mut() {
        if let Some(previous) = old
            .node_group_statuses
            .iter()
            .find(|s| s.provider_id == group.provider_id)
        {
            carry(&previous.conditions, &mut group.conditions);
        }
    }
}
