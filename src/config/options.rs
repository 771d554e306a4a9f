//! Autoscaling options
//!
//! Every tunable of the control loop. Durations are written as whole seconds.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Node label carrying the accelerator type
pub const DEFAULT_GPU_LABEL: &str = "cloud.google.com/gke-accelerator";

/// Serde helpers for durations expressed in seconds
pub(crate) mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(secs))
    }
}

/// How scale-up picks among viable node groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpanderStrategy {
    /// Any viable group
    #[default]
    Random,
    /// The group that schedules the most pending pods
    MostPods,
    /// The group that leaves the least CPU idle
    LeastWaste,
}

/// Options of the autoscaling loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalingOptions {
    /// Time between iterations
    #[serde(with = "duration_secs")]
    pub scan_interval: Duration,

    pub scale_down_enabled: bool,

    /// Nodes below this utilization are considered for removal
    pub scale_down_utilization_threshold: f64,

    /// How long a ready node must be unneeded before removal
    #[serde(with = "duration_secs")]
    pub scale_down_unneeded_time: Duration,

    /// How long an unready node must be unneeded before removal
    #[serde(with = "duration_secs")]
    pub scale_down_unready_time: Duration,

    #[serde(with = "duration_secs")]
    pub scale_down_delay_after_add: Duration,

    #[serde(with = "duration_secs")]
    pub scale_down_delay_after_delete: Duration,

    #[serde(with = "duration_secs")]
    pub scale_down_delay_after_failure: Duration,

    /// Cap on non-empty nodes simulated per iteration; 0 disables the cap
    pub scale_down_non_empty_candidates_count: usize,

    /// Extra candidates simulated, as a fraction of all nodes
    pub scale_down_candidates_pool_ratio: f64,

    /// Minimum size of the extra candidate pool
    pub scale_down_candidates_pool_min_count: usize,

    /// Maximum empty nodes deleted at once
    pub max_empty_bulk_delete: usize,

    /// Cluster size limit; 0 means unlimited
    pub max_nodes_total: usize,

    /// How long a node may take to register after its instance is created
    #[serde(with = "duration_secs")]
    pub max_node_provision_time: Duration,

    pub max_total_unready_percentage: f64,

    pub ok_total_unready_count: usize,

    /// Cap on pod termination grace periods during drain
    pub max_graceful_termination_sec: i64,

    pub skip_nodes_with_system_pods: bool,

    pub skip_nodes_with_local_storage: bool,

    /// Controllers below this many replicas block draining
    pub min_replica_count: i32,

    pub ignore_daemonsets_utilization: bool,

    pub ignore_mirror_pods_utilization: bool,

    pub expander: ExpanderStrategy,

    #[serde(with = "duration_secs")]
    pub initial_node_group_backoff_duration: Duration,

    #[serde(with = "duration_secs")]
    pub max_node_group_backoff_duration: Duration,

    #[serde(with = "duration_secs")]
    pub node_group_backoff_reset_timeout: Duration,

    /// How long a node found unremovable is not re-simulated
    #[serde(with = "duration_secs")]
    pub unremovable_node_recheck_timeout: Duration,

    /// Wait for empty node deletions to be confirmed
    #[serde(with = "duration_secs")]
    pub max_cloud_provider_node_deletion_time: Duration,

    #[serde(with = "duration_secs")]
    pub max_kubernetes_empty_node_deletion_time: Duration,

    /// Deadline for evicting every pod of a node
    #[serde(with = "duration_secs")]
    pub max_pod_eviction_time: Duration,

    /// Pause between eviction attempts of one pod
    #[serde(with = "duration_secs")]
    pub eviction_retry_time: Duration,

    /// Extra wait for evicted pods to terminate
    #[serde(with = "duration_secs")]
    pub pod_eviction_headroom: Duration,

    #[serde(with = "duration_secs")]
    pub pod_gone_poll_interval: Duration,

    /// Pods deleted longer ago than this are ignored by drain
    #[serde(with = "duration_secs")]
    pub pod_long_termination_timeout: Duration,

    /// Node label carrying the accelerator type
    pub gpu_label: String,
}

impl Default for AutoscalingOptions {
    fn default() -> Self {
        Self {
            scan_interval: Duration::seconds(10),
            scale_down_enabled: true,
            scale_down_utilization_threshold: 0.5,
            scale_down_unneeded_time: Duration::minutes(10),
            scale_down_unready_time: Duration::minutes(20),
            scale_down_delay_after_add: Duration::minutes(10),
            scale_down_delay_after_delete: Duration::zero(),
            scale_down_delay_after_failure: Duration::minutes(3),
            scale_down_non_empty_candidates_count: 30,
            scale_down_candidates_pool_ratio: 0.1,
            scale_down_candidates_pool_min_count: 50,
            max_empty_bulk_delete: 10,
            max_nodes_total: 0,
            max_node_provision_time: Duration::minutes(15),
            max_total_unready_percentage: 45.0,
            ok_total_unready_count: 3,
            max_graceful_termination_sec: 600,
            skip_nodes_with_system_pods: true,
            skip_nodes_with_local_storage: true,
            min_replica_count: 0,
            ignore_daemonsets_utilization: false,
            ignore_mirror_pods_utilization: false,
            expander: ExpanderStrategy::Random,
            initial_node_group_backoff_duration: Duration::minutes(5),
            max_node_group_backoff_duration: Duration::minutes(30),
            node_group_backoff_reset_timeout: Duration::hours(3),
            unremovable_node_recheck_timeout: Duration::minutes(5),
            max_cloud_provider_node_deletion_time: Duration::minutes(5),
            max_kubernetes_empty_node_deletion_time: Duration::minutes(3),
            max_pod_eviction_time: Duration::minutes(2),
            eviction_retry_time: Duration::seconds(10),
            pod_eviction_headroom: Duration::seconds(30),
            pod_gone_poll_interval: Duration::seconds(5),
            pod_long_termination_timeout: Duration::minutes(2),
            gpu_label: DEFAULT_GPU_LABEL.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "scale_down_unneeded_time: 60\nexpander: least-waste\n";
        let options: AutoscalingOptions = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(options.scale_down_unneeded_time, Duration::minutes(1));
        assert_eq!(options.expander, ExpanderStrategy::LeastWaste);
        assert_eq!(options.max_empty_bulk_delete, 10);
        assert_eq!(options.gpu_label, DEFAULT_GPU_LABEL);
    }

    #[test]
    fn test_durations_serialize_as_seconds() {
        let options = AutoscalingOptions::default();
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["max_node_provision_time"], 900);
        assert_eq!(json["expander"], "random");
    }
}
