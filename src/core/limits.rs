//! Resource headroom accounting for scale-down
//!
//! A cluster-wide minimum per resource caps how much capacity scale-down may
//! remove. The headroom is computed once per iteration and then consumed by
//! the nodes picked for deletion.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::api::resources::{RESOURCE_CPU, RESOURCE_MEMORY, RESOURCE_NVIDIA_GPU};
use crate::api::Node;
use crate::cloudprovider::{
    contains_gpu_resources, is_gpu_resource, node_gpu, CloudProvider, NodeGroup, ResourceLimiter,
    LIMIT_CPU, LIMIT_MEMORY,
};
use crate::config::AutoscalingOptions;
use crate::errors::AutoscalerError;
use crate::kube::taints::get_to_be_deleted_time;

/// Headroom of a resource that could not be computed
pub const SCALE_DOWN_LIMIT_UNKNOWN: i64 = i64::MIN;

/// Resources a node deletion would remove
pub type ScaleDownResourcesDelta = HashMap<String, i64>;

/// Outcome of a limits check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitsCheckResult {
    pub exceeded: bool,
    /// Sorted names of the offending resources
    pub exceeded_resources: Vec<String>,
}

impl LimitsCheckResult {
    fn within_limits() -> Self {
        Self::default()
    }
}

/// Remaining removable amount per limited resource.
///
/// Resources without an entry are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleDownResourcesLimits(HashMap<String, i64>);

impl ScaleDownResourcesLimits {
    pub fn new(limits: HashMap<String, i64>) -> Self {
        Self(limits)
    }

    pub fn get(&self, resource: &str) -> Option<i64> {
        self.0.get(resource).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names of the limited resources, sorted
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.0.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether removing `delta` would break a limit
    pub fn check_delta_within_limits(&self, delta: &ScaleDownResourcesDelta) -> LimitsCheckResult {
        let mut exceeded: Vec<String> = delta
            .iter()
            .filter(|(resource, amount)| match self.0.get(resource.as_str()) {
                Some(&left) => **amount > 0 && (left == SCALE_DOWN_LIMIT_UNKNOWN || **amount > left),
                None => false,
            })
            .map(|(resource, _)| resource.clone())
            .collect();

        if exceeded.is_empty() {
            return LimitsCheckResult::within_limits();
        }
        exceeded.sort();
        LimitsCheckResult {
            exceeded: true,
            exceeded_resources: exceeded,
        }
    }

    /// Consume `delta` from the headroom if it fits; leave it untouched otherwise
    pub fn try_decrement_by_delta(&mut self, delta: &ScaleDownResourcesDelta) -> LimitsCheckResult {
        let result = self.check_delta_within_limits(delta);
        if result.exceeded {
            return result;
        }
        for (resource, amount) in delta {
            if let Some(left) = self.0.get_mut(resource) {
                *left -= amount;
            }
        }
        LimitsCheckResult::within_limits()
    }
}

/// Whether the node was tainted for deletion recently enough that it is
/// still expected to go away
pub fn is_node_being_deleted(node: &Node, now: DateTime<Utc>, options: &AutoscalingOptions) -> bool {
    match get_to_be_deleted_time(node) {
        Some(marked) => {
            let age = now - marked;
            age < options.max_cloud_provider_node_deletion_time
                || age < options.max_kubernetes_empty_node_deletion_time
        }
        None => false,
    }
}

/// Whole cores and bytes of memory of a node's capacity
pub fn node_cores_and_memory(node: &Node) -> (i64, i64) {
    let millis = node.status.capacity.get_or_zero(RESOURCE_CPU);
    let cores = (millis + 999).div_euclid(1000);
    (cores, node.status.capacity.get_or_zero(RESOURCE_MEMORY))
}

/// Accelerator type and count a node has or will have once its device plugin
/// reports. Nodes without the accelerator label have none.
pub fn node_target_gpus(
    node: &Node,
    node_group: Option<&dyn NodeGroup>,
    gpu_label: &str,
) -> Result<Option<(String, i64)>, AutoscalerError> {
    let Some((gpu_type, count)) = node_gpu(node, gpu_label) else {
        return Ok(None);
    };
    if count > 0 {
        return Ok(Some((gpu_type, count)));
    }

    let Some(node_group) = node_group else {
        return Err(AutoscalerError::Internal(format!(
            "node {} has a gpu label but no gpus and belongs to no node group",
            node.name()
        )));
    };
    let template = node_group.template_node()?;
    match template.status.capacity.get(RESOURCE_NVIDIA_GPU) {
        Some(capacity) => Ok(Some((gpu_type, capacity))),
        None => Err(AutoscalerError::Internal(format!(
            "could not find gpu capacity in template of node group {}",
            node_group.id()
        ))),
    }
}

fn compute_above_min(total: i64, min: i64) -> i64 {
    (total - min).max(0)
}

fn scale_down_cores_memory_total(
    nodes: &[Node],
    now: DateTime<Utc>,
    options: &AutoscalingOptions,
) -> (i64, i64) {
    nodes
        .iter()
        .filter(|node| !is_node_being_deleted(node, now, options))
        .map(node_cores_and_memory)
        .fold((0, 0), |(cores, memory), (c, m)| (cores + c, memory + m))
}

fn scale_down_gpus_total(
    nodes: &[Node],
    cloud_provider: &dyn CloudProvider,
    now: DateTime<Utc>,
    options: &AutoscalingOptions,
) -> Result<HashMap<String, i64>, AutoscalerError> {
    let mut result: HashMap<String, i64> = HashMap::new();
    // Nodes of a group share one accelerator profile
    let mut group_cache: HashMap<String, Option<(String, i64)>> = HashMap::new();

    for node in nodes {
        if is_node_being_deleted(node, now, options) {
            continue;
        }
        let node_group = cloud_provider.node_group_for_node(node)?;
        let gpus = match &node_group {
            Some(group) => match group_cache.get(group.id()) {
                Some(cached) => cached.clone(),
                None => {
                    let gpus = node_target_gpus(node, Some(group.as_ref()), &options.gpu_label)?;
                    group_cache.insert(group.id().to_string(), gpus.clone());
                    gpus
                }
            },
            None => node_target_gpus(node, None, &options.gpu_label)?,
        };
        if let Some((gpu_type, count)) = gpus {
            *result.entry(gpu_type).or_insert(0) += count;
        }
    }
    Ok(result)
}

/// Headroom left above the configured minimum of every limited resource.
///
/// Nodes in the middle of deletion are not counted. Accelerators are only
/// summed when accelerator limits exist; if they cannot be summed their
/// headroom is [`SCALE_DOWN_LIMIT_UNKNOWN`].
pub fn compute_scale_down_resources_left_limits(
    nodes: &[Node],
    limiter: &ResourceLimiter,
    cloud_provider: &dyn CloudProvider,
    now: DateTime<Utc>,
    options: &AutoscalingOptions,
) -> ScaleDownResourcesLimits {
    let resources = limiter.get_resources();
    let (total_cores, total_memory) = scale_down_cores_memory_total(nodes, now, options);

    let total_gpus = if contains_gpu_resources(&resources) {
        let totals = scale_down_gpus_total(nodes, cloud_provider, now, options);
        if let Err(err) = &totals {
            warn!("Failed to calculate gpu totals for scale-down limits: {}", err);
        }
        Some(totals)
    } else {
        None
    };

    let mut limits = HashMap::new();
    for resource in resources {
        let min = limiter.get_min(&resource);
        if min <= 0 {
            continue;
        }
        let left = if resource == LIMIT_CPU {
            compute_above_min(total_cores, min)
        } else if resource == LIMIT_MEMORY {
            compute_above_min(total_memory, min)
        } else if is_gpu_resource(&resource) {
            match &total_gpus {
                Some(Ok(totals)) => compute_above_min(totals.get(&resource).copied().unwrap_or(0), min),
                _ => SCALE_DOWN_LIMIT_UNKNOWN,
            }
        } else {
            error!("Scale down limits defined for unsupported resource '{}'", resource);
            continue;
        };
        limits.insert(resource, left);
    }
    ScaleDownResourcesLimits::new(limits)
}

/// Resources removed along with `node`
pub fn compute_scale_down_resources_delta(
    node: &Node,
    node_group: &dyn NodeGroup,
    resources_with_limits: &[String],
    gpu_label: &str,
) -> Result<ScaleDownResourcesDelta, AutoscalerError> {
    let mut delta = ScaleDownResourcesDelta::new();
    let (cores, memory) = node_cores_and_memory(node);
    delta.insert(LIMIT_CPU.to_string(), cores);
    delta.insert(LIMIT_MEMORY.to_string(), memory);

    if contains_gpu_resources(resources_with_limits) {
        if let Some((gpu_type, count)) = node_target_gpus(node, Some(node_group), gpu_label)? {
            delta.insert(gpu_type, count);
        }
    }
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::InMemoryCloudProvider;
    use crate::kube::taints::with_to_be_deleted_taint;
    use chrono::Duration;

    const GIB: i64 = 1 << 30;
    const K80: &str = "nvidia-tesla-k80";

    fn limiter(min: &[(&str, i64)]) -> ResourceLimiter {
        ResourceLimiter::new(
            min.iter().map(|(r, v)| (r.to_string(), *v)).collect(),
            HashMap::new(),
        )
    }

    fn delta(entries: &[(&str, i64)]) -> ScaleDownResourcesDelta {
        entries.iter().map(|(r, v)| (r.to_string(), *v)).collect()
    }

    fn cpu_nodes(count: usize, cores: i64) -> Vec<Node> {
        (0..count)
            .map(|i| Node::new(format!("n{}", i)).with_capacity(cores * 1000, 4 * GIB))
            .collect()
    }

    #[test]
    fn test_cpu_headroom_above_minimum() {
        let provider = InMemoryCloudProvider::new();
        let options = AutoscalingOptions::default();
        let nodes = cpu_nodes(3, 4);

        let limits = compute_scale_down_resources_left_limits(
            &nodes,
            &limiter(&[(LIMIT_CPU, 10)]),
            &provider,
            Utc::now(),
            &options,
        );

        assert_eq!(limits.get(LIMIT_CPU), Some(2));
        assert_eq!(limits.get(LIMIT_MEMORY), None);

        let check = limits.check_delta_within_limits(&delta(&[(LIMIT_CPU, 3)]));
        assert!(check.exceeded);
        assert_eq!(check.exceeded_resources, vec![LIMIT_CPU.to_string()]);
        assert!(!limits.check_delta_within_limits(&delta(&[(LIMIT_CPU, 2)])).exceeded);
    }

    #[test]
    fn test_headroom_never_negative() {
        let provider = InMemoryCloudProvider::new();
        let limits = compute_scale_down_resources_left_limits(
            &cpu_nodes(1, 4),
            &limiter(&[(LIMIT_CPU, 10), (LIMIT_MEMORY, GIB)]),
            &provider,
            Utc::now(),
            &AutoscalingOptions::default(),
        );
        assert_eq!(limits.get(LIMIT_CPU), Some(0));
        assert_eq!(limits.get(LIMIT_MEMORY), Some(3 * GIB));
    }

    #[test]
    fn test_cores_round_up() {
        let node = Node::new("n").with_capacity(3500, GIB);
        assert_eq!(node_cores_and_memory(&node), (4, GIB));
    }

    #[test]
    fn test_recently_tainted_nodes_not_counted() {
        let provider = InMemoryCloudProvider::new();
        let options = AutoscalingOptions::default();
        let now = Utc::now();
        let mut nodes = cpu_nodes(3, 4);
        nodes[0] = with_to_be_deleted_taint(nodes[0].clone(), now - Duration::minutes(1));
        nodes[1] = with_to_be_deleted_taint(nodes[1].clone(), now - Duration::minutes(30));

        let limits = compute_scale_down_resources_left_limits(
            &nodes,
            &limiter(&[(LIMIT_CPU, 1)]),
            &provider,
            now,
            &options,
        );
        assert_eq!(limits.get(LIMIT_CPU), Some(7));
    }

    #[test]
    fn test_unknown_limit_blocks_positive_delta() {
        let mut limits = ScaleDownResourcesLimits::new(
            [(K80.to_string(), SCALE_DOWN_LIMIT_UNKNOWN)].into_iter().collect(),
        );
        assert!(limits.check_delta_within_limits(&delta(&[(K80, 1)])).exceeded);
        assert!(!limits.check_delta_within_limits(&delta(&[(K80, 0)])).exceeded);
        assert!(limits.try_decrement_by_delta(&delta(&[(K80, 1)])).exceeded);
        assert_eq!(limits.get(K80), Some(SCALE_DOWN_LIMIT_UNKNOWN));
    }

    #[test]
    fn test_try_decrement_is_all_or_nothing() {
        let mut limits = ScaleDownResourcesLimits::new(
            [(LIMIT_CPU.to_string(), 4), (LIMIT_MEMORY.to_string(), 2 * GIB)]
                .into_iter()
                .collect(),
        );

        let result = limits.try_decrement_by_delta(&delta(&[(LIMIT_CPU, 2), (LIMIT_MEMORY, 4 * GIB)]));
        assert!(result.exceeded);
        assert_eq!(result.exceeded_resources, vec![LIMIT_MEMORY.to_string()]);
        assert_eq!(limits.get(LIMIT_CPU), Some(4));

        let result = limits.try_decrement_by_delta(&delta(&[(LIMIT_CPU, 2), (LIMIT_MEMORY, GIB), ("other", 5)]));
        assert!(!result.exceeded);
        assert_eq!(limits.get(LIMIT_CPU), Some(2));
        assert_eq!(limits.get(LIMIT_MEMORY), Some(GIB));
        assert_eq!(limits.get("other"), None);
    }

    #[test]
    fn test_gpu_headroom_uses_template_for_pending_devices() {
        let provider = InMemoryCloudProvider::new();
        let options = AutoscalingOptions::default();
        let template = Node::new("template")
            .with_capacity(4000, 4 * GIB)
            .with_gpus(2)
            .with_label(&options.gpu_label, K80);
        let group = provider.add_node_group("gpu", 0, 5, 2, Some(template));

        let ready_id = group.instance_id(0);
        group.add_instance(ready_id.clone());
        let pending_id = group.instance_id(1);
        group.add_instance(pending_id.clone());

        let nodes = vec![
            Node::new("gpu-0")
                .with_provider_id(ready_id)
                .with_capacity(4000, 4 * GIB)
                .with_gpus(2)
                .with_label(&options.gpu_label, K80),
            Node::new("gpu-1")
                .with_provider_id(pending_id)
                .with_capacity(4000, 4 * GIB)
                .with_label(&options.gpu_label, K80),
        ];

        let limits = compute_scale_down_resources_left_limits(
            &nodes,
            &limiter(&[(K80, 1)]),
            &provider,
            Utc::now(),
            &options,
        );
        // The group cache reuses the first node's profile
        assert_eq!(limits.get(K80), Some(3));

        let group = provider.group("gpu").unwrap();
        let delta = compute_scale_down_resources_delta(
            &nodes[1],
            group.as_ref(),
            &[K80.to_string()],
            &options.gpu_label,
        )
        .unwrap();
        assert_eq!(delta.get(K80), Some(&2));
        assert_eq!(delta.get(LIMIT_CPU), Some(&4));
    }

    #[test]
    fn test_gpu_headroom_unknown_on_error() {
        let provider = InMemoryCloudProvider::new();
        let options = AutoscalingOptions::default();
        let orphan = Node::new("orphan")
            .with_capacity(4000, GIB)
            .with_label(&options.gpu_label, K80);

        let limits = compute_scale_down_resources_left_limits(
            &[orphan],
            &limiter(&[(K80, 1), (LIMIT_CPU, 1)]),
            &provider,
            Utc::now(),
            &options,
        );
        assert_eq!(limits.get(K80), Some(SCALE_DOWN_LIMIT_UNKNOWN));
        assert_eq!(limits.get(LIMIT_CPU), Some(3));
    }
}
