//! Scale-up
//!
//! Tests pending pods against every node group's template, estimates how many
//! nodes each group would need, lets the expander pick one group and grows it
//! within the cluster-wide limits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::api::{Node, Pod};
use crate::cloudprovider::{CloudProvider, NodeGroup, ResourceLimiter, LIMIT_CPU, LIMIT_MEMORY};
use crate::clusterstate::{ClusterStateRegistry, ScaleUpRequest, STATUS_OBJECT};
use crate::errors::AutoscalerError;
use crate::estimator::BinpackingNodeEstimator;
use crate::kube::EventType;
use crate::metrics::FailedScaleUpReason;
use crate::simulator::NodeInfo;

use super::context::AutoscalingContext;
use super::expander::{new_expander, ExpansionOption};
use super::limits::node_cores_and_memory;

/// Outcome of a scale-up attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleUpResult {
    /// No pending pods
    NotNeeded,
    /// No node group could help any pending pod
    NoOptionsAvailable,
    /// The group was asked for more nodes
    Successful { node_group: String, increase: usize },
}

fn max_limit(limiter: &ResourceLimiter, resource: &str) -> i64 {
    if limiter.has_max(resource) {
        limiter.get_max(resource)
    } else {
        i64::MAX
    }
}

fn template_cores_and_memory(node_info: &NodeInfo) -> Option<(i64, i64)> {
    node_info.node().map(node_cores_and_memory)
}

/// Cores and memory the cluster has once every target size is reached
async fn cluster_cores_memory_total(
    cloud_provider: &dyn CloudProvider,
    node_infos: &HashMap<String, NodeInfo>,
) -> Result<(i64, i64), AutoscalerError> {
    let mut cores_total = 0;
    let mut memory_total = 0;
    for group in cloud_provider.node_groups() {
        let target = group.target_size().await.map_err(|err| {
            AutoscalerError::CloudProvider(format!("failed to get target size of {}: {}", group.id(), err))
        })?;
        if target == 0 {
            continue;
        }
        let Some((cores, memory)) = node_infos.get(group.id()).and_then(template_cores_and_memory) else {
            return Err(AutoscalerError::Internal(format!(
                "missing template node for node group {}",
                group.id()
            )));
        };
        cores_total += cores * target as i64;
        memory_total += memory * target as i64;
    }
    Ok((cores_total, memory_total))
}

/// Shrink `new_nodes` so the cluster stays within the core and memory maximums
fn apply_max_cluster_cores_memory_limits(
    new_nodes: usize,
    cores_total: i64,
    memory_total: i64,
    limiter: &ResourceLimiter,
    node_info: &NodeInfo,
) -> Result<usize, AutoscalerError> {
    let Some((node_cores, node_memory)) = template_cores_and_memory(node_info) else {
        return Err(AutoscalerError::Internal("template has no node".to_string()));
    };

    let mut capped = new_nodes as i64;
    let max_cores = max_limit(limiter, LIMIT_CPU);
    if node_cores > 0 && cores_total.saturating_add(node_cores * capped) > max_cores {
        capped = capped.min((max_cores - cores_total).max(0) / node_cores);
    }
    let max_memory = max_limit(limiter, LIMIT_MEMORY);
    if node_memory > 0 && memory_total.saturating_add(node_memory * capped) > max_memory {
        capped = capped.min((max_memory - memory_total).max(0) / node_memory);
    }

    if capped < 1 {
        return Err(AutoscalerError::Transient(
            "max cores or memory limit reached".to_string(),
        ));
    }
    if capped < new_nodes as i64 {
        info!("Capping scale-up size to {} due to cluster cores or memory limits", capped);
    }
    Ok(capped as usize)
}

/// Try to make room for `unschedulable_pods` by growing one node group
pub async fn scale_up(
    context: &AutoscalingContext,
    cluster_state: &ClusterStateRegistry,
    unschedulable_pods: &[Pod],
    nodes: &[Node],
    node_infos: &HashMap<String, NodeInfo>,
    now: DateTime<Utc>,
) -> Result<ScaleUpResult, AutoscalerError> {
    if unschedulable_pods.is_empty() {
        return Ok(ScaleUpResult::NotNeeded);
    }
    for pod in unschedulable_pods {
        info!("Pod {} is unschedulable", pod.key());
    }

    let cloud_provider = context.cloud_provider.as_ref();
    let limiter = cloud_provider.get_resource_limiter()?.unwrap_or_default();
    let (cores_total, memory_total) = cluster_cores_memory_total(cloud_provider, node_infos).await?;

    let mut upcoming_nodes = Vec::new();
    for (group_id, count) in cluster_state.get_upcoming_nodes() {
        let Some(template) = node_infos.get(&group_id) else {
            return Err(AutoscalerError::Internal(format!(
                "failed to find template node for node group {}",
                group_id
            )));
        };
        upcoming_nodes.extend(std::iter::repeat(template.clone()).take(count));
    }

    let estimator = BinpackingNodeEstimator::new(Arc::clone(&context.predicate_checker));
    let mut helped: HashSet<String> = HashSet::new();
    let mut options = Vec::new();

    for group in cloud_provider.node_groups() {
        let id = group.id();
        if group.exist() && !cluster_state.is_node_group_safe_to_scale_up(id, now) {
            warn!("Node group {} is not ready for scaleup", id);
            continue;
        }
        let current_target = match group.target_size().await {
            Ok(size) => size,
            Err(err) => {
                error!("Failed to get node group size: {}", err);
                continue;
            }
        };
        if current_target >= group.max_size() {
            debug!("Skipping node group {} - max size reached", id);
            continue;
        }
        let Some(node_info) = node_infos.get(id) else {
            error!("No node info for: {}", id);
            continue;
        };
        let Some((node_cores, node_memory)) = template_cores_and_memory(node_info) else {
            error!("No node in template of {}", id);
            continue;
        };
        if cores_total.saturating_add(node_cores) > max_limit(&limiter, LIMIT_CPU) {
            info!("Skipping node group {} - max cores limit reached", id);
            continue;
        }
        if memory_total.saturating_add(node_memory) > max_limit(&limiter, LIMIT_MEMORY) {
            info!("Skipping node group {} - max memory limit reached", id);
            continue;
        }

        let pods: Vec<Pod> = unschedulable_pods
            .iter()
            .filter(|pod| match context.predicate_checker.check_predicates(pod, None, node_info) {
                Ok(()) => true,
                Err(err) => {
                    debug!("Scale-up predicate failed for {} on {}: {}", pod.key(), id, err);
                    false
                }
            })
            .cloned()
            .collect();
        if pods.is_empty() {
            debug!("No pod can fit to {}", id);
            continue;
        }
        helped.extend(pods.iter().map(Pod::key));

        let node_count = estimator.estimate(&pods, node_info, &upcoming_nodes);
        if node_count == 0 {
            debug!("No need for any nodes in {}", id);
            continue;
        }
        options.push(ExpansionOption {
            debug: format!("{} nodes in {} for {} pods", node_count, id, pods.len()),
            node_group: group,
            node_count,
            pods,
        });
    }

    for pod in unschedulable_pods.iter().filter(|p| !helped.contains(&p.key())) {
        context.recorder.record(
            "Pod",
            &pod.key(),
            EventType::Normal,
            "NotTriggerScaleUp",
            "pod didn't trigger scale-up (it wouldn't fit if a new node is added)",
        );
    }

    if options.is_empty() {
        info!("No expansion options");
        return Ok(ScaleUpResult::NoOptionsAvailable);
    }

    let expander = new_expander(context.options.expander);
    let Some(best) = expander.best_option(&options, node_infos) else {
        return Ok(ScaleUpResult::NoOptionsAvailable);
    };
    let group = Arc::clone(&best.node_group);
    info!("Best option to resize: {}", group.id());
    debug!("{}", best.debug);
    info!("Estimated {} nodes needed in {}", best.node_count, group.id());

    let mut new_nodes = best.node_count;
    let max_total = context.options.max_nodes_total;
    if max_total > 0 && nodes.len() + new_nodes > max_total {
        info!("Capping size to max cluster total size ({})", max_total);
        if nodes.len() >= max_total {
            return Err(AutoscalerError::Transient(
                "max node total count already reached".to_string(),
            ));
        }
        new_nodes = max_total - nodes.len();
    }

    let Some(node_info) = node_infos.get(group.id()) else {
        return Err(AutoscalerError::Internal(format!(
            "failed to find matching node for {}",
            group.id()
        )));
    };
    new_nodes = apply_max_cluster_cores_memory_limits(new_nodes, cores_total, memory_total, &limiter, node_info)?;

    let current_size = group.target_size().await.map_err(|err| {
        AutoscalerError::CloudProvider(format!("failed to get node group size: {}", err))
    })?;
    if current_size + new_nodes > group.max_size() {
        info!("Capping size to MAX ({})", group.max_size());
        new_nodes = group.max_size().saturating_sub(current_size);
    }
    if new_nodes == 0 {
        return Ok(ScaleUpResult::NoOptionsAvailable);
    }

    execute_scale_up(context, cluster_state, &group, current_size, new_nodes).await?;

    for pod in &best.pods {
        context.recorder.record(
            "Pod",
            &pod.key(),
            EventType::Normal,
            "TriggeredScaleUp",
            &format!(
                "pod triggered scale-up: [{} {}->{} (max: {})]",
                group.id(),
                current_size,
                current_size + new_nodes,
                group.max_size()
            ),
        );
    }

    cluster_state.recalculate().await;
    Ok(ScaleUpResult::Successful {
        node_group: group.id().to_string(),
        increase: new_nodes,
    })
}

async fn execute_scale_up(
    context: &AutoscalingContext,
    cluster_state: &ClusterStateRegistry,
    group: &Arc<dyn NodeGroup>,
    current_size: usize,
    increase: usize,
) -> Result<(), AutoscalerError> {
    let new_size = current_size + increase;
    info!("Scale-up: setting group {} size to {}", group.id(), new_size);
    context.recorder.record(
        "ConfigMap",
        STATUS_OBJECT,
        EventType::Normal,
        "ScaledUpGroup",
        &format!("Scale-up: setting group {} size to {}", group.id(), new_size),
    );

    if let Err(err) = group.increase_size(increase).await {
        context.recorder.record(
            "ConfigMap",
            STATUS_OBJECT,
            EventType::Warning,
            "FailedToScaleUpGroup",
            &format!("Scale-up failed for group {}: {}", group.id(), err),
        );
        cluster_state.register_failed_scale_up(group.id(), FailedScaleUpReason::ApiError);
        return Err(AutoscalerError::CloudProvider(format!(
            "failed to increase node group size: {}",
            err
        )));
    }

    let now = Utc::now();
    cluster_state.register_scale_up(ScaleUpRequest {
        node_group: Arc::clone(group),
        time: now,
        expected_add_time: now + context.options.max_node_provision_time,
        increase,
    });
    context.metrics.register_scale_up(increase);
    context.recorder.record(
        "ConfigMap",
        STATUS_OBJECT,
        EventType::Normal,
        "ScaledUpGroup",
        &format!("Scale-up: group {} size set to {}", group.id(), new_size),
    );
    Ok(())
}
