//! Helpers shared by the steps of one autoscaler iteration

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::api::{DaemonSet, Node, Pod, SYSTEM_NAMESPACE};
use crate::cloudprovider::{CloudProvider, CloudProviderError};
use crate::clusterstate::{ClusterStateRegistry, UnregisteredNode};
use crate::errors::AutoscalerError;
use crate::kube::taints::TO_BE_DELETED_TAINT;
use crate::kube::EventType;
use crate::simulator::{create_node_name_to_info_map, NodeInfo, PredicateChecker};

use super::context::AutoscalingContext;

/// Label value identifying API server pods
const MASTER_COMPONENT: &str = "kube-apiserver";

/// Convert a non-negative option duration for tokio timers
pub(crate) fn to_std(duration: chrono::Duration) -> std::time::Duration {
    duration.to_std().unwrap_or_default()
}

/// Drop nodes hosting an API server pod
pub fn filter_out_masters(nodes: &[Node], pods: &[Pod]) -> Vec<Node> {
    let masters: HashSet<&str> = pods
        .iter()
        .filter(|pod| {
            pod.namespace() == SYSTEM_NAMESPACE
                && pod.metadata.labels.get("component").map(String::as_str) == Some(MASTER_COMPONENT)
        })
        .map(|pod| pod.spec.node_name.as_str())
        .collect();

    nodes
        .iter()
        .filter(|node| !masters.contains(node.name()))
        .cloned()
        .collect()
}

/// Target size of every node group; groups whose size cannot be read are left out
pub async fn get_node_group_size_map(cloud_provider: &dyn CloudProvider) -> HashMap<String, usize> {
    let mut sizes = HashMap::new();
    for group in cloud_provider.node_groups() {
        match group.target_size().await {
            Ok(size) => {
                sizes.insert(group.id().to_string(), size);
            }
            Err(err) => error!("Error while checking node group size {}: {}", group.id(), err),
        }
    }
    sizes
}

/// Nodes that belong to an autoscaled group above its minimum size
pub async fn get_potentially_unneeded_nodes(
    cloud_provider: &dyn CloudProvider,
    nodes: &[Node],
) -> Vec<Node> {
    let sizes = get_node_group_size_map(cloud_provider).await;
    let mut result = Vec::with_capacity(nodes.len());
    for node in nodes {
        let group = match cloud_provider.node_group_for_node(node) {
            Ok(Some(group)) => group,
            Ok(None) => {
                debug!("Skipping {} - no node group config", node.name());
                continue;
            }
            Err(err) => {
                warn!("Error while checking node group for {}: {}", node.name(), err);
                continue;
            }
        };
        let Some(&size) = sizes.get(group.id()) else {
            error!("Error while checking node group size {}: group size not found", group.id());
            continue;
        };
        if size <= group.min_size() {
            debug!("Skipping {} - node group min size reached", node.name());
            continue;
        }
        result.push(node.clone());
    }
    result
}

// =============================================================================
// Node Group Templates
// =============================================================================

fn is_node_ready_and_schedulable(node: &Node) -> bool {
    node.is_ready() && !node.spec.unschedulable
}

/// Rename the node of a template and strip state that belongs to the original
fn sanitize_node_info(node_info: &NodeInfo, group_id: &str) -> Result<NodeInfo, AutoscalerError> {
    let Some(node) = node_info.node() else {
        return Err(AutoscalerError::Internal(format!(
            "template for node group {} has no node",
            group_id
        )));
    };
    let name = format!("template-node-for-{}", group_id);
    let mut node = node.clone();
    node.metadata.name = name.clone();
    node.metadata.labels.insert("kubernetes.io/hostname".to_string(), name.clone());
    node.spec.taints.retain(|t| t.key != TO_BE_DELETED_TAINT);

    let pods = node_info
        .pods()
        .iter()
        .map(|pod| {
            let mut pod = pod.clone();
            pod.spec.node_name = name.clone();
            pod
        })
        .collect();
    Ok(NodeInfo::with_pods(node, pods))
}

/// Template built from a live node, keeping only pods every node of the group runs
fn node_info_for_node(node: &Node, pods_on_node: &[Pod]) -> NodeInfo {
    let pods = pods_on_node
        .iter()
        .filter(|pod| pod.is_daemonset_pod() || pod.is_mirror())
        .cloned()
        .collect();
    NodeInfo::with_pods(node.clone(), pods)
}

/// Template built from the provider's node template plus daemon set pods that fit
pub fn build_node_info_from_template(
    group_id: &str,
    template: Node,
    daemonsets: &[DaemonSet],
    predicate_checker: &dyn PredicateChecker,
) -> Result<NodeInfo, AutoscalerError> {
    let mut node_info = NodeInfo::new(template);
    for ds in daemonsets {
        let pod = ds.pod_for_node(node_info.node().map(Node::name).unwrap_or_default());
        if predicate_checker.check_predicates(&pod, None, &node_info).is_ok() {
            node_info.add_pod(pod);
        }
    }
    sanitize_node_info(&node_info, group_id)
}

/// One template per node group.
///
/// Ready nodes are preferred, then the provider's template, and only then
/// unready or unschedulable nodes. Groups with none of these are left out.
pub fn get_node_infos_for_groups(
    nodes: &[Node],
    cloud_provider: &dyn CloudProvider,
    scheduled_pods: &[Pod],
    daemonsets: &[DaemonSet],
    predicate_checker: &dyn PredicateChecker,
) -> Result<HashMap<String, NodeInfo>, AutoscalerError> {
    let mut result: HashMap<String, NodeInfo> = HashMap::new();
    let mut pods_for_nodes: HashMap<&str, Vec<Pod>> = HashMap::new();
    for pod in scheduled_pods {
        pods_for_nodes
            .entry(pod.spec.node_name.as_str())
            .or_default()
            .push(pod.clone());
    }

    let process_node = |node: &Node, result: &mut HashMap<String, NodeInfo>| -> Result<bool, AutoscalerError> {
        let Some(group) = cloud_provider.node_group_for_node(node)? else {
            return Ok(false);
        };
        if result.contains_key(group.id()) {
            return Ok(false);
        }
        let pods = pods_for_nodes.get(node.name()).map(Vec::as_slice).unwrap_or(&[]);
        let node_info = sanitize_node_info(&node_info_for_node(node, pods), group.id())?;
        result.insert(group.id().to_string(), node_info);
        Ok(true)
    };

    for node in nodes.iter().filter(|n| is_node_ready_and_schedulable(n)) {
        process_node(node, &mut result)?;
    }

    for group in cloud_provider.node_groups() {
        if result.contains_key(group.id()) {
            continue;
        }
        let template = match group.template_node() {
            Ok(template) => template,
            Err(CloudProviderError::NotImplemented) => continue,
            Err(err) => {
                error!("Unable to build proper template node for {}: {}", group.id(), err);
                return Err(err.into());
            }
        };
        let node_info = build_node_info_from_template(group.id(), template, daemonsets, predicate_checker)?;
        result.insert(group.id().to_string(), node_info);
    }

    for node in nodes.iter().filter(|n| !is_node_ready_and_schedulable(n)) {
        if process_node(node, &mut result)? {
            warn!("Built template based on unready/unschedulable node {}", node.name());
        }
    }

    Ok(result)
}

// =============================================================================
// Reconciliation Fixes
// =============================================================================

/// Delete instances that stayed unregistered past the provision timeout.
///
/// Returns whether anything was removed. Groups at their minimum size are
/// left alone.
pub async fn remove_old_unregistered_nodes(
    unregistered_nodes: &[UnregisteredNode],
    context: &AutoscalingContext,
    now: DateTime<Utc>,
) -> Result<bool, AutoscalerError> {
    let mut removed_any = false;
    for unregistered in unregistered_nodes {
        if unregistered.unregistered_since + context.options.max_node_provision_time >= now {
            continue;
        }
        let node = &unregistered.node;
        info!("Removing unregistered node {}", node.name());

        let group = match context.cloud_provider.node_group_for_node(node) {
            Ok(Some(group)) => group,
            Ok(None) => {
                warn!("No node group for node {}, skipping", node.name());
                continue;
            }
            Err(err) => {
                warn!("Failed to get node group for {}: {}", node.name(), err);
                return Err(err.into());
            }
        };

        let size = group.target_size().await.map_err(|err| {
            warn!("Failed to get node group size; unregisteredNode={}; nodeGroup={}; err={}", node.name(), group.id(), err);
            AutoscalerError::from(err)
        })?;
        if group.min_size() >= size {
            warn!(
                "Failed to remove node {}: node group min size reached, skipping unregistered node removal",
                node.name()
            );
            continue;
        }

        if let Err(err) = group.delete_nodes(std::slice::from_ref(node)).await {
            warn!("Failed to remove node {}: {}", node.name(), err);
            context.recorder.record(
                "Node",
                node.name(),
                EventType::Warning,
                "DeleteUnregisteredFailed",
                &format!("Failed to remove node {}: {}", node.name(), err),
            );
            return Err(err.into());
        }
        context.recorder.record(
            "Node",
            node.name(),
            EventType::Normal,
            "DeleteUnregistered",
            &format!("Removed unregistered node {}", node.name()),
        );
        removed_any = true;
    }
    Ok(removed_any)
}

/// Shrink target sizes that stayed above the registered node count for
/// longer than the provision timeout. Returns whether anything was fixed.
pub async fn fix_node_group_size(
    context: &AutoscalingContext,
    cluster_state: &ClusterStateRegistry,
    now: DateTime<Utc>,
) -> Result<bool, AutoscalerError> {
    let mut fixed = false;
    for group in context.cloud_provider.node_groups() {
        let Some(incorrect) = cluster_state.get_incorrect_node_group_size(group.id()) else {
            continue;
        };
        if incorrect.first_observed + context.options.max_node_provision_time >= now {
            continue;
        }
        let missing = incorrect.expected_size - incorrect.current_size;
        if missing <= 0 {
            continue;
        }
        info!(
            "Decreasing size of {}, expected={} current={} delta={}",
            group.id(),
            incorrect.expected_size,
            incorrect.current_size,
            -missing
        );
        group
            .decrease_target_size(missing as usize)
            .await
            .map_err(|err| AutoscalerError::from(err).add_prefix(format!("failed to decrease {}: ", group.id())))?;
        fixed = true;
    }
    Ok(fixed)
}

/// Pods the scheduler reported as unschedulable that would in fact fit on an
/// existing node. Each fitting pod reserves its space before the next is tried.
pub fn filter_out_schedulable(
    unschedulable: &[Pod],
    nodes: &[Node],
    scheduled: &[Pod],
    predicate_checker: &dyn PredicateChecker,
) -> Vec<Pod> {
    let mut infos = create_node_name_to_info_map(scheduled, nodes);
    let mut names: Vec<String> = infos
        .iter()
        .filter(|(_, info)| info.node().is_some())
        .map(|(name, _)| name.clone())
        .collect();
    names.sort();

    let mut result = Vec::new();
    for pod in unschedulable {
        let metadata = predicate_checker.predicate_metadata(pod);
        let fit = names.iter().find(|name| {
            infos
                .get(name.as_str())
                .map(|info| predicate_checker.check_predicates(pod, Some(&metadata), info).is_ok())
                .unwrap_or(false)
        });
        match fit.and_then(|name| infos.get_mut(name.as_str()).map(|info| (name, info))) {
            Some((name, info)) => {
                debug!(
                    "Pod {} marked as unschedulable can be scheduled on {}. Ignoring in scale up.",
                    pod.key(),
                    name
                );
                info.add_pod(pod.clone());
            }
            None => result.push(pod.clone()),
        }
    }
    result
}
