//! Scale-down engine
//!
//! Every iteration runs two phases:
//! - [`ScaleDown::update_unneeded_nodes`] marks nodes whose pods could run
//!   elsewhere and remembers since when each has been unneeded
//! - [`ScaleDown::try_to_scale_down`] removes nodes that stayed unneeded long
//!   enough
//!
//! Empty nodes are removed in bulk and the call waits for them. Non-empty
//! nodes are drained one at a time in a background task whose outcome lands in
//! [`NodeDeleteStatus`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::api::{Node, Pod, PodDisruptionBudget};
use crate::clusterstate::{ClusterStateRegistry, ScaleDownRequest, STATUS_OBJECT};
use crate::errors::AutoscalerError;
use crate::kube::taints::{clean_to_be_deleted, mark_to_be_deleted};
use crate::kube::{ApiError, EventRecorder, EventType, KubeClient};
use crate::metrics::NodeScaleDownReason;
use crate::simulator::{
    calculate_utilization, create_node_name_to_info_map, find_empty_nodes_to_remove,
    find_nodes_to_remove, remove_node_from_tracker, CheckMode, DrainOptions, NodeToBeRemoved,
    UsageTracker, UtilizationInfo,
};

use super::context::AutoscalingContext;
use super::limits::{
    compute_scale_down_resources_delta, compute_scale_down_resources_left_limits,
    is_node_being_deleted, ScaleDownResourcesLimits,
};
use super::utils::{filter_out_masters, get_node_group_size_map, to_std};

/// Grace period used for pods that do not set one
pub const DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS: i64 = 30;

/// Extra wait for eviction confirmations past the retry deadline
const EVICTION_CONFIRMATION_SLACK: std::time::Duration = std::time::Duration::from_secs(5);

/// Outcome of one scale-down attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDownResult {
    /// No node has been unneeded long enough
    NoUnneeded,
    /// Candidates existed but none could be removed
    NoNodeDeleted,
    /// Empty nodes were deleted
    NodeDeleted,
    /// A non-empty node is being drained in the background
    NodeDeleteStarted,
    /// A previous non-empty node deletion is still running
    InProgress,
}

#[derive(Debug, Default)]
struct DeleteStatusInner {
    in_progress: bool,
    results: HashMap<String, Result<(), AutoscalerError>>,
}

/// Progress of background node deletions.
///
/// The in-progress flag serializes non-empty deletions across iterations.
#[derive(Debug, Default)]
pub struct NodeDeleteStatus {
    inner: Mutex<DeleteStatusInner>,
}

impl NodeDeleteStatus {
    fn lock(&self) -> MutexGuard<'_, DeleteStatusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_delete_in_progress(&self) -> bool {
        self.lock().in_progress
    }

    pub fn set_delete_in_progress(&self, in_progress: bool) {
        self.lock().in_progress = in_progress;
    }

    pub fn add_node_delete_result(&self, node: &str, result: Result<(), AutoscalerError>) {
        self.lock().results.insert(node.to_string(), result);
    }

    /// Take every result recorded since the last call
    pub fn drain_node_delete_results(&self) -> HashMap<String, Result<(), AutoscalerError>> {
        std::mem::take(&mut self.lock().results)
    }
}

/// State carried between scale-down phases and iterations
pub struct ScaleDown {
    context: Arc<AutoscalingContext>,
    cluster_state: Arc<ClusterStateRegistry>,
    /// First time each node was seen unneeded
    unneeded_nodes: HashMap<String, DateTime<Utc>>,
    unneeded_nodes_list: Vec<Node>,
    /// Nodes not worth simulating again until the stored time
    unremovable_nodes: HashMap<String, DateTime<Utc>>,
    /// Pod key to the node it would move to
    pod_location_hints: HashMap<String, String>,
    node_utilization_map: HashMap<String, UtilizationInfo>,
    usage_tracker: UsageTracker,
    node_delete_status: Arc<NodeDeleteStatus>,
}

impl ScaleDown {
    pub fn new(context: Arc<AutoscalingContext>, cluster_state: Arc<ClusterStateRegistry>) -> Self {
        Self {
            context,
            cluster_state,
            unneeded_nodes: HashMap::new(),
            unneeded_nodes_list: Vec::new(),
            unremovable_nodes: HashMap::new(),
            pod_location_hints: HashMap::new(),
            node_utilization_map: HashMap::new(),
            usage_tracker: UsageTracker::new(),
            node_delete_status: Arc::new(NodeDeleteStatus::default()),
        }
    }

    /// Forget usage records older than the unneeded window
    pub fn clean_up(&mut self, now: DateTime<Utc>) {
        self.usage_tracker
            .clean_up(now - self.context.options.scale_down_unneeded_time);
    }

    pub fn clean_up_unneeded_nodes(&mut self) {
        self.unneeded_nodes_list.clear();
        self.unneeded_nodes.clear();
    }

    /// Nodes currently considered unneeded
    pub fn unneeded_nodes(&self) -> &[Node] {
        &self.unneeded_nodes_list
    }

    pub fn unneeded_since(&self, node: &str) -> Option<DateTime<Utc>> {
        self.unneeded_nodes.get(node).copied()
    }

    /// Time until which a node is not simulated again
    pub fn unremovable_until(&self, node: &str) -> Option<DateTime<Utc>> {
        self.unremovable_nodes.get(node).copied()
    }

    pub fn utilization(&self, node: &str) -> Option<UtilizationInfo> {
        self.node_utilization_map.get(node).copied()
    }

    pub fn node_delete_status(&self) -> Arc<NodeDeleteStatus> {
        Arc::clone(&self.node_delete_status)
    }

    // =========================================================================
    // Phase 1: Mark Unneeded
    // =========================================================================

    /// Recompute which of `nodes_to_check` could be removed.
    ///
    /// A simulation error clears every unneeded node and is returned.
    pub async fn update_unneeded_nodes(
        &mut self,
        all_nodes: &[Node],
        nodes_to_check: &[Node],
        pods: &[Pod],
        now: DateTime<Utc>,
        pdbs: &[PodDisruptionBudget],
    ) -> Result<(), AutoscalerError> {
        let options = self.context.options.clone();
        let drain_options = DrainOptions::from(&options);
        let node_infos = create_node_name_to_info_map(pods, all_nodes);
        let mut utilization_map = HashMap::new();

        self.update_unremovable_nodes(all_nodes);

        let mut skipped = 0;
        let mut filtered = Vec::with_capacity(nodes_to_check.len());
        for node in nodes_to_check {
            if let Some(&until) = self.unremovable_nodes.get(node.name()) {
                if until > now {
                    skipped += 1;
                    continue;
                }
                self.unremovable_nodes.remove(node.name());
            }
            filtered.push(node.clone());
        }
        if skipped > 0 {
            info!(
                "Scale-down calculation: ignoring {} nodes unremovable in the last {}s",
                skipped,
                options.unremovable_node_recheck_timeout.num_seconds()
            );
        }

        let mut currently_unneeded = Vec::new();
        for node in &filtered {
            if is_node_being_deleted(node, now, &options) {
                debug!("Skipping {} from delete consideration - the node is currently being deleted", node.name());
                continue;
            }
            if node.has_scale_down_disabled() {
                debug!("Skipping {} from delete consideration - the node is marked as no scale down", node.name());
                continue;
            }
            let Some(node_info) = node_infos.get(node.name()) else {
                error!("Node info for {} not found", node.name());
                continue;
            };
            let utilization = match calculate_utilization(
                node,
                node_info,
                options.ignore_daemonsets_utilization,
                options.ignore_mirror_pods_utilization,
            ) {
                Ok(utilization) => utilization,
                Err(err) => {
                    warn!("Failed to calculate utilization for {}: {}", node.name(), err);
                    continue;
                }
            };
            debug!("Node {} - utilization {}", node.name(), utilization.utilization);
            utilization_map.insert(node.name().to_string(), utilization);

            if utilization.utilization >= options.scale_down_utilization_threshold {
                debug!("Node {} is not suitable for removal - utilization too big ({})", node.name(), utilization.utilization);
                continue;
            }
            currently_unneeded.push(node.clone());
        }

        let empty_nodes = self
            .get_empty_nodes(
                &currently_unneeded,
                pods,
                currently_unneeded.len(),
                &ScaleDownResourcesLimits::default(),
                now,
            )
            .await;
        let non_empty: Vec<Node> = currently_unneeded
            .into_iter()
            .filter(|node| !empty_nodes.iter().any(|e| e.name() == node.name()))
            .collect();

        let (candidates, non_candidates) = self.choose_candidates(non_empty);

        let first_pass = find_nodes_to_remove(
            &candidates,
            all_nodes,
            pods,
            CheckMode::Fast,
            self.context.predicate_checker.as_ref(),
            candidates.len(),
            &self.pod_location_hints,
            &mut self.usage_tracker,
            now,
            pdbs,
            &drain_options,
        )
        .await;
        let mut simulation = match first_pass {
            Ok(simulation) => simulation,
            Err(err) => return Err(self.mark_simulation_error(err, now)),
        };

        let additional_count = options
            .scale_down_non_empty_candidates_count
            .saturating_sub(simulation.removable.len())
            .min(non_candidates.len());
        let pool_size = ((all_nodes.len() as f64 * options.scale_down_candidates_pool_ratio).ceil() as usize)
            .max(options.scale_down_candidates_pool_min_count)
            .min(non_candidates.len());
        if additional_count > 0 {
            debug!("Finding additional {} candidates for scale down", additional_count);
            let additional_pass = find_nodes_to_remove(
                &non_candidates[..pool_size],
                all_nodes,
                pods,
                CheckMode::Fast,
                self.context.predicate_checker.as_ref(),
                additional_count,
                &self.pod_location_hints,
                &mut self.usage_tracker,
                now,
                pdbs,
                &drain_options,
            )
            .await;
            let additional = match additional_pass {
                Ok(additional) => additional,
                Err(err) => return Err(self.mark_simulation_error(err, now)),
            };
            simulation.removable.extend(additional.removable);
            simulation.unremovable.extend(additional.unremovable);
            simulation.new_hints.extend(additional.new_hints);
        }

        simulation
            .removable
            .extend(empty_nodes.into_iter().map(|node| NodeToBeRemoved {
                node,
                pods_to_reschedule: Vec::new(),
            }));

        let mut unneeded = HashMap::with_capacity(simulation.removable.len());
        let mut unneeded_list = Vec::with_capacity(simulation.removable.len());
        for removable in simulation.removable {
            let name = removable.node.name().to_string();
            let since = self.unneeded_nodes.get(&name).copied().unwrap_or(now);
            unneeded.insert(name, since);
            unneeded_list.push(removable.node);
        }

        if !simulation.unremovable.is_empty() {
            let recheck_at = now + options.unremovable_node_recheck_timeout;
            for node in &simulation.unremovable {
                self.unremovable_nodes.insert(node.name().to_string(), recheck_at);
            }
            info!(
                "{} nodes found to be unremovable in simulation, will re-check them at {}",
                simulation.unremovable.len(),
                recheck_at
            );
        }

        self.unneeded_nodes_list = unneeded_list;
        self.unneeded_nodes = unneeded;
        self.pod_location_hints = simulation.new_hints;
        self.node_utilization_map = utilization_map;
        self.cluster_state
            .update_scale_down_candidates(&self.unneeded_nodes_list, now);
        self.context
            .metrics
            .update_unneeded_nodes_count(self.unneeded_nodes_list.len());
        Ok(())
    }

    /// Drop unremovable entries of nodes that left the cluster
    fn update_unremovable_nodes(&mut self, nodes: &[Node]) {
        if self.unremovable_nodes.is_empty() {
            return;
        }
        let gone: Vec<String> = self
            .unremovable_nodes
            .keys()
            .filter(|name| !nodes.iter().any(|n| n.name() == name.as_str()))
            .cloned()
            .collect();
        for name in gone {
            self.unremovable_nodes.remove(&name);
        }
    }

    /// Split nodes into those already unneeded and the rest. Without a cap
    /// every node is a candidate.
    fn choose_candidates(&self, nodes: Vec<Node>) -> (Vec<Node>, Vec<Node>) {
        if self.context.options.scale_down_non_empty_candidates_count == 0 {
            return (nodes, Vec::new());
        }
        nodes
            .into_iter()
            .partition(|node| self.unneeded_nodes.contains_key(node.name()))
    }

    fn mark_simulation_error(&mut self, err: AutoscalerError, now: DateTime<Utc>) -> AutoscalerError {
        error!("Error while simulating node drains: {}", err);
        self.unneeded_nodes_list.clear();
        self.unneeded_nodes.clear();
        self.pod_location_hints.clear();
        self.node_utilization_map.clear();
        self.cluster_state.update_scale_down_candidates(&[], now);
        err.add_prefix("error while simulating node drains: ")
    }

    /// Empty nodes among `candidates` that may go at once.
    ///
    /// Keeps every group at or above its minimum size and consumes a copy of
    /// `limits` so the selection as a whole fits the headroom.
    async fn get_empty_nodes(
        &self,
        candidates: &[Node],
        pods: &[Pod],
        max_empty_bulk_delete: usize,
        limits: &ScaleDownResourcesLimits,
        now: DateTime<Utc>,
    ) -> Vec<Node> {
        let drain_options = DrainOptions::from(&self.context.options);
        let empty = find_empty_nodes_to_remove(candidates, pods, &drain_options, now);
        let resource_names = limits.resource_names();
        let mut limits_left = limits.clone();
        let mut availability: HashMap<String, usize> = HashMap::new();
        let mut result = Vec::new();

        for node in empty {
            let group = match self.context.cloud_provider.node_group_for_node(&node) {
                Ok(Some(group)) => group,
                Ok(None) => continue,
                Err(err) => {
                    error!("Failed to get group for {}: {}", node.name(), err);
                    continue;
                }
            };
            let available = match availability.get(group.id()) {
                Some(&available) => available,
                None => match group.target_size().await {
                    Ok(size) => size.saturating_sub(group.min_size()),
                    Err(err) => {
                        error!("Failed to get size for {}: {}", group.id(), err);
                        continue;
                    }
                },
            };
            availability.insert(group.id().to_string(), available);
            if available == 0 {
                continue;
            }

            let delta = match compute_scale_down_resources_delta(
                &node,
                group.as_ref(),
                &resource_names,
                &self.context.options.gpu_label,
            ) {
                Ok(delta) => delta,
                Err(err) => {
                    error!("Error getting node resources: {}", err);
                    continue;
                }
            };
            if limits_left.try_decrement_by_delta(&delta).exceeded {
                continue;
            }
            availability.insert(group.id().to_string(), available - 1);
            result.push(node);
        }

        result.truncate(max_empty_bulk_delete);
        result
    }

    // =========================================================================
    // Phase 2: Act
    // =========================================================================

    /// Delete unneeded nodes whose waiting time is over.
    ///
    /// Returns once empty nodes are gone or a non-empty deletion is started.
    /// An error means at least one deletion failed; successful deletions are
    /// registered regardless.
    pub async fn try_to_scale_down(
        &mut self,
        all_nodes: &[Node],
        pods: &[Pod],
        pdbs: &[PodDisruptionBudget],
        now: DateTime<Utc>,
    ) -> Result<ScaleDownResult, AutoscalerError> {
        let options = self.context.options.clone();
        let cloud_provider = Arc::clone(&self.context.cloud_provider);
        let nodes_without_master = filter_out_masters(all_nodes, pods);

        let limiter = cloud_provider.get_resource_limiter()?.unwrap_or_default();
        let resources_with_limits = limiter.get_resources();
        let resources_left = compute_scale_down_resources_left_limits(
            &nodes_without_master,
            &limiter,
            cloud_provider.as_ref(),
            now,
            &options,
        );
        let group_sizes = get_node_group_size_map(cloud_provider.as_ref()).await;

        let mut candidates = Vec::new();
        let mut readiness: HashMap<String, bool> = HashMap::new();
        for node in &nodes_without_master {
            let Some(&since) = self.unneeded_nodes.get(node.name()) else {
                continue;
            };
            debug!("{} was unneeded for {}s", node.name(), (now - since).num_seconds());

            if node.has_scale_down_disabled() {
                debug!("Skipping {} - scale down disabled annotation found", node.name());
                continue;
            }

            let ready = node.is_ready();
            readiness.insert(node.name().to_string(), ready);
            let wait = if ready {
                options.scale_down_unneeded_time
            } else {
                options.scale_down_unready_time
            };
            if since + wait > now {
                continue;
            }

            let group = match cloud_provider.node_group_for_node(node) {
                Ok(Some(group)) => group,
                Ok(None) => {
                    debug!("Skipping {} - no node group config", node.name());
                    continue;
                }
                Err(err) => {
                    error!("Error while checking node group for {}: {}", node.name(), err);
                    continue;
                }
            };
            let Some(&size) = group_sizes.get(group.id()) else {
                error!("Error while checking node group size {}: group size not found in cache", group.id());
                continue;
            };
            if size <= group.min_size() {
                info!("Skipping {} - node group min size reached", node.name());
                continue;
            }

            let delta = match compute_scale_down_resources_delta(
                node,
                group.as_ref(),
                &resources_with_limits,
                &options.gpu_label,
            ) {
                Ok(delta) => delta,
                Err(err) => {
                    error!("Error getting node resources: {}", err);
                    continue;
                }
            };
            let check = resources_left.check_delta_within_limits(&delta);
            if check.exceeded {
                debug!("Skipping {} - minimal limit exceeded for {:?}", node.name(), check.exceeded_resources);
                continue;
            }

            candidates.push(node.clone());
        }

        if candidates.is_empty() {
            info!("No candidates for scale down");
            return Ok(ScaleDownResult::NoUnneeded);
        }

        let empty_nodes = self
            .get_empty_nodes(&candidates, pods, options.max_empty_bulk_delete, &resources_left, now)
            .await;
        if !empty_nodes.is_empty() {
            return self
                .delete_empty_nodes(empty_nodes, &readiness, now)
                .await
                .map(|()| ScaleDownResult::NodeDeleted)
                .map_err(|err| err.add_prefix("failed to delete at least one empty node: "));
        }

        if self.node_delete_status.is_delete_in_progress() {
            info!("Scale down is in progress, skipping");
            return Ok(ScaleDownResult::InProgress);
        }

        let simulation = find_nodes_to_remove(
            &candidates,
            &nodes_without_master,
            pods,
            CheckMode::Detailed(self.context.client.as_ref()),
            self.context.predicate_checker.as_ref(),
            1,
            &self.pod_location_hints,
            &mut self.usage_tracker,
            now,
            pdbs,
            &DrainOptions::from(&options),
        )
        .await
        .map_err(|err| err.add_prefix("Find node to remove failed: "))?;

        let Some(to_remove) = simulation.removable.into_iter().next() else {
            info!("No node to remove");
            return Ok(ScaleDownResult::NoNodeDeleted);
        };

        let node_name = to_remove.node.name().to_string();
        let utilization = self
            .node_utilization_map
            .get(&node_name)
            .map(|u| u.utilization)
            .unwrap_or_default();
        let pod_names: Vec<String> = to_remove.pods_to_reschedule.iter().map(Pod::key).collect();
        let message = format!(
            "Scale-down: removing node {}, utilization: {}, pods to reschedule: {}",
            node_name,
            utilization,
            pod_names.join(",")
        );
        info!("{}", message);
        self.context
            .recorder
            .record("ConfigMap", STATUS_OBJECT, EventType::Normal, "ScaleDown", &message);

        remove_node_from_tracker(&mut self.usage_tracker, &node_name, &mut self.unneeded_nodes);
        self.node_delete_status.set_delete_in_progress(true);

        let ready = readiness.get(&node_name).copied().unwrap_or(false);
        let context = Arc::clone(&self.context);
        let cluster_state = Arc::clone(&self.cluster_state);
        let status = Arc::clone(&self.node_delete_status);
        tokio::spawn(async move {
            let result = delete_node(
                &context,
                &cluster_state,
                &to_remove.node,
                &to_remove.pods_to_reschedule,
                now,
            )
            .await;
            match &result {
                Ok(()) => {
                    let reason = if ready {
                        NodeScaleDownReason::Underutilized
                    } else {
                        NodeScaleDownReason::Unready
                    };
                    context.metrics.register_scale_down(1, reason);
                }
                Err(err) => error!("Failed to delete {}: {}", node_name, err),
            }
            status.add_node_delete_result(&node_name, result);
            status.set_delete_in_progress(false);
        });

        Ok(ScaleDownResult::NodeDeleteStarted)
    }

    /// Start one deletion task per empty node and wait for all of them
    async fn delete_empty_nodes(
        &mut self,
        nodes: Vec<Node>,
        readiness: &HashMap<String, bool>,
        now: DateTime<Utc>,
    ) -> Result<(), AutoscalerError> {
        let count = nodes.len();
        let deadline = Instant::now() + to_std(self.context.options.max_cloud_provider_node_deletion_time);
        let (tx, mut rx) = mpsc::channel(count);

        for node in nodes {
            info!("Scale-down: removing empty node {}", node.name());
            self.context.recorder.record(
                "ConfigMap",
                STATUS_OBJECT,
                EventType::Normal,
                "ScaleDownEmpty",
                &format!("Scale-down: removing empty node {}", node.name()),
            );
            remove_node_from_tracker(&mut self.usage_tracker, node.name(), &mut self.unneeded_nodes);

            let ready = readiness.get(node.name()).copied().unwrap_or(false);
            let context = Arc::clone(&self.context);
            let cluster_state = Arc::clone(&self.cluster_state);
            let status = Arc::clone(&self.node_delete_status);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = delete_empty_node(&context, &cluster_state, &node, ready, now).await;
                status.add_node_delete_result(node.name(), result.clone());
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut final_error = None;
        for _ in 0..count {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(err))) => {
                    error!("Problem with empty node deletion: {}", err);
                    final_error = Some(err);
                }
                Ok(None) => break,
                Err(_) => {
                    final_error = Some(AutoscalerError::Transient(
                        "Failed to delete nodes in time".to_string(),
                    ));
                    break;
                }
            }
        }

        match final_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Node Deletion
// =============================================================================

async fn clean_taint(node: &Node, client: &dyn KubeClient) {
    if let Err(err) = clean_to_be_deleted(node, client).await {
        warn!("Failed to clean deletion taint from {}: {}", node.name(), err);
    }
}

async fn delete_empty_node(
    context: &AutoscalingContext,
    cluster_state: &ClusterStateRegistry,
    node: &Node,
    ready: bool,
    now: DateTime<Utc>,
) -> Result<(), AutoscalerError> {
    if let Err(err) = mark_to_be_deleted(node, context.client.as_ref(), now).await {
        context.recorder.record(
            "Node",
            node.name(),
            EventType::Warning,
            "ScaleDownFailed",
            &format!("failed to mark the node as toBeDeleted/unschedulable: {}", err),
        );
        return Err(err.into());
    }

    match delete_node_from_cloud_provider(context, cluster_state, node).await {
        Ok(()) => {
            let reason = if ready {
                NodeScaleDownReason::Empty
            } else {
                NodeScaleDownReason::Unready
            };
            context.metrics.register_scale_down(1, reason);
            context.recorder.record(
                "ConfigMap",
                STATUS_OBJECT,
                EventType::Normal,
                "ScaleDownEmpty",
                &format!("Scale-down: empty node {} removed", node.name()),
            );
            Ok(())
        }
        Err(err) => {
            clean_taint(node, context.client.as_ref()).await;
            context.recorder.record(
                "Node",
                node.name(),
                EventType::Warning,
                "ScaleDownFailed",
                &format!("failed to delete empty node: {}", err),
            );
            Err(err)
        }
    }
}

/// Taint, drain and delete one node. The taint is removed again when any
/// step before the cloud deletion fails.
async fn delete_node(
    context: &AutoscalingContext,
    cluster_state: &ClusterStateRegistry,
    node: &Node,
    pods: &[Pod],
    now: DateTime<Utc>,
) -> Result<(), AutoscalerError> {
    if let Err(err) = mark_to_be_deleted(node, context.client.as_ref(), now).await {
        context.recorder.record(
            "Node",
            node.name(),
            EventType::Warning,
            "ScaleDownFailed",
            &format!("failed to mark the node as toBeDeleted/unschedulable: {}", err),
        );
        return Err(err.into());
    }
    context.recorder.record(
        "Node",
        node.name(),
        EventType::Normal,
        "ScaleDown",
        "marked the node as toBeDeleted/unschedulable",
    );

    if let Err(err) = drain_node(context, node, pods).await {
        clean_taint(node, context.client.as_ref()).await;
        context.recorder.record(
            "Node",
            node.name(),
            EventType::Warning,
            "ScaleDownFailed",
            "failed to drain the node, aborting ScaleDown",
        );
        return Err(err);
    }

    if let Err(err) = delete_node_from_cloud_provider(context, cluster_state, node).await {
        clean_taint(node, context.client.as_ref()).await;
        context.recorder.record(
            "Node",
            node.name(),
            EventType::Warning,
            "ScaleDownFailed",
            "failed to delete the node",
        );
        return Err(err);
    }
    Ok(())
}

async fn delete_node_from_cloud_provider(
    context: &AutoscalingContext,
    cluster_state: &ClusterStateRegistry,
    node: &Node,
) -> Result<(), AutoscalerError> {
    let group = context
        .cloud_provider
        .node_group_for_node(node)
        .map_err(|err| {
            AutoscalerError::CloudProvider(format!("failed to find node group for {}: {}", node.name(), err))
        })?
        .ok_or_else(|| {
            AutoscalerError::Internal(format!(
                "picked node that doesn't belong to a node group: {}",
                node.name()
            ))
        })?;

    group
        .delete_nodes(std::slice::from_ref(node))
        .await
        .map_err(|err| AutoscalerError::CloudProvider(format!("failed to delete {}: {}", node.name(), err)))?;

    context.recorder.record(
        "Node",
        node.name(),
        EventType::Normal,
        "ScaleDown",
        "node removed by cluster autoscaler",
    );
    let now = Utc::now();
    cluster_state.register_scale_down(ScaleDownRequest {
        node_name: node.name().to_string(),
        node_group: group,
        time: now,
        expected_delete_time: now + context.options.max_cloud_provider_node_deletion_time,
    });
    Ok(())
}

/// Evict every pod of the node, then wait until they are gone
async fn drain_node(context: &AutoscalingContext, node: &Node, pods: &[Pod]) -> Result<(), AutoscalerError> {
    let options = &context.options;
    let retry_until = Instant::now() + to_std(options.max_pod_eviction_time);
    let retry_interval = to_std(options.eviction_retry_time);
    let (tx, mut rx) = mpsc::channel(pods.len().max(1));

    for pod in pods {
        let client = Arc::clone(&context.client);
        let recorder = Arc::clone(&context.recorder);
        let pod = pod.clone();
        let max_grace = options.max_graceful_termination_sec;
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = evict_pod(
                client.as_ref(),
                recorder.as_ref(),
                &pod,
                max_grace,
                retry_until,
                retry_interval,
            )
            .await;
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let confirmation_deadline = retry_until + EVICTION_CONFIRMATION_SLACK;
    let mut eviction_errors = Vec::new();
    for _ in 0..pods.len() {
        match timeout_at(confirmation_deadline, rx.recv()).await {
            Ok(Some(Ok(()))) => context.metrics.register_evictions(1),
            Ok(Some(Err(err))) => eviction_errors.push(err.to_string()),
            Ok(None) | Err(_) => {
                return Err(AutoscalerError::ApiCall(format!(
                    "Failed to drain node {}: timeout when waiting for creating evictions",
                    node.name()
                )));
            }
        }
    }
    if !eviction_errors.is_empty() {
        return Err(AutoscalerError::ApiCall(format!(
            "Failed to drain node {}, due to following errors: {}",
            node.name(),
            eviction_errors.join("; ")
        )));
    }

    let gone_deadline = Instant::now()
        + std::time::Duration::from_secs(options.max_graceful_termination_sec.max(0) as u64)
        + to_std(options.pod_eviction_headroom);
    loop {
        if all_pods_gone(context.client.as_ref(), node, pods).await {
            info!("All pods removed from {}", node.name());
            return Ok(());
        }
        if Instant::now() >= gone_deadline {
            break;
        }
        sleep(to_std(options.pod_gone_poll_interval)).await;
    }
    Err(AutoscalerError::Transient(format!(
        "Failed to drain node {}: pods remaining after timeout",
        node.name()
    )))
}

async fn all_pods_gone(client: &dyn KubeClient, node: &Node, pods: &[Pod]) -> bool {
    for pod in pods {
        match client.get_pod(pod.namespace(), pod.name()).await {
            Ok(current) if current.spec.node_name == node.name() => {
                debug!("Not deleted yet {}", pod.key());
                return false;
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                error!("Failed to check pod {}: {}", pod.key(), err);
                return false;
            }
        }
    }
    true
}

/// Evict one pod, retrying until `retry_until`. A pod that is already gone
/// counts as evicted.
async fn evict_pod(
    client: &dyn KubeClient,
    recorder: &dyn EventRecorder,
    pod: &Pod,
    max_graceful_termination_sec: i64,
    retry_until: Instant,
    retry_interval: std::time::Duration,
) -> Result<(), ApiError> {
    recorder.record(
        "Pod",
        &pod.key(),
        EventType::Normal,
        "ScaleDown",
        "deleting pod for node scale down",
    );

    let grace = pod
        .spec
        .termination_grace_period_seconds
        .map(|grace| grace.min(max_graceful_termination_sec))
        .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS);

    let last_error = loop {
        let err = match client.evict_pod(pod, grace).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => err,
        };
        if Instant::now() >= retry_until {
            break err;
        }
        sleep(retry_interval).await;
    };

    error!("Failed to evict pod {}, error: {}", pod.key(), last_error);
    recorder.record(
        "Pod",
        &pod.key(),
        EventType::Warning,
        "ScaleDownFailed",
        "failed to delete pod for ScaleDown",
    );
    Err(ApiError::Other(format!(
        "Failed to evict pod {} within allowed timeout (last error: {})",
        pod.key(),
        last_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;

    use crate::api::Controller;
    use crate::backoff::ExponentialBackoff;
    use crate::cloudprovider::{InMemoryCloudProvider, NodeGroup, ResourceLimiter, LIMIT_CPU};
    use crate::clusterstate::ClusterStateRegistryConfig;
    use crate::config::AutoscalingOptions;
    use crate::kube::taints::has_to_be_deleted_taint;
    use crate::kube::{InMemoryCluster, RecordingEventRecorder};
    use crate::metrics::AutoscalerMetrics;
    use crate::simulator::BasicPredicateChecker;

    struct Harness {
        provider: Arc<InMemoryCloudProvider>,
        cluster: Arc<InMemoryCluster>,
        recorder: Arc<RecordingEventRecorder>,
        metrics: Arc<AutoscalerMetrics>,
        registry: Arc<ClusterStateRegistry>,
        scale_down: ScaleDown,
    }

    impl Harness {
        fn new(options: AutoscalingOptions) -> Self {
            let provider = Arc::new(InMemoryCloudProvider::new());
            let cluster = Arc::new(InMemoryCluster::new());
            let recorder = Arc::new(RecordingEventRecorder::new());
            let metrics = AutoscalerMetrics::shared();
            let registry = Arc::new(ClusterStateRegistry::new(
                provider.clone(),
                ClusterStateRegistryConfig::from(&options),
                Box::new(ExponentialBackoff::new(
                    options.initial_node_group_backoff_duration,
                    options.max_node_group_backoff_duration,
                    options.node_group_backoff_reset_timeout,
                )),
                metrics.clone(),
                recorder.clone(),
            ));
            let context = Arc::new(AutoscalingContext::new(
                options,
                provider.clone(),
                cluster.clone(),
                cluster.clone(),
                Arc::new(BasicPredicateChecker::new()),
                recorder.clone(),
                metrics.clone(),
            ));
            let scale_down = ScaleDown::new(context, registry.clone());
            Self {
                provider,
                cluster,
                recorder,
                metrics,
                registry,
                scale_down,
            }
        }

        fn add_node(&self, group: &str, index: usize, now: DateTime<Utc>) -> Node {
            let group = self.provider.group(group).unwrap();
            let provider_id = group.instance_id(index);
            group.add_instance(provider_id.clone());
            let node = Node::new(format!("{}-{}", group.id(), index))
                .with_provider_id(provider_id)
                .with_capacity(1000, 1000)
                .created_at(now - Duration::hours(1))
                .with_ready(true, now - Duration::hours(1));
            self.cluster.add_node(node.clone());
            node
        }

        fn add_pod(&self, name: &str, node: &str, cpu: i64) -> Pod {
            let pod = Pod::new("default", name)
                .with_requests(cpu, 100)
                .owned_by("ReplicaSet", "web")
                .on_node(node);
            self.cluster.add_pod(pod.clone());
            pod
        }

        fn pods(&self) -> Vec<Pod> {
            use crate::kube::ListerRegistry;
            self.cluster.scheduled_pods().unwrap()
        }
    }

    fn fast_drain_options() -> AutoscalingOptions {
        AutoscalingOptions {
            max_graceful_termination_sec: 0,
            max_pod_eviction_time: Duration::milliseconds(50),
            eviction_retry_time: Duration::milliseconds(10),
            pod_eviction_headroom: Duration::milliseconds(200),
            pod_gone_poll_interval: Duration::milliseconds(10),
            ..AutoscalingOptions::default()
        }
    }

    async fn wait_for_deletion(status: &NodeDeleteStatus) {
        for _ in 0..500 {
            if !status.is_delete_in_progress() {
                return;
            }
            sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("deletion did not finish");
    }

    #[tokio::test]
    async fn test_unneeded_nodes_keep_first_seen_time() {
        let mut h = Harness::new(AutoscalingOptions::default());
        let now = Utc::now();
        h.provider.add_node_group("ng1", 0, 10, 3, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now), h.add_node("ng1", 2, now)];
        h.add_pod("busy", "ng1-0", 600);
        h.add_pod("light", "ng1-1", 200);
        let pods = h.pods();

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        let mut unneeded: Vec<&str> = h.scale_down.unneeded_nodes().iter().map(|n| n.name()).collect();
        unneeded.sort();
        assert_eq!(unneeded, vec!["ng1-1", "ng1-2"]);
        assert_eq!(h.scale_down.unneeded_since("ng1-1"), Some(now));
        assert!((h.scale_down.utilization("ng1-0").unwrap().utilization - 0.6).abs() < 1e-9);
        assert_eq!(h.metrics.snapshot().unneeded_nodes, 2);

        let later = now + Duration::minutes(1);
        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, later, &[]).await.unwrap();
        assert_eq!(h.scale_down.unneeded_since("ng1-1"), Some(now));
        assert_eq!(h.scale_down.unneeded_since("ng1-2"), Some(now));
    }

    #[tokio::test]
    async fn test_unremovable_nodes_rechecked_after_timeout() {
        let mut h = Harness::new(AutoscalingOptions::default());
        let now = Utc::now();
        h.provider.add_node_group("ng1", 0, 10, 2, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now)];
        h.cluster.add_pod(Pod::new("default", "bare").with_requests(200, 100).on_node("ng1-1"));
        h.add_pod("busy", "ng1-0", 600);

        let pods = h.pods();
        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        assert!(h.scale_down.unneeded_since("ng1-1").is_none());
        assert_eq!(h.scale_down.unremovable_until("ng1-1"), Some(now + Duration::minutes(5)));

        // Becomes movable, but is not simulated again before the recheck time
        h.cluster.remove_pod("default/bare");
        h.add_pod("light", "ng1-1", 200);
        let pods = h.pods();
        h.scale_down
            .update_unneeded_nodes(&nodes, &nodes, &pods, now + Duration::minutes(1), &[])
            .await
            .unwrap();
        assert!(h.scale_down.unneeded_since("ng1-1").is_none());

        let recheck = now + Duration::minutes(6);
        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, recheck, &[]).await.unwrap();
        assert_eq!(h.scale_down.unneeded_since("ng1-1"), Some(recheck));
        assert!(h.scale_down.unremovable_until("ng1-1").is_none());
    }

    #[tokio::test]
    async fn test_empty_nodes_deleted_in_bulk() {
        let mut h = Harness::new(AutoscalingOptions::default());
        let now = Utc::now();
        let group = h.provider.add_node_group("ng1", 1, 10, 3, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now), h.add_node("ng1", 2, now)];
        h.add_pod("busy", "ng1-0", 600);
        let pods = h.pods();

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        let result = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(11))
            .await
            .unwrap();

        assert_eq!(result, ScaleDownResult::NodeDeleted);
        assert_eq!(group.current_target(), 1);
        assert!(has_to_be_deleted_taint(&h.cluster.node("ng1-1").unwrap()));
        assert_eq!(h.registry.get_scale_down_requests().len(), 2);
        assert_eq!(h.metrics.snapshot().scaled_down_empty_nodes, 2);

        let results = h.scale_down.node_delete_status().drain_node_delete_results();
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.is_ok()));
        assert!(h.scale_down.node_delete_status().drain_node_delete_results().is_empty());
    }

    #[tokio::test]
    async fn test_node_removable_exactly_at_unneeded_time() {
        let mut h = Harness::new(AutoscalingOptions::default());
        let now = Utc::now();
        let group = h.provider.add_node_group("ng1", 1, 10, 2, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now)];
        h.add_pod("busy", "ng1-0", 600);
        let pods = h.pods();

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        let early = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(10) - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(early, ScaleDownResult::NoUnneeded);

        let result = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(result, ScaleDownResult::NodeDeleted);
        assert_eq!(group.current_target(), 1);
    }

    #[tokio::test]
    async fn test_slow_empty_node_deletion_times_out() {
        let mut h = Harness::new(AutoscalingOptions {
            max_cloud_provider_node_deletion_time: Duration::milliseconds(50),
            ..AutoscalingOptions::default()
        });
        let now = Utc::now();
        let group = h.provider.add_node_group("ng1", 1, 10, 2, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now)];
        h.add_pod("busy", "ng1-0", 600);
        let pods = h.pods();
        group.set_delete_delay(std::time::Duration::from_millis(300));

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        let result = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(11))
            .await;
        match result {
            Err(AutoscalerError::Transient(msg)) => assert!(msg.contains("in time")),
            other => panic!("expected a transient error, got {:?}", other),
        }
        assert_eq!(group.current_target(), 2);

        // The deletion keeps running and reports once the provider returns
        let status = h.scale_down.node_delete_status();
        let mut results = HashMap::new();
        for _ in 0..200 {
            results.extend(status.drain_node_delete_results());
            if !results.is_empty() {
                break;
            }
            sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(matches!(results.get("ng1-1"), Some(Ok(()))));
        assert_eq!(group.current_target(), 1);
        assert!(!group.has_instance(&group.instance_id(1)));
    }

    #[tokio::test]
    async fn test_empty_deletion_respects_min_size() {
        let mut h = Harness::new(AutoscalingOptions::default());
        let now = Utc::now();
        let group = h.provider.add_node_group("ng1", 2, 10, 3, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now), h.add_node("ng1", 2, now)];
        h.add_pod("busy", "ng1-0", 600);
        let pods = h.pods();

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        let result = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(11))
            .await
            .unwrap();

        assert_eq!(result, ScaleDownResult::NodeDeleted);
        assert_eq!(group.current_target(), 2);
    }

    #[tokio::test]
    async fn test_nothing_removed_before_unneeded_time() {
        let mut h = Harness::new(AutoscalingOptions::default());
        let now = Utc::now();
        h.provider.add_node_group("ng1", 0, 10, 2, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now)];
        let pods = h.pods();

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        let result = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(result, ScaleDownResult::NoUnneeded);
    }

    #[tokio::test]
    async fn test_group_at_min_size_not_scaled_down() {
        let mut h = Harness::new(AutoscalingOptions::default());
        let now = Utc::now();
        h.provider.add_node_group("ng1", 2, 10, 2, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now)];
        let pods = h.pods();

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        assert_eq!(h.scale_down.unneeded_nodes().len(), 2);
        let result = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(result, ScaleDownResult::NoUnneeded);
    }

    #[tokio::test]
    async fn test_cpu_minimum_blocks_scale_down() {
        let mut h = Harness::new(AutoscalingOptions::default());
        let now = Utc::now();
        let group = h.provider.add_node_group("ng1", 0, 10, 3, None);
        h.provider.set_resource_limiter(Some(ResourceLimiter::new(
            [(LIMIT_CPU.to_string(), 3)].into_iter().collect(),
            HashMap::new(),
        )));
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now), h.add_node("ng1", 2, now)];
        let pods = h.pods();

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        let result = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(result, ScaleDownResult::NoUnneeded);
        assert_eq!(group.current_target(), 3);
    }

    #[tokio::test]
    async fn test_non_empty_node_drained_and_deleted() {
        let mut h = Harness::new(fast_drain_options());
        let now = Utc::now();
        let group = h.provider.add_node_group("ng1", 0, 10, 2, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now)];
        h.cluster.add_controller(Controller::new("ReplicaSet", "default", "web", 2));
        h.add_pod("busy", "ng1-0", 600);
        h.add_pod("light", "ng1-1", 200);
        let pods = h.pods();

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        assert_eq!(h.scale_down.unneeded_nodes().len(), 1);

        let result = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(result, ScaleDownResult::NodeDeleteStarted);

        let status = h.scale_down.node_delete_status();
        wait_for_deletion(&status).await;
        let results = status.drain_node_delete_results();
        assert_eq!(results.get("ng1-1"), Some(&Ok(())));
        assert_eq!(h.cluster.eviction_count(), 1);
        assert_eq!(group.current_target(), 1);
        assert_eq!(h.metrics.snapshot().scaled_down_nodes, 1);
        assert_eq!(h.metrics.snapshot().evictions, 1);
        assert!(h.recorder.has_reason("ScaleDown"));
    }

    #[tokio::test]
    async fn test_in_progress_blocks_second_drain() {
        let mut h = Harness::new(fast_drain_options());
        let now = Utc::now();
        h.provider.add_node_group("ng1", 0, 10, 2, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now)];
        h.cluster.add_controller(Controller::new("ReplicaSet", "default", "web", 2));
        h.add_pod("busy", "ng1-0", 600);
        h.add_pod("light", "ng1-1", 200);
        let pods = h.pods();

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        h.scale_down.node_delete_status().set_delete_in_progress(true);
        let result = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(result, ScaleDownResult::InProgress);
        assert_eq!(h.cluster.eviction_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_drain_removes_taint() {
        let mut h = Harness::new(fast_drain_options());
        let now = Utc::now();
        let group = h.provider.add_node_group("ng1", 0, 10, 2, None);
        let nodes = vec![h.add_node("ng1", 0, now), h.add_node("ng1", 1, now)];
        h.cluster.add_controller(Controller::new("ReplicaSet", "default", "web", 2));
        h.add_pod("busy", "ng1-0", 600);
        h.add_pod("light", "ng1-1", 200);
        h.cluster.set_fail_evictions(true);
        let pods = h.pods();

        h.scale_down.update_unneeded_nodes(&nodes, &nodes, &pods, now, &[]).await.unwrap();
        let result = h
            .scale_down
            .try_to_scale_down(&nodes, &pods, &[], now + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(result, ScaleDownResult::NodeDeleteStarted);

        let status = h.scale_down.node_delete_status();
        wait_for_deletion(&status).await;
        let results = status.drain_node_delete_results();
        assert!(matches!(results.get("ng1-1"), Some(Err(AutoscalerError::ApiCall(_)))));
        assert!(!has_to_be_deleted_taint(&h.cluster.node("ng1-1").unwrap()));
        assert!(h.recorder.has_reason("ScaleDownFailed"));
        assert_eq!(group.current_target(), 2);
    }

    #[tokio::test]
    async fn test_evict_pod_treats_missing_pod_as_evicted() {
        let cluster = InMemoryCluster::new();
        let recorder = RecordingEventRecorder::new();
        let pod = Pod::new("default", "gone").on_node("n1");

        let result = evict_pod(
            &cluster,
            &recorder,
            &pod,
            600,
            Instant::now(),
            std::time::Duration::from_millis(1),
        )
        .await;
        assert!(result.is_ok());
    }
}
