//! Cluster State Registry - the authoritative view of node group health
//!
//! The registry is responsible for:
//! - Tracking target sizes and acceptable size ranges per node group
//! - Counting node readiness per node group and cluster-wide
//! - Tracking in-flight scale-up and scale-down requests
//! - Backing off node groups whose scale-ups fail
//! - Building the status snapshot
//!
//! All state sits behind one mutex. The lock is never held across an await:
//! provider calls happen first, then the state is replaced in one critical
//! section.

pub mod api;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::Node;
use crate::backoff::Backoff;
use crate::cloudprovider::{CloudProvider, NodeGroup};
use crate::config::AutoscalingOptions;
use crate::errors::AutoscalerError;
use crate::kube::taints::has_to_be_deleted_taint;
use crate::kube::{EventRecorder, EventType};
use crate::metrics::{FailedScaleUpReason, MetricsSink};
use crate::simulator::NodeInfo;

pub use api::{
    AutoscalerCondition, AutoscalerStatus, ConditionStatus, ConditionType, NodeGroupStatus,
};

/// Nodes still starting after this long count as long-not-started
pub const MAX_NODE_STARTUP_TIME_MINUTES: i64 = 15;

/// Object that registry events are recorded on
pub const STATUS_OBJECT: &str = "cluster-autoscaler-status";

/// Thresholds used by the health checks
#[derive(Debug, Clone)]
pub struct ClusterStateRegistryConfig {
    /// Unready nodes tolerated, as a percentage of all nodes
    pub max_total_unready_percentage: f64,

    /// Unready nodes tolerated regardless of the percentage
    pub ok_total_unready_count: usize,

    /// How long an instance may stay unregistered
    pub max_node_provision_time: Duration,
}

impl From<&AutoscalingOptions> for ClusterStateRegistryConfig {
    fn from(options: &AutoscalingOptions) -> Self {
        Self {
            max_total_unready_percentage: options.max_total_unready_percentage,
            ok_total_unready_count: options.ok_total_unready_count,
            max_node_provision_time: options.max_node_provision_time,
        }
    }
}

/// Node counts by readiness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: usize,
    pub unready: usize,
    /// Nodes carrying the to-be-deleted taint
    pub deleted: usize,
    pub not_started: usize,
    pub long_not_started: usize,
    pub registered: usize,
    pub unregistered: usize,
    pub long_unregistered: usize,
    /// When the counts were taken
    pub time: DateTime<Utc>,
}

impl Readiness {
    /// Registered nodes past their start-up phase
    pub fn provisioned(&self) -> usize {
        self.registered
            .saturating_sub(self.not_started)
            .saturating_sub(self.long_not_started)
    }
}

/// Sizes a node group may legitimately have right now
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcceptableRange {
    pub min_nodes: i64,
    pub max_nodes: i64,
    pub current_target: i64,
}

/// An outstanding scale-up of one node group
#[derive(Debug, Clone)]
pub struct ScaleUpRequest {
    pub node_group: Arc<dyn NodeGroup>,
    pub time: DateTime<Utc>,
    /// When the new nodes should have registered
    pub expected_add_time: DateTime<Utc>,
    pub increase: usize,
}

/// An outstanding deletion of one node
#[derive(Debug, Clone)]
pub struct ScaleDownRequest {
    pub node_name: String,
    pub node_group: Arc<dyn NodeGroup>,
    pub time: DateTime<Utc>,
    /// When the node should be gone
    pub expected_delete_time: DateTime<Utc>,
}

/// A node group whose registered size is outside its acceptable range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncorrectNodeGroupSize {
    pub expected_size: i64,
    pub current_size: i64,
    /// First time this exact discrepancy was seen
    pub first_observed: DateTime<Utc>,
}

/// An instance the provider knows about that never joined the cluster
#[derive(Debug, Clone)]
pub struct UnregisteredNode {
    /// Placeholder node named after the provider id
    pub node: Node,
    pub unregistered_since: DateTime<Utc>,
}

struct RegistryState {
    scale_up_requests: HashMap<String, ScaleUpRequest>,
    scale_down_requests: Vec<ScaleDownRequest>,
    nodes: Vec<Node>,
    node_infos_for_groups: HashMap<String, NodeInfo>,
    per_node_group_readiness: HashMap<String, Readiness>,
    total_readiness: Readiness,
    acceptable_ranges: HashMap<String, AcceptableRange>,
    incorrect_node_group_sizes: HashMap<String, IncorrectNodeGroupSize>,
    unregistered_nodes: HashMap<String, UnregisteredNode>,
    candidates_for_scale_down: HashMap<String, Vec<String>>,
    last_scale_down_update_time: DateTime<Utc>,
    last_status: Option<AutoscalerStatus>,
    backoff: Box<dyn Backoff>,
}

/// The cluster state registry
pub struct ClusterStateRegistry {
    cloud_provider: Arc<dyn CloudProvider>,
    config: ClusterStateRegistryConfig,
    metrics: Arc<dyn MetricsSink>,
    recorder: Arc<dyn EventRecorder>,
    state: Mutex<RegistryState>,
}

impl ClusterStateRegistry {
    pub fn new(
        cloud_provider: Arc<dyn CloudProvider>,
        config: ClusterStateRegistryConfig,
        backoff: Box<dyn Backoff>,
        metrics: Arc<dyn MetricsSink>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            cloud_provider,
            config,
            metrics,
            recorder,
            state: Mutex::new(RegistryState {
                scale_up_requests: HashMap::new(),
                scale_down_requests: Vec::new(),
                nodes: Vec::new(),
                node_infos_for_groups: HashMap::new(),
                per_node_group_readiness: HashMap::new(),
                total_readiness: Readiness::default(),
                acceptable_ranges: HashMap::new(),
                incorrect_node_group_sizes: HashMap::new(),
                unregistered_nodes: HashMap::new(),
                candidates_for_scale_down: HashMap::new(),
                last_scale_down_update_time: Utc::now(),
                last_status: None,
                backoff,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Scale Requests
    // =========================================================================

    /// Record a scale-up, merging with an outstanding one for the same group
    pub fn register_scale_up(&self, request: ScaleUpRequest) {
        let mut state = self.lock();
        let id = request.node_group.id().to_string();
        match state.scale_up_requests.get_mut(&id) {
            Some(existing) => {
                existing.time = request.time;
                existing.expected_add_time = request.expected_add_time;
                existing.increase += request.increase;
            }
            None => {
                state.scale_up_requests.insert(id, request);
            }
        }
    }

    /// Record a node deletion
    pub fn register_scale_down(&self, request: ScaleDownRequest) {
        self.lock().scale_down_requests.push(request);
    }

    /// Record a failed scale-up and back the group off from now
    pub fn register_failed_scale_up(&self, node_group: &str, reason: FailedScaleUpReason) {
        self.metrics.register_failed_scale_up(reason);
        let mut state = self.lock();
        Self::backoff_node_group(&mut state, node_group, Utc::now());
    }

    fn backoff_node_group(state: &mut RegistryState, node_group: &str, now: DateTime<Utc>) {
        let until = state.backoff.backoff(node_group, now);
        warn!("Disabling scale-up for node group {} until {}", node_group, until);
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Refresh the registry from the current node list.
    ///
    /// Any provider error aborts the update and leaves the previous state in
    /// place.
    pub async fn update_nodes(
        &self,
        nodes: &[Node],
        node_infos_for_groups: HashMap<String, NodeInfo>,
        now: DateTime<Utc>,
    ) -> Result<(), AutoscalerError> {
        self.update_node_group_metrics();

        let target_sizes = get_target_sizes(self.cloud_provider.as_ref()).await?;
        let not_registered = get_not_registered_nodes(nodes, self.cloud_provider.as_ref(), now).await?;

        let mut state = self.lock();
        state.nodes = nodes.to_vec();
        state.node_infos_for_groups = node_infos_for_groups;
        Self::update_unregistered_nodes(&mut state, not_registered);
        self.update_readiness_stats(&mut state, now);
        self.update_acceptable_ranges(&mut state, &target_sizes);
        self.update_scale_requests(&mut state, now);
        // Expiring requests changes the ranges
        self.update_acceptable_ranges(&mut state, &target_sizes);
        self.update_incorrect_node_group_sizes(&mut state, now);
        Ok(())
    }

    /// Re-derive acceptable ranges from fresh target sizes
    pub async fn recalculate(&self) {
        let target_sizes = match get_target_sizes(self.cloud_provider.as_ref()).await {
            Ok(sizes) => sizes,
            Err(err) => {
                warn!("Failed to get target sizes, when trying to recalculate cluster state: {}", err);
                HashMap::new()
            }
        };
        let mut state = self.lock();
        self.update_acceptable_ranges(&mut state, &target_sizes);
    }

    fn update_node_group_metrics(&self) {
        let groups = self.cloud_provider.node_groups();
        let autoprovisioned = groups.iter().filter(|g| g.autoprovisioned()).count();
        self.metrics
            .update_node_groups_count(groups.len() - autoprovisioned, autoprovisioned);
    }

    fn update_unregistered_nodes(state: &mut RegistryState, found: Vec<UnregisteredNode>) {
        let mut merged = HashMap::with_capacity(found.len());
        for unregistered in found {
            let name = unregistered.node.metadata.name.clone();
            let entry = match state.unregistered_nodes.remove(&name) {
                Some(previous) => previous,
                None => unregistered,
            };
            merged.insert(name, entry);
        }
        state.unregistered_nodes = merged;
    }

    fn update_readiness_stats(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        let mut per_node_group: HashMap<String, Readiness> = HashMap::new();
        let mut total = Readiness::default();
        let startup_limit = Duration::minutes(MAX_NODE_STARTUP_TIME_MINUTES);

        let update = |current: &mut Readiness, node: &Node| {
            current.registered += 1;
            let still_starting = node.is_still_starting();
            if has_to_be_deleted_taint(node) {
                current.deleted += 1;
            } else if still_starting && node.metadata.creation_timestamp + startup_limit < now {
                current.long_not_started += 1;
            } else if still_starting {
                current.not_started += 1;
            } else if node.is_ready() {
                current.ready += 1;
            } else {
                current.unready += 1;
            }
        };

        for node in &state.nodes {
            match self.cloud_provider.node_group_for_node(node) {
                Err(err) => {
                    warn!("Failed to get nodegroup for {}: {}", node.name(), err);
                }
                Ok(Some(group)) => {
                    update(per_node_group.entry(group.id().to_string()).or_default(), node);
                }
                Ok(None) => {}
            }
            update(&mut total, node);
        }

        for unregistered in state.unregistered_nodes.values() {
            let group = match self.cloud_provider.node_group_for_node(&unregistered.node) {
                Ok(Some(group)) => group,
                Ok(None) => {
                    warn!("Nodegroup is nil for {}", unregistered.node.name());
                    continue;
                }
                Err(err) => {
                    warn!("Failed to get nodegroup for {}: {}", unregistered.node.name(), err);
                    continue;
                }
            };
            let per_group = per_node_group.entry(group.id().to_string()).or_default();
            if unregistered.unregistered_since + self.config.max_node_provision_time < now {
                per_group.long_unregistered += 1;
                total.long_unregistered += 1;
            } else {
                per_group.unregistered += 1;
                total.unregistered += 1;
            }
        }

        for readiness in per_node_group.values_mut() {
            readiness.time = now;
        }
        total.time = now;

        state.per_node_group_readiness = per_node_group;
        state.total_readiness = total;
    }

    fn update_acceptable_ranges(&self, state: &mut RegistryState, target_sizes: &HashMap<String, i64>) {
        let mut ranges: HashMap<String, AcceptableRange> = HashMap::new();
        for group in self.cloud_provider.node_groups() {
            let size = target_sizes.get(group.id()).copied().unwrap_or(0);
            ranges.insert(
                group.id().to_string(),
                AcceptableRange {
                    min_nodes: size,
                    max_nodes: size,
                    current_target: size,
                },
            );
        }
        for (id, request) in &state.scale_up_requests {
            ranges.entry(id.clone()).or_default().min_nodes -= request.increase as i64;
        }
        for request in &state.scale_down_requests {
            ranges
                .entry(request.node_group.id().to_string())
                .or_default()
                .max_nodes += 1;
        }
        state.acceptable_ranges = ranges;
    }

    fn update_scale_requests(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        state.backoff.remove_stale_backoff_data(now);

        let ids: Vec<String> = state.scale_up_requests.keys().cloned().collect();
        for id in ids {
            let Some(request) = state.scale_up_requests.get(&id).cloned() else {
                continue;
            };
            if !Self::are_there_upcoming_nodes(state, &id) {
                state.scale_up_requests.remove(&id);
                state.backoff.remove_backoff(&id);
                debug!(
                    "Scale up in group {} finished successfully in {}s",
                    id,
                    (now - request.time).num_seconds()
                );
                continue;
            }
            if request.expected_add_time < now {
                let waited = (now - request.time).num_seconds();
                warn!("Scale-up timed out for node group {} after {}s", id, waited);
                self.recorder.record(
                    "ConfigMap",
                    STATUS_OBJECT,
                    EventType::Warning,
                    "ScaleUpTimedOut",
                    &format!("Nodes added to group {} failed to register within {}s", id, waited),
                );
                self.metrics.register_failed_scale_up(FailedScaleUpReason::Timeout);
                Self::backoff_node_group(state, &id, now);
                state.scale_up_requests.remove(&id);
            }
        }

        state
            .scale_down_requests
            .retain(|request| request.expected_delete_time > now);
    }

    fn update_incorrect_node_group_sizes(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        let mut result = HashMap::new();
        for group in self.cloud_provider.node_groups() {
            let id = group.id();
            let registered = state
                .per_node_group_readiness
                .get(id)
                .map(|r| r.registered as i64)
                .unwrap_or(0);
            let Some(range) = state.acceptable_ranges.get(id) else {
                warn!("Acceptable range for node group {} not found", id);
                continue;
            };
            if registered > range.max_nodes || registered < range.min_nodes {
                let mut incorrect = IncorrectNodeGroupSize {
                    current_size: registered,
                    expected_size: range.current_target,
                    first_observed: now,
                };
                if let Some(existing) = state.incorrect_node_group_sizes.get(id) {
                    if existing.current_size == incorrect.current_size
                        && existing.expected_size == incorrect.expected_size
                    {
                        incorrect = *existing;
                    }
                }
                result.insert(id.to_string(), incorrect);
            }
        }
        state.incorrect_node_group_sizes = result;
    }

    /// Record the nodes currently considered for scale-down
    pub fn update_scale_down_candidates(&self, nodes: &[Node], now: DateTime<Utc>) {
        let mut candidates: HashMap<String, Vec<String>> = HashMap::new();
        for node in nodes {
            match self.cloud_provider.node_group_for_node(node) {
                Ok(Some(group)) => candidates
                    .entry(group.id().to_string())
                    .or_default()
                    .push(node.name().to_string()),
                Ok(None) => {}
                Err(err) => warn!("Failed to get node group for {}: {}", node.name(), err),
            }
        }
        let mut state = self.lock();
        state.candidates_for_scale_down = candidates;
        state.last_scale_down_update_time = now;
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Whether the cluster as a whole has few enough broken nodes
    pub fn is_cluster_healthy(&self) -> bool {
        let state = self.lock();
        self.is_cluster_healthy_locked(&state)
    }

    fn is_cluster_healthy_locked(&self, state: &RegistryState) -> bool {
        let total = &state.total_readiness;
        let total_unready = total.unready + total.long_not_started + total.long_unregistered;
        !(total_unready > self.config.ok_total_unready_count
            && total_unready as f64
                > self.config.max_total_unready_percentage / 100.0 * state.nodes.len() as f64)
    }

    /// Whether a node group has few enough missing ready nodes
    pub fn is_node_group_healthy(&self, id: &str) -> bool {
        let state = self.lock();
        self.is_node_group_healthy_locked(&state, id)
    }

    fn is_node_group_healthy_locked(&self, state: &RegistryState, id: &str) -> bool {
        let Some(range) = state.acceptable_ranges.get(id) else {
            warn!("Failed to find acceptable ranges for {}", id);
            return false;
        };

        let Some(readiness) = state.per_node_group_readiness.get(id) else {
            // No nodes yet: fine while the target is zero or the group is growing from zero
            if range.current_target == 0 || (range.min_nodes == 0 && range.current_target > 0) {
                return true;
            }
            warn!("Failed to find readiness information for {}", id);
            return false;
        };

        let unjustified_unready = (range.min_nodes - readiness.ready as i64).max(0);
        let observed =
            readiness.ready + readiness.unready + readiness.not_started + readiness.long_not_started;
        !(unjustified_unready > self.config.ok_total_unready_count as i64
            && unjustified_unready as f64
                > self.config.max_total_unready_percentage / 100.0 * observed as f64)
    }

    /// Healthy and not backed off
    pub fn is_node_group_safe_to_scale_up(&self, id: &str, now: DateTime<Utc>) -> bool {
        let state = self.lock();
        self.is_node_group_safe_to_scale_up_locked(&state, id, now)
    }

    fn is_node_group_safe_to_scale_up_locked(
        &self,
        state: &RegistryState,
        id: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.is_node_group_healthy_locked(state, id) && !state.backoff.is_backed_off(id, now)
    }

    fn provisioned_and_target(state: &RegistryState, id: &str) -> Option<(i64, i64)> {
        let range = state.acceptable_ranges.get(id)?;
        let provisioned = state
            .per_node_group_readiness
            .get(id)
            .map(|readiness| readiness.provisioned() as i64)
            .unwrap_or(0);
        Some((provisioned, range.current_target))
    }

    fn are_there_upcoming_nodes(state: &RegistryState, id: &str) -> bool {
        Self::provisioned_and_target(state, id)
            .map(|(provisioned, target)| target > provisioned)
            .unwrap_or(false)
    }

    /// Whether every requested node of the group has started
    pub fn is_node_group_at_target_size(&self, id: &str) -> bool {
        let state = self.lock();
        Self::provisioned_and_target(&state, id)
            .map(|(provisioned, target)| provisioned == target)
            .unwrap_or(false)
    }

    /// Whether a scale-up of the group is still materializing
    pub fn is_node_group_scaling_up(&self, id: &str) -> bool {
        let state = self.lock();
        Self::is_node_group_scaling_up_locked(&state, id)
    }

    fn is_node_group_scaling_up_locked(state: &RegistryState, id: &str) -> bool {
        Self::are_there_upcoming_nodes(state, id) && state.scale_up_requests.contains_key(id)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Nodes expected to join soon, per node group
    pub fn get_upcoming_nodes(&self) -> HashMap<String, usize> {
        let state = self.lock();
        let mut result = HashMap::new();
        for group in self.cloud_provider.node_groups() {
            let id = group.id();
            let readiness = state.per_node_group_readiness.get(id).copied().unwrap_or_default();
            let range = state.acceptable_ranges.get(id).copied().unwrap_or_default();
            let present = (readiness.ready
                + readiness.unready
                + readiness.long_not_started
                + readiness.long_unregistered) as i64;
            let new_nodes = range.current_target - present;
            if new_nodes > 0 {
                result.insert(id.to_string(), new_nodes as usize);
            }
        }
        result
    }

    /// Current and target cluster size
    pub fn get_cluster_size(&self) -> (usize, usize) {
        let state = self.lock();
        let current = state.total_readiness.provisioned();
        let target: i64 = state.acceptable_ranges.values().map(|r| r.current_target).sum();
        (current, target.max(0) as usize)
    }

    pub fn get_incorrect_node_group_size(&self, id: &str) -> Option<IncorrectNodeGroupSize> {
        self.lock().incorrect_node_group_sizes.get(id).copied()
    }

    pub fn get_unregistered_nodes(&self) -> Vec<UnregisteredNode> {
        let mut nodes: Vec<UnregisteredNode> = self.lock().unregistered_nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.node.metadata.name.cmp(&b.node.metadata.name));
        nodes
    }

    pub fn get_cluster_readiness(&self) -> Readiness {
        self.lock().total_readiness
    }

    pub fn get_node_group_readiness(&self, id: &str) -> Option<Readiness> {
        self.lock().per_node_group_readiness.get(id).copied()
    }

    pub fn get_acceptable_range(&self, id: &str) -> Option<AcceptableRange> {
        self.lock().acceptable_ranges.get(id).copied()
    }

    pub fn get_scale_up_request(&self, id: &str) -> Option<ScaleUpRequest> {
        self.lock().scale_up_requests.get(id).cloned()
    }

    pub fn get_scale_down_requests(&self) -> Vec<ScaleDownRequest> {
        self.lock().scale_down_requests.clone()
    }

    /// Templates passed in with the last update
    pub fn get_node_infos_for_groups(&self) -> HashMap<String, NodeInfo> {
        self.lock().node_infos_for_groups.clone()
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Build the status snapshot, keeping transition times of unchanged conditions
    pub fn get_status(&self, now: DateTime<Utc>) -> AutoscalerStatus {
        let mut state = self.lock();
        let mut status = AutoscalerStatus::default();

        for group in self.cloud_provider.node_groups() {
            let id = group.id();
            let readiness = state.per_node_group_readiness.get(id).copied().unwrap_or_default();
            let range = state.acceptable_ranges.get(id).copied().unwrap_or_default();
            let candidates = state
                .candidates_for_scale_down
                .get(id)
                .map(|c| c.len())
                .unwrap_or(0);

            let health = if self.is_node_group_healthy_locked(&state, id) {
                ConditionStatus::Healthy
            } else {
                ConditionStatus::Unhealthy
            };
            let scale_up = if Self::is_node_group_scaling_up_locked(&state, id) {
                ConditionStatus::InProgress
            } else if !self.is_node_group_safe_to_scale_up_locked(&state, id, now) {
                ConditionStatus::Backoff
            } else {
                ConditionStatus::NoActivity
            };

            status.node_group_statuses.push(NodeGroupStatus {
                provider_id: id.to_string(),
                conditions: vec![
                    AutoscalerCondition::new(
                        ConditionType::Health,
                        health,
                        format!(
                            "ready={} unready={} notStarted={} longNotStarted={} registered={} longUnregistered={} cloudProviderTarget={} (minSize={}, maxSize={})",
                            readiness.ready,
                            readiness.unready,
                            readiness.not_started,
                            readiness.long_not_started,
                            readiness.registered,
                            readiness.long_unregistered,
                            range.current_target,
                            group.min_size(),
                            group.max_size()
                        ),
                        readiness.time,
                    ),
                    AutoscalerCondition::new(
                        ConditionType::ScaleUp,
                        scale_up,
                        format!("ready={} cloudProviderTarget={}", readiness.ready, range.current_target),
                        readiness.time,
                    ),
                    scale_down_condition(candidates, state.last_scale_down_update_time),
                ],
            });
        }

        let total = state.total_readiness;
        let cluster_health = if self.is_cluster_healthy_locked(&state) {
            ConditionStatus::Healthy
        } else {
            ConditionStatus::Unhealthy
        };
        let scaling_up = status.node_group_statuses.iter().any(|s| {
            s.conditions.iter().any(|c| {
                c.condition_type == ConditionType::ScaleUp && c.status == ConditionStatus::InProgress
            })
        });
        let total_candidates: usize = state.candidates_for_scale_down.values().map(|c| c.len()).sum();

        status.clusterwide_conditions = vec![
            AutoscalerCondition::new(
                ConditionType::Health,
                cluster_health,
                format!(
                    "ready={} unready={} notStarted={} longNotStarted={} registered={} longUnregistered={}",
                    total.ready,
                    total.unready,
                    total.not_started,
                    total.long_not_started,
                    total.registered,
                    total.long_unregistered
                ),
                total.time,
            ),
            AutoscalerCondition::new(
                ConditionType::ScaleUp,
                if scaling_up {
                    ConditionStatus::InProgress
                } else {
                    ConditionStatus::NoActivity
                },
                format!("ready={} registered={}", total.ready, total.registered),
                total.time,
            ),
            scale_down_condition(total_candidates, state.last_scale_down_update_time),
        ];

        if let Some(previous) = &state.last_status {
            api::carry_over_transitions(previous, &mut status);
        }
        state.last_status = Some(status.clone());
        status
    }
}

fn scale_down_condition(candidates: usize, probed: DateTime<Utc>) -> AutoscalerCondition {
    let status = if candidates > 0 {
        ConditionStatus::CandidatesPresent
    } else {
        ConditionStatus::NoCandidates
    };
    AutoscalerCondition::new(
        ConditionType::ScaleDown,
        status,
        format!("candidates={}", candidates),
        probed,
    )
}

/// Target size of every node group; the first failure aborts
async fn get_target_sizes(
    cloud_provider: &dyn CloudProvider,
) -> Result<HashMap<String, i64>, AutoscalerError> {
    let groups = cloud_provider.node_groups();
    let sizes = join_all(groups.iter().map(|g| g.target_size())).await;

    let mut result = HashMap::with_capacity(groups.len());
    for (group, size) in groups.iter().zip(sizes) {
        let size = size.map_err(|e| {
            AutoscalerError::from(e)
                .add_prefix(format!("failed to get target size of node group {}: ", group.id()))
        })?;
        result.insert(group.id().to_string(), size as i64);
    }
    Ok(result)
}

/// Instances in node groups with no matching registered node
async fn get_not_registered_nodes(
    all_nodes: &[Node],
    cloud_provider: &dyn CloudProvider,
    now: DateTime<Utc>,
) -> Result<Vec<UnregisteredNode>, AutoscalerError> {
    let registered: HashSet<&str> = all_nodes.iter().map(|n| n.spec.provider_id.as_str()).collect();

    let mut not_registered = Vec::new();
    for group in cloud_provider.node_groups() {
        let instances = group.nodes().await.map_err(|e| {
            AutoscalerError::from(e)
                .add_prefix(format!("failed to list nodes of node group {}: ", group.id()))
        })?;
        for instance in instances {
            if !registered.contains(instance.as_str()) {
                not_registered.push(UnregisteredNode {
                    node: Node::new(instance.clone()).with_provider_id(instance),
                    unregistered_since: now,
                });
            }
        }
    }
    if !not_registered.is_empty() {
        info!("Found {} instances that are not registered", not_registered.len());
    }
    Ok(not_registered)
}
