//! Node removal simulation
//!
//! For every candidate, checks whether all pods that must move can be placed
//! on the remaining nodes. Placement is all-or-nothing per candidate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::api::resources::{RESOURCE_CPU, RESOURCE_MEMORY};
use crate::api::{Node, Pod, PodDisruptionBudget};
use crate::errors::AutoscalerError;
use crate::kube::KubeClient;

use super::drain::{detailed_get_pods_for_move, fast_get_pods_to_move, ControllerCache, DrainOptions};
use super::node_info::{create_node_name_to_info_map, NodeInfo};
use super::predicates::PredicateChecker;
use super::tracker::UsageTracker;

/// A node that can go, with the pods that have to move first
#[derive(Debug, Clone)]
pub struct NodeToBeRemoved {
    pub node: Node,
    pub pods_to_reschedule: Vec<Pod>,
}

/// Outcome of a removal simulation
#[derive(Debug, Clone, Default)]
pub struct RemovalSimulation {
    pub removable: Vec<NodeToBeRemoved>,
    pub unremovable: Vec<Node>,
    /// Pod key ("namespace/name") to the node it was placed on
    pub new_hints: HashMap<String, String>,
}

/// How pods to move are determined
#[derive(Clone, Copy)]
pub enum CheckMode<'a> {
    /// Static ownership and annotation checks only
    Fast,
    /// Also verify controllers through the API
    Detailed(&'a dyn KubeClient),
}

impl CheckMode<'_> {
    fn label(&self) -> &'static str {
        match self {
            Self::Fast => "Fast evaluation",
            Self::Detailed(_) => "Detailed evaluation",
        }
    }
}

/// Find up to `max_count` nodes among `candidates` whose pods fit elsewhere.
///
/// Candidates are evaluated in the given order and the search stops as soon as
/// `max_count` removable nodes are found; later candidates are left out of
/// both lists.
#[allow(clippy::too_many_arguments)]
pub async fn find_nodes_to_remove(
    candidates: &[Node],
    all_nodes: &[Node],
    pods: &[Pod],
    mode: CheckMode<'_>,
    predicate_checker: &dyn PredicateChecker,
    max_count: usize,
    old_hints: &HashMap<String, String>,
    usage_tracker: &mut UsageTracker,
    now: DateTime<Utc>,
    pdbs: &[PodDisruptionBudget],
    drain_options: &DrainOptions,
) -> Result<RemovalSimulation, AutoscalerError> {
    let node_infos = create_node_name_to_info_map(pods, all_nodes);
    let evaluation = mode.label();
    let mut result = RemovalSimulation::default();

    let controllers = match mode {
        CheckMode::Fast => None,
        CheckMode::Detailed(client) => {
            let candidate_pods: Vec<Pod> = candidates
                .iter()
                .filter_map(|c| node_infos.get(c.name()))
                .flat_map(|info| info.pods().iter().cloned())
                .collect();
            let cache = ControllerCache::fetch(&candidate_pods, client)
                .await
                .map_err(|e| AutoscalerError::from(e).add_prefix("failed to fetch controllers: "))?;
            Some(cache)
        }
    };

    for node in candidates {
        debug!("{}: {} for removal", evaluation, node.name());

        let Some(node_info) = node_infos.get(node.name()) else {
            debug!("{}: nodeInfo for {} not found", evaluation, node.name());
            result.unremovable.push(node.clone());
            continue;
        };

        let pods_to_move = match &controllers {
            None => fast_get_pods_to_move(node_info, drain_options, pdbs, now),
            Some(cache) => detailed_get_pods_for_move(node_info, drain_options, cache, pdbs, now),
        };
        let pods_to_move = match pods_to_move {
            Ok(pods) => pods,
            Err(err) => {
                debug!("{}: node {} cannot be removed: {}", evaluation, node.name(), err);
                result.unremovable.push(node.clone());
                continue;
            }
        };

        match find_place_for(
            node.name(),
            &pods_to_move,
            all_nodes,
            &node_infos,
            predicate_checker,
            old_hints,
            &mut result.new_hints,
            usage_tracker,
            now,
        ) {
            Ok(()) => {
                debug!("{}: node {} may be removed", evaluation, node.name());
                result.removable.push(NodeToBeRemoved {
                    node: node.clone(),
                    pods_to_reschedule: pods_to_move,
                });
                if result.removable.len() >= max_count {
                    break;
                }
            }
            Err(problem) => {
                debug!(
                    "{}: node {} is not suitable for removal: {}",
                    evaluation,
                    node.name(),
                    problem
                );
                result.unremovable.push(node.clone());
            }
        }
    }

    Ok(result)
}

/// Place every pod on some node other than `removed_node`.
///
/// Each pod first tries its hinted node, then the other nodes in random order.
/// Placements accumulate in a local copy of the node infos so later pods see
/// earlier ones.
#[allow(clippy::too_many_arguments)]
fn find_place_for(
    removed_node: &str,
    pods: &[Pod],
    nodes: &[Node],
    node_infos: &HashMap<String, NodeInfo>,
    predicate_checker: &dyn PredicateChecker,
    old_hints: &HashMap<String, String>,
    new_hints: &mut HashMap<String, String>,
    usage_tracker: &mut UsageTracker,
    now: DateTime<Utc>,
) -> Result<(), String> {
    let mut new_node_infos: HashMap<String, NodeInfo> = HashMap::new();

    let mut shuffled: Vec<&Node> = nodes.iter().collect();
    shuffled.shuffle(&mut rand::thread_rng());

    for original in pods {
        let mut pod = original.clone();
        pod.spec.node_name.clear();
        let pod_key = pod.key();
        let metadata = predicate_checker.predicate_metadata(&pod);

        let mut try_node = |node_name: &str, new_node_infos: &mut HashMap<String, NodeInfo>| -> bool {
            let info = match new_node_infos.get(node_name).or_else(|| node_infos.get(node_name)) {
                Some(info) => info,
                None => return false,
            };
            if info.node().is_none() {
                warn!("No node in nodeInfo {}", node_name);
                return false;
            }
            match predicate_checker.check_predicates(&pod, Some(&metadata), info) {
                Ok(()) => {
                    let mut updated = info.clone();
                    updated.add_pod(pod.clone());
                    new_node_infos.insert(node_name.to_string(), updated);
                    new_hints.insert(pod_key.clone(), node_name.to_string());
                    true
                }
                Err(err) => {
                    trace!("Evaluation {} for {} -> {}", node_name, pod_key, err);
                    false
                }
            }
        };

        let mut target = None;
        if let Some(hinted) = old_hints.get(&pod_key) {
            if hinted != removed_node && try_node(hinted, &mut new_node_infos) {
                target = Some(hinted.clone());
            }
        }
        if target.is_none() {
            for node in &shuffled {
                if node.name() == removed_node {
                    continue;
                }
                if try_node(node.name(), &mut new_node_infos) {
                    target = Some(node.name().to_string());
                    break;
                }
            }
        }

        match target {
            Some(target) => usage_tracker.register_usage(removed_node, &target, now),
            None => {
                trace!("Pod {} can't be rescheduled on any existing node", pod_key);
                return Err(format!("failed to find place for {}", pod_key));
            }
        }
    }

    Ok(())
}

/// Why utilization could not be computed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtilizationError {
    #[error("failed to get {resource} from {node}")]
    Missing { resource: String, node: String },

    #[error("{resource} is 0 at {node}")]
    Zero { resource: String, node: String },
}

/// Requested share of a node's allocatable resources
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationInfo {
    pub cpu: f64,
    pub memory: f64,
    /// The larger of the two
    pub utilization: f64,
}

/// Ratio of pod requests to node allocatable for CPU and memory
pub fn calculate_utilization(
    node: &Node,
    node_info: &NodeInfo,
    skip_daemonset_pods: bool,
    skip_mirror_pods: bool,
) -> Result<UtilizationInfo, UtilizationError> {
    let cpu = utilization_of(node, node_info, RESOURCE_CPU, skip_daemonset_pods, skip_mirror_pods)?;
    let memory = utilization_of(node, node_info, RESOURCE_MEMORY, skip_daemonset_pods, skip_mirror_pods)?;
    Ok(UtilizationInfo {
        cpu,
        memory,
        utilization: cpu.max(memory),
    })
}

fn utilization_of(
    node: &Node,
    node_info: &NodeInfo,
    resource: &str,
    skip_daemonset_pods: bool,
    skip_mirror_pods: bool,
) -> Result<f64, UtilizationError> {
    let allocatable = node
        .status
        .allocatable
        .get(resource)
        .ok_or_else(|| UtilizationError::Missing {
            resource: resource.to_string(),
            node: node.name().to_string(),
        })?;
    if allocatable == 0 {
        return Err(UtilizationError::Zero {
            resource: resource.to_string(),
            node: node.name().to_string(),
        });
    }

    let requested: i64 = node_info
        .pods()
        .iter()
        .filter(|pod| !(skip_daemonset_pods && pod.is_daemonset_pod()))
        .filter(|pod| !(skip_mirror_pods && pod.is_mirror()))
        .map(|pod| pod.requests().get_or_zero(resource))
        .sum();

    Ok(requested as f64 / allocatable as f64)
}
