//! Drain rules: which pods must move off a node before it can be removed
//!
//! Mirror pods and pods stuck in termination are ignored, daemon set pods are
//! left in place, and everything else either moves or blocks the node.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use thiserror::Error;

use crate::api::{
    Controller, ControllerKind, Node, Pod, PodDisruptionBudget, SAFE_TO_EVICT_ANNOTATION,
    SYSTEM_NAMESPACE,
};
use crate::config::AutoscalingOptions;
use crate::kube::{ApiError, KubeClient};

use super::node_info::NodeInfo;

/// Why a node cannot be drained
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("{0} is not replicated")]
    NotReplicated(String),

    #[error("{kind} for {pod} is not available")]
    ControllerMissing { kind: String, pod: String },

    #[error("{kind} for {pod} has too few replicas spec: {replicas} min: {min}")]
    TooFewReplicas {
        kind: String,
        pod: String,
        replicas: i32,
        min: i32,
    },

    #[error("non-daemonset, non-mirrored, non-pdb-assigned kube-system pod present: {0}")]
    UnmovableSystemPod(String),

    #[error("pod with local storage present: {0}")]
    LocalStorage(String),

    #[error("pod annotated as not safe to evict present: {0}")]
    NotSafeToEvict(String),

    #[error("not enough pod disruption budget to move {0}")]
    NotEnoughPdb(String),
}

/// Knobs of the drain rules
#[derive(Debug, Clone)]
pub struct DrainOptions {
    pub skip_nodes_with_system_pods: bool,
    pub skip_nodes_with_local_storage: bool,
    /// Replica floor enforced by detailed checks
    pub min_replica_count: i32,
    /// Pods deleted longer ago than this are ignored
    pub pod_long_termination_timeout: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self::from(&AutoscalingOptions::default())
    }
}

impl From<&AutoscalingOptions> for DrainOptions {
    fn from(options: &AutoscalingOptions) -> Self {
        Self {
            skip_nodes_with_system_pods: options.skip_nodes_with_system_pods,
            skip_nodes_with_local_storage: options.skip_nodes_with_local_storage,
            min_replica_count: options.min_replica_count,
            pod_long_termination_timeout: options.pod_long_termination_timeout,
        }
    }
}

/// Controllers fetched ahead of a detailed check, keyed by "kind/namespace/name".
/// `None` marks a controller that does not exist.
#[derive(Debug, Clone, Default)]
pub struct ControllerCache {
    controllers: HashMap<String, Option<Controller>>,
}

fn controller_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", kind, namespace, name)
}

impl ControllerCache {
    /// Fetch the controllers of every pod concurrently.
    ///
    /// Missing controllers are recorded as absent; any other API failure is
    /// returned since it says nothing about the pods.
    pub async fn fetch(pods: &[Pod], client: &dyn KubeClient) -> Result<Self, ApiError> {
        let mut wanted: Vec<(String, String, String)> = Vec::new();
        for pod in pods {
            if let Some(owner) = pod.controller_ref() {
                if matches!(ControllerKind::from(owner.kind.as_str()), ControllerKind::Other(_)) {
                    continue;
                }
                let entry = (owner.kind.clone(), pod.metadata.namespace.clone(), owner.name.clone());
                if !wanted.contains(&entry) {
                    wanted.push(entry);
                }
            }
        }

        let lookups = wanted
            .iter()
            .map(|(kind, namespace, name)| client.get_controller(kind, namespace, name));
        let results = join_all(lookups).await;

        let mut controllers = HashMap::new();
        for ((kind, namespace, name), result) in wanted.iter().zip(results) {
            let value = match result {
                Ok(controller) => Some(controller),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err),
            };
            controllers.insert(controller_key(kind, namespace, name), value);
        }
        Ok(Self { controllers })
    }

    fn get(&self, kind: &str, namespace: &str, name: &str) -> Option<&Controller> {
        self.controllers
            .get(&controller_key(kind, namespace, name))
            .and_then(|c| c.as_ref())
    }
}

/// How thoroughly controller references are verified
#[derive(Debug, Clone, Copy)]
pub enum ReferenceCheck<'a> {
    /// Trust owner references as they are
    Fast,
    /// Require the controllers to exist and respect the replica floor
    Detailed(&'a ControllerCache),
}

/// Pods that must be moved to drain the node.
///
/// Fails when any pod blocks the drain.
pub fn get_pods_for_deletion_on_node_drain(
    pods: &[Pod],
    system_pdbs: &[PodDisruptionBudget],
    options: &DrainOptions,
    check: ReferenceCheck<'_>,
    now: DateTime<Utc>,
) -> Result<Vec<Pod>, DrainError> {
    let mut to_move = Vec::new();
    let termination_cutoff = now - options.pod_long_termination_timeout;

    for pod in pods {
        if pod.is_mirror() {
            continue;
        }
        if pod.deleted_before(termination_cutoff) {
            continue;
        }

        let safe_to_evict = pod.metadata.has_annotation(SAFE_TO_EVICT_ANNOTATION, "true");
        let terminal = pod.is_terminal();
        let mut replicated = false;
        let mut daemonset_pod = false;
        let mut missing_controller = None;

        if let Some(owner) = pod.controller_ref() {
            let kind = ControllerKind::from(owner.kind.as_str());
            if !matches!(kind, ControllerKind::Other(_)) {
                let daemonset = kind == ControllerKind::DaemonSet;
                let mut present = true;
                if let ReferenceCheck::Detailed(cache) = check {
                    match cache.get(&owner.kind, &pod.metadata.namespace, &owner.name) {
                        Some(controller) => {
                            let has_floor = matches!(
                                kind,
                                ControllerKind::ReplicationController | ControllerKind::ReplicaSet
                            );
                            if has_floor && controller.replicas < options.min_replica_count {
                                return Err(DrainError::TooFewReplicas {
                                    kind: owner.kind.clone(),
                                    pod: pod.key(),
                                    replicas: controller.replicas,
                                    min: options.min_replica_count,
                                });
                            }
                        }
                        None if daemonset => {
                            return Err(DrainError::ControllerMissing {
                                kind: owner.kind.clone(),
                                pod: pod.key(),
                            });
                        }
                        None => {
                            present = false;
                            missing_controller = Some(owner.kind.clone());
                        }
                    }
                }
                if daemonset {
                    daemonset_pod = true;
                } else {
                    replicated = present;
                }
            }
        }

        if daemonset_pod {
            continue;
        }

        if !safe_to_evict && !terminal {
            // An owner that no longer exists cannot recreate the pod
            if let Some(kind) = missing_controller {
                return Err(DrainError::ControllerMissing { kind, pod: pod.key() });
            }
            if !replicated {
                return Err(DrainError::NotReplicated(pod.key()));
            }
            if pod.metadata.namespace == SYSTEM_NAMESPACE
                && options.skip_nodes_with_system_pods
                && !system_pdbs.iter().any(|pdb| pdb.covers(pod))
            {
                return Err(DrainError::UnmovableSystemPod(pod.key()));
            }
            if pod.has_local_storage() && options.skip_nodes_with_local_storage {
                return Err(DrainError::LocalStorage(pod.key()));
            }
            if pod.metadata.has_annotation(SAFE_TO_EVICT_ANNOTATION, "false") {
                return Err(DrainError::NotSafeToEvict(pod.key()));
            }
        }

        to_move.push(pod.clone());
    }

    Ok(to_move)
}

/// Fail if moving the pods would break a disruption budget
pub fn check_pdbs(pods: &[Pod], pdbs: &[PodDisruptionBudget]) -> Result<(), DrainError> {
    for pdb in pdbs {
        for pod in pods {
            if pdb.covers(pod) && pdb.status.disruptions_allowed < 1 {
                return Err(DrainError::NotEnoughPdb(pod.key()));
            }
        }
    }
    Ok(())
}

fn system_pdbs(pdbs: &[PodDisruptionBudget]) -> Vec<PodDisruptionBudget> {
    pdbs.iter()
        .filter(|pdb| pdb.metadata.namespace == SYSTEM_NAMESPACE)
        .cloned()
        .collect()
}

/// Pods to move, trusting owner references without API calls
pub fn fast_get_pods_to_move(
    node_info: &NodeInfo,
    options: &DrainOptions,
    pdbs: &[PodDisruptionBudget],
    now: DateTime<Utc>,
) -> Result<Vec<Pod>, DrainError> {
    let pods = get_pods_for_deletion_on_node_drain(
        node_info.pods(),
        &system_pdbs(pdbs),
        options,
        ReferenceCheck::Fast,
        now,
    )?;
    check_pdbs(&pods, pdbs)?;
    Ok(pods)
}

/// Pods to move, verifying controllers against prefetched API state
pub fn detailed_get_pods_for_move(
    node_info: &NodeInfo,
    options: &DrainOptions,
    controllers: &ControllerCache,
    pdbs: &[PodDisruptionBudget],
    now: DateTime<Utc>,
) -> Result<Vec<Pod>, DrainError> {
    let pods = get_pods_for_deletion_on_node_drain(
        node_info.pods(),
        &system_pdbs(pdbs),
        options,
        ReferenceCheck::Detailed(controllers),
        now,
    )?;
    check_pdbs(&pods, pdbs)?;
    Ok(pods)
}

/// Nodes among `candidates` with nothing to move
pub fn find_empty_nodes_to_remove(
    candidates: &[Node],
    pods: &[Pod],
    options: &DrainOptions,
    now: DateTime<Utc>,
) -> Vec<Node> {
    let infos = super::node_info::create_node_name_to_info_map(pods, candidates);
    candidates
        .iter()
        .filter(|node| {
            infos
                .get(node.name())
                .map(|info| {
                    get_pods_for_deletion_on_node_drain(info.pods(), &[], options, ReferenceCheck::Fast, now)
                        .map(|pods| pods.is_empty())
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LabelSelector, PodPhase, RestartPolicy, VolumeSource, MIRROR_POD_ANNOTATION};
    use crate::kube::InMemoryCluster;

    fn drain(pods: &[Pod], check: ReferenceCheck<'_>) -> Result<Vec<Pod>, DrainError> {
        get_pods_for_deletion_on_node_drain(pods, &[], &DrainOptions::default(), check, Utc::now())
    }

    #[test]
    fn test_replicated_pod_moves() {
        let pod = Pod::new("default", "web").owned_by("ReplicaSet", "web-rs").on_node("n1");
        let moved = drain(&[pod], ReferenceCheck::Fast).unwrap();
        assert_eq!(moved.len(), 1);
    }

    #[test]
    fn test_unreplicated_pod_blocks() {
        let pod = Pod::new("default", "bare").on_node("n1");
        assert!(matches!(
            drain(&[pod], ReferenceCheck::Fast),
            Err(DrainError::NotReplicated(key)) if key == "default/bare"
        ));
    }

    #[test]
    fn test_daemonset_and_mirror_pods_ignored() {
        let ds = Pod::new("default", "logger").owned_by("DaemonSet", "logger").on_node("n1");
        let mirror = Pod::new("default", "static")
            .with_annotation(MIRROR_POD_ANNOTATION, "x")
            .on_node("n1");
        assert!(drain(&[ds, mirror], ReferenceCheck::Fast).unwrap().is_empty());
    }

    #[test]
    fn test_local_storage_blocks() {
        let pod = Pod::new("default", "cache")
            .owned_by("ReplicaSet", "cache")
            .with_volume("scratch", VolumeSource::EmptyDir)
            .on_node("n1");
        assert_eq!(
            drain(&[pod.clone()], ReferenceCheck::Fast).map(|pods| pods.len()),
            Err(DrainError::LocalStorage("default/cache".to_string()))
        );

        let relaxed = DrainOptions {
            skip_nodes_with_local_storage: false,
            ..Default::default()
        };
        let moved =
            get_pods_for_deletion_on_node_drain(&[pod], &[], &relaxed, ReferenceCheck::Fast, Utc::now())
                .unwrap();
        assert_eq!(moved.len(), 1);
    }

    #[test]
    fn test_system_pod_needs_pdb() {
        let pod = Pod::new("kube-system", "dns")
            .owned_by("ReplicaSet", "dns")
            .with_label("app", "dns")
            .on_node("n1");
        assert!(matches!(
            drain(&[pod.clone()], ReferenceCheck::Fast),
            Err(DrainError::UnmovableSystemPod(_))
        ));

        let pdb = PodDisruptionBudget::new("kube-system", "dns", LabelSelector::matching("app", "dns"), 1);
        let moved = get_pods_for_deletion_on_node_drain(
            &[pod],
            &[pdb],
            &DrainOptions::default(),
            ReferenceCheck::Fast,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(moved.len(), 1);
    }

    #[test]
    fn test_annotations() {
        let bare_but_safe = Pod::new("default", "bare")
            .with_annotation(SAFE_TO_EVICT_ANNOTATION, "true")
            .on_node("n1");
        assert_eq!(drain(&[bare_but_safe], ReferenceCheck::Fast).unwrap().len(), 1);

        let pinned = Pod::new("default", "pinned")
            .owned_by("ReplicaSet", "rs")
            .with_annotation(SAFE_TO_EVICT_ANNOTATION, "false")
            .on_node("n1");
        assert!(matches!(
            drain(&[pinned], ReferenceCheck::Fast),
            Err(DrainError::NotSafeToEvict(_))
        ));
    }

    #[test]
    fn test_terminal_pod_bypasses_rules() {
        let mut pod = Pod::new("default", "done").on_node("n1");
        pod.spec.restart_policy = RestartPolicy::Never;
        pod.status.phase = PodPhase::Succeeded;
        assert_eq!(drain(&[pod], ReferenceCheck::Fast).unwrap().len(), 1);
    }

    #[test]
    fn test_long_terminating_pod_ignored() {
        let now = Utc::now();
        let mut pod = Pod::new("default", "stuck").on_node("n1");
        pod.metadata.deletion_timestamp = Some(now - Duration::minutes(5));
        assert!(drain(&[pod], ReferenceCheck::Fast).unwrap().is_empty());
    }

    #[test]
    fn test_check_pdbs() {
        let pod = Pod::new("default", "web").with_label("app", "web");
        let exhausted = PodDisruptionBudget::new("default", "web", LabelSelector::matching("app", "web"), 0);
        assert_eq!(
            check_pdbs(&[pod.clone()], &[exhausted]),
            Err(DrainError::NotEnoughPdb("default/web".to_string()))
        );

        let open = PodDisruptionBudget::new("default", "web", LabelSelector::matching("app", "web"), 2);
        assert!(check_pdbs(&[pod], &[open]).is_ok());
    }

    #[tokio::test]
    async fn test_detailed_check_requires_controller() {
        let cluster = InMemoryCluster::new();
        cluster.add_controller(Controller::new("ReplicaSet", "default", "web", 1));

        let live = Pod::new("default", "web-1").owned_by("ReplicaSet", "web").on_node("n1");
        let orphan = Pod::new("default", "old-1").owned_by("ReplicaSet", "old").on_node("n1");

        let cache = ControllerCache::fetch(&[live.clone(), orphan.clone()], &cluster)
            .await
            .unwrap();
        assert_eq!(drain(&[live.clone()], ReferenceCheck::Detailed(&cache)).unwrap().len(), 1);
        assert!(matches!(
            drain(&[orphan], ReferenceCheck::Detailed(&cache)),
            Err(DrainError::ControllerMissing { .. })
        ));

        let strict = DrainOptions {
            min_replica_count: 2,
            ..Default::default()
        };
        let result = get_pods_for_deletion_on_node_drain(
            &[live],
            &[],
            &strict,
            ReferenceCheck::Detailed(&cache),
            Utc::now(),
        );
        assert!(matches!(result, Err(DrainError::TooFewReplicas { replicas: 1, min: 2, .. })));
    }

    #[test]
    fn test_safe_to_evict_pod_with_missing_controller_moves() {
        let cache = ControllerCache::default();
        let pod = Pod::new("default", "job-pod")
            .owned_by("ReplicaSet", "gone")
            .with_annotation(SAFE_TO_EVICT_ANNOTATION, "true")
            .on_node("n1");
        let moved = drain(&[pod], ReferenceCheck::Detailed(&cache)).unwrap();
        assert_eq!(moved.len(), 1);

        let mut finished = Pod::new("default", "batch-1").owned_by("Job", "gone").on_node("n1");
        finished.spec.restart_policy = RestartPolicy::Never;
        finished.status.phase = PodPhase::Succeeded;
        assert_eq!(drain(&[finished], ReferenceCheck::Detailed(&cache)).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_daemonset_blocks_even_when_safe_to_evict() {
        let cache = ControllerCache::default();
        let pod = Pod::new("default", "logger")
            .owned_by("DaemonSet", "gone")
            .with_annotation(SAFE_TO_EVICT_ANNOTATION, "true")
            .on_node("n1");
        assert!(matches!(
            drain(&[pod], ReferenceCheck::Detailed(&cache)),
            Err(DrainError::ControllerMissing { .. })
        ));
    }

    #[test]
    fn test_find_empty_nodes() {
        let nodes = vec![Node::new("empty"), Node::new("busy"), Node::new("ds-only")];
        let pods = vec![
            Pod::new("default", "web").owned_by("ReplicaSet", "web").on_node("busy"),
            Pod::new("default", "logger").owned_by("DaemonSet", "logger").on_node("ds-only"),
        ];
        let empty = find_empty_nodes_to_remove(&nodes, &pods, &DrainOptions::default(), Utc::now());
        let names: Vec<&str> = empty.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["empty", "ds-only"]);
    }
}
