//! In-memory cluster - nodes, pods and policy objects held in process
//!
//! Implements both [`KubeClient`] and [`ListerRegistry`]. There is no
//! scheduler: pods without a node are reported as unschedulable, and evicted
//! pods simply disappear.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{ApiError, KubeClient, ListerRegistry};
use crate::api::{Controller, DaemonSet, Node, Pod, PodDisruptionBudget};

/// The in-memory cluster holds every object in concurrent maps
#[derive(Debug, Clone, Default)]
pub struct InMemoryCluster {
    /// Nodes indexed by name
    nodes: Arc<DashMap<String, Node>>,

    /// Pods indexed by "namespace/name"
    pods: Arc<DashMap<String, Pod>>,

    /// Disruption budgets indexed by "namespace/name"
    pdbs: Arc<DashMap<String, PodDisruptionBudget>>,

    /// Daemon sets indexed by "namespace/name"
    daemonsets: Arc<DashMap<String, DaemonSet>>,

    /// Workload controllers indexed by "kind/namespace/name"
    controllers: Arc<DashMap<String, Controller>>,

    evictions: Arc<AtomicUsize>,
    fail_evictions: Arc<AtomicBool>,
}

fn controller_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", kind, namespace, name)
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Object Management
    // =========================================================================

    /// Add or replace a node
    pub fn add_node(&self, node: Node) {
        self.nodes.insert(node.metadata.name.clone(), node);
    }

    /// Remove a node and every pod bound to it
    pub fn remove_node(&self, name: &str) -> Option<Node> {
        self.pods.retain(|_, pod| pod.spec.node_name != name);
        self.nodes.remove(name).map(|(_, node)| node)
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.get(name).map(|n| n.value().clone())
    }

    /// Add or replace a pod
    pub fn add_pod(&self, pod: Pod) {
        self.pods.insert(pod.key(), pod);
    }

    pub fn remove_pod(&self, key: &str) -> Option<Pod> {
        self.pods.remove(key).map(|(_, pod)| pod)
    }

    /// Pods bound to the node
    pub fn pods_on(&self, node_name: &str) -> Vec<Pod> {
        self.pods
            .iter()
            .filter(|p| p.spec.node_name == node_name)
            .map(|p| p.value().clone())
            .collect()
    }

    pub fn add_pdb(&self, pdb: PodDisruptionBudget) {
        let key = format!("{}/{}", pdb.metadata.namespace, pdb.metadata.name);
        self.pdbs.insert(key, pdb);
    }

    pub fn add_daemonset(&self, ds: DaemonSet) {
        let key = format!("{}/{}", ds.metadata.namespace, ds.metadata.name);
        self.daemonsets.insert(key, ds);
    }

    pub fn add_controller(&self, controller: Controller) {
        let key = controller_key(
            &controller.kind,
            &controller.metadata.namespace,
            &controller.metadata.name,
        );
        self.controllers.insert(key, controller);
    }

    /// Number of successful evictions
    pub fn eviction_count(&self) -> usize {
        self.evictions.load(Ordering::SeqCst)
    }

    /// Make every eviction fail until reset
    pub fn set_fail_evictions(&self, fail: bool) {
        self.fail_evictions.store(fail, Ordering::SeqCst);
    }

    fn sorted<T: Clone>(map: &DashMap<String, T>) -> Vec<T> {
        let mut entries: Vec<(String, T)> = map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, v)| v).collect()
    }
}

// =============================================================================
// Live API
// =============================================================================

#[async_trait]
impl KubeClient for InMemoryCluster {
    async fn get_node(&self, name: &str) -> Result<Node, ApiError> {
        self.node(name)
            .ok_or_else(|| ApiError::NotFound(format!("node/{}", name)))
    }

    async fn update_node(&self, node: &Node) -> Result<(), ApiError> {
        let mut existing = self
            .nodes
            .get_mut(node.name())
            .ok_or_else(|| ApiError::NotFound(format!("node/{}", node.name())))?;
        *existing = node.clone();
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ApiError> {
        let key = format!("{}/{}", namespace, name);
        self.pods
            .get(&key)
            .map(|p| p.value().clone())
            .ok_or_else(|| ApiError::NotFound(format!("pod/{}", key)))
    }

    async fn evict_pod(&self, pod: &Pod, _grace_period_seconds: i64) -> Result<(), ApiError> {
        if self.fail_evictions.load(Ordering::SeqCst) {
            return Err(ApiError::Other(format!(
                "eviction of {} rejected",
                pod.key()
            )));
        }

        let key = pod.key();
        if !self.pods.contains_key(&key) {
            return Err(ApiError::NotFound(format!("pod/{}", key)));
        }

        for mut pdb in self.pdbs.iter_mut() {
            if pdb.covers(pod) {
                if pdb.status.disruptions_allowed < 1 {
                    return Err(ApiError::Other(format!(
                        "cannot evict {} as it would violate the disruption budget {}",
                        key, pdb.metadata.name
                    )));
                }
                pdb.status.disruptions_allowed -= 1;
            }
        }

        self.pods.remove(&key);
        self.evictions.fetch_add(1, Ordering::SeqCst);
        debug!("Evicted pod {}", key);
        Ok(())
    }

    async fn get_controller(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Controller, ApiError> {
        if kind == "DaemonSet" {
            let ds_key = format!("{}/{}", namespace, name);
            if self.daemonsets.contains_key(&ds_key) {
                return Ok(Controller::new(kind, namespace, name, 0));
            }
        }
        let key = controller_key(kind, namespace, name);
        self.controllers
            .get(&key)
            .map(|c| c.value().clone())
            .ok_or_else(|| ApiError::NotFound(key))
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ApiError> {
        Ok(self.pods_on(node_name))
    }
}

// =============================================================================
// Listers
// =============================================================================

impl ListerRegistry for InMemoryCluster {
    fn all_nodes(&self) -> Result<Vec<Node>, ApiError> {
        Ok(Self::sorted(&self.nodes))
    }

    fn ready_nodes(&self) -> Result<Vec<Node>, ApiError> {
        Ok(Self::sorted(&self.nodes)
            .into_iter()
            .filter(|n| n.is_ready())
            .collect())
    }

    fn scheduled_pods(&self) -> Result<Vec<Pod>, ApiError> {
        Ok(Self::sorted(&self.pods)
            .into_iter()
            .filter(|p| !p.spec.node_name.is_empty())
            .collect())
    }

    fn unschedulable_pods(&self) -> Result<Vec<Pod>, ApiError> {
        Ok(Self::sorted(&self.pods)
            .into_iter()
            .filter(|p| p.spec.node_name.is_empty())
            .collect())
    }

    fn pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>, ApiError> {
        Ok(Self::sorted(&self.pdbs))
    }

    fn daemonsets(&self) -> Result<Vec<DaemonSet>, ApiError> {
        Ok(Self::sorted(&self.daemonsets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LabelSelector;
    use chrono::Utc;

    fn setup() -> InMemoryCluster {
        let cluster = InMemoryCluster::new();
        cluster.add_node(Node::new("n1").with_ready(true, Utc::now()));
        cluster.add_node(Node::new("n2"));
        cluster.add_pod(Pod::new("default", "web-1").on_node("n1").with_label("app", "web"));
        cluster.add_pod(Pod::new("default", "pending"));
        cluster
    }

    #[test]
    fn test_listers() {
        let cluster = setup();
        assert_eq!(cluster.all_nodes().unwrap().len(), 2);
        assert_eq!(cluster.ready_nodes().unwrap().len(), 1);
        assert_eq!(cluster.scheduled_pods().unwrap().len(), 1);
        assert_eq!(cluster.unschedulable_pods().unwrap()[0].name(), "pending");
    }

    #[test]
    fn test_remove_node_drops_its_pods() {
        let cluster = setup();
        assert!(cluster.remove_node("n1").is_some());
        assert!(cluster.pods_on("n1").is_empty());
        assert_eq!(cluster.all_nodes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_respects_pdb() {
        let cluster = setup();
        cluster.add_pdb(PodDisruptionBudget::new(
            "default",
            "web",
            LabelSelector::matching("app", "web"),
            0,
        ));

        let pod = cluster.get_pod("default", "web-1").await.unwrap();
        assert!(cluster.evict_pod(&pod, 30).await.is_err());

        cluster.add_pdb(PodDisruptionBudget::new(
            "default",
            "web",
            LabelSelector::matching("app", "web"),
            1,
        ));
        cluster.evict_pod(&pod, 30).await.unwrap();
        assert_eq!(cluster.eviction_count(), 1);

        let err = cluster.evict_pod(&pod, 30).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_controller() {
        let cluster = InMemoryCluster::new();
        cluster.add_controller(Controller::new("ReplicaSet", "default", "web", 3));

        let rs = cluster.get_controller("ReplicaSet", "default", "web").await.unwrap();
        assert_eq!(rs.replicas, 3);
        assert!(cluster
            .get_controller("Job", "default", "web")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
