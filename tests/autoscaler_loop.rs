//! Integration tests driving full autoscaler iterations against a cluster
//! seeded from a manifest.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::time::sleep;

use node_autoscaler::api::Controller;
use node_autoscaler::config::AutoscalingOptions;
use node_autoscaler::core::{spawn_autoscaler, AutoscalingContext, StaticAutoscaler};
use node_autoscaler::kube::{ListerRegistry, RecordingEventRecorder};
use node_autoscaler::manifest::{parse_manifest, SeededCluster};
use node_autoscaler::metrics::AutoscalerMetrics;
use node_autoscaler::simulator::BasicPredicateChecker;

struct TestCluster {
    seeded: SeededCluster,
    metrics: Arc<AutoscalerMetrics>,
    recorder: Arc<RecordingEventRecorder>,
}

impl TestCluster {
    fn new(manifest: &str) -> Self {
        Self {
            seeded: parse_manifest(manifest).unwrap().seed(),
            metrics: AutoscalerMetrics::shared(),
            recorder: Arc::new(RecordingEventRecorder::new()),
        }
    }

    fn autoscaler(&self, options: AutoscalingOptions) -> StaticAutoscaler {
        StaticAutoscaler::new(AutoscalingContext::new(
            options,
            self.seeded.cloud_provider.clone(),
            self.seeded.cluster.clone(),
            self.seeded.cluster.clone(),
            Arc::new(BasicPredicateChecker::new()),
            self.recorder.clone(),
            self.metrics.clone(),
        ))
    }

    fn target(&self, group: &str) -> usize {
        self.seeded.cloud_provider.group(group).unwrap().current_target()
    }

    fn node_count(&self) -> usize {
        self.seeded.cluster.all_nodes().unwrap().len()
    }
}

const FULL_NODE: &str = r#"
groups:
  - id: ng1
    min: 1
    max: 5
    nodes: 1
    shape: {cpu: 1000, memory: 1000000000}
pods:
  - {name: busy, node: ng1-0, cpu: 900, memory: 100, owner: {kind: ReplicaSet, name: web}}
  - {name: pending-0, cpu: 600, memory: 100}
  - {name: pending-1, cpu: 600, memory: 100}
"#;

const MOSTLY_EMPTY: &str = r#"
groups:
  - id: ng1
    min: 1
    max: 5
    nodes: 3
    shape: {cpu: 1000, memory: 1000000000}
pods:
  - {name: busy, node: ng1-0, cpu: 900, memory: 100, owner: {kind: ReplicaSet, name: web}}
"#;

const UNDERUTILIZED: &str = r#"
groups:
  - id: ng1
    min: 0
    max: 5
    nodes: 2
    shape: {cpu: 1000, memory: 1000000000}
pods:
  - {name: busy, node: ng1-0, cpu: 600, memory: 100, owner: {kind: ReplicaSet, name: web}}
  - {name: light, node: ng1-1, cpu: 200, memory: 100, owner: {kind: ReplicaSet, name: web}}
"#;

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

#[tokio::test]
async fn test_pending_pods_trigger_scale_up() {
    let cluster = TestCluster::new(FULL_NODE);
    let mut autoscaler = cluster.autoscaler(AutoscalingOptions::default());
    let now = Utc::now();

    autoscaler.run_once(now).await.unwrap();

    assert_eq!(cluster.target("ng1"), 3);
    assert_eq!(cluster.node_count(), 3);
    assert_eq!(cluster.metrics.snapshot().scaled_up_nodes, 2);
    assert!(cluster.recorder.has_reason("TriggeredScaleUp"));
    assert!(autoscaler.last_status().is_some());

    // The new nodes have room for the pending pods
    autoscaler.run_once(now + Duration::seconds(10)).await.unwrap();
    assert_eq!(cluster.target("ng1"), 3);
}

#[tokio::test]
async fn test_empty_nodes_removed_after_unneeded_time() {
    let cluster = TestCluster::new(MOSTLY_EMPTY);
    let mut autoscaler = cluster.autoscaler(AutoscalingOptions::default());
    let now = Utc::now();

    autoscaler.run_once(now).await.unwrap();
    assert_eq!(autoscaler.scale_down().unneeded_nodes().len(), 2);
    assert_eq!(cluster.target("ng1"), 3);

    autoscaler.run_once(now + Duration::minutes(11)).await.unwrap();
    assert_eq!(cluster.target("ng1"), 1);
    assert_eq!(cluster.node_count(), 1);
    assert!(cluster.seeded.cluster.node("ng1-0").is_some());
    assert_eq!(cluster.metrics.snapshot().scaled_down_empty_nodes, 2);
}

#[tokio::test]
async fn test_underutilized_node_drained() {
    let cluster = TestCluster::new(UNDERUTILIZED);
    cluster
        .seeded
        .cluster
        .add_controller(Controller::new("ReplicaSet", "default", "web", 2));
    let mut autoscaler = cluster.autoscaler(fast_drain_options());
    let now = Utc::now();

    autoscaler.run_once(now).await.unwrap();
    autoscaler.run_once(now + Duration::minutes(11)).await.unwrap();

    let status = autoscaler.scale_down().node_delete_status();
    for _ in 0..500 {
        if !status.is_delete_in_progress() {
            break;
        }
        sleep(StdDuration::from_millis(10)).await;
    }
    assert!(!status.is_delete_in_progress());
    assert_eq!(cluster.seeded.cluster.eviction_count(), 1);
    assert!(cluster.seeded.cluster.node("ng1-1").is_none());
    assert_eq!(cluster.target("ng1"), 1);
    assert_eq!(cluster.metrics.snapshot().scaled_down_nodes, 1);
}

#[tokio::test]
async fn test_long_unregistered_instance_removed() {
    let cluster = TestCluster::new(
        "groups:\n  - {id: ng1, min: 0, max: 5, nodes: 1, shape: {cpu: 1000, memory: 1000000000}}\n",
    );
    let group = cluster.seeded.cloud_provider.group("ng1").unwrap();
    group.add_instance(group.instance_id(1));
    group.set_target(2);

    let mut autoscaler = cluster.autoscaler(AutoscalingOptions::default());
    let now = Utc::now();
    autoscaler.run_once(now).await.unwrap();
    assert_eq!(autoscaler.cluster_state().get_unregistered_nodes().len(), 1);
    assert_eq!(cluster.target("ng1"), 2);

    autoscaler.run_once(now + Duration::minutes(16)).await.unwrap();
    assert_eq!(cluster.target("ng1"), 1);
    assert!(!group.has_instance(&group.instance_id(1)));
    assert!(cluster.recorder.has_reason("DeleteUnregistered"));
}

#[tokio::test]
async fn test_loop_runs_requested_iterations() {
    let cluster = TestCluster::new(FULL_NODE);
    let autoscaler = cluster.autoscaler(AutoscalingOptions::default());

    let (_shutdown, handle) = spawn_autoscaler(autoscaler, StdDuration::from_millis(5), Some(2));
    let autoscaler = handle.await.unwrap();

    assert_eq!(cluster.target("ng1"), 3);
    assert_eq!(cluster.seeded.cloud_provider.refresh_count(), 2);
    assert!(autoscaler.last_status().is_some());
}
