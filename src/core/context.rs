//! Shared collaborators of one autoscaler instance

use std::sync::Arc;

use crate::cloudprovider::CloudProvider;
use crate::config::AutoscalingOptions;
use crate::kube::{EventRecorder, KubeClient, ListerRegistry};
use crate::metrics::MetricsSink;
use crate::simulator::PredicateChecker;

/// Everything the scale-up and scale-down logic needs to reach the outside
#[derive(Clone)]
pub struct AutoscalingContext {
    pub options: AutoscalingOptions,
    pub cloud_provider: Arc<dyn CloudProvider>,
    /// Live API calls used while tainting and draining
    pub client: Arc<dyn KubeClient>,
    pub listers: Arc<dyn ListerRegistry>,
    pub predicate_checker: Arc<dyn PredicateChecker>,
    /// Events on nodes and pods
    pub recorder: Arc<dyn EventRecorder>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl AutoscalingContext {
    pub fn new(
        options: AutoscalingOptions,
        cloud_provider: Arc<dyn CloudProvider>,
        client: Arc<dyn KubeClient>,
        listers: Arc<dyn ListerRegistry>,
        predicate_checker: Arc<dyn PredicateChecker>,
        recorder: Arc<dyn EventRecorder>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            options,
            cloud_provider,
            client,
            listers,
            predicate_checker,
            recorder,
            metrics,
        }
    }
}
