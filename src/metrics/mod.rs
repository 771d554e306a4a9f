//! Autoscaler metrics
//!
//! Metrics are emitted through an injected [`MetricsSink`] rather than process
//! globals. [`AutoscalerMetrics`] keeps everything in atomic counters and can
//! produce a serializable snapshot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::errors::AutoscalerError;

/// Why a scale-up failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedScaleUpReason {
    CloudProviderError,
    ApiError,
    Timeout,
}

impl FailedScaleUpReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CloudProviderError => "cloudProviderError",
            Self::ApiError => "apiCallError",
            Self::Timeout => "timeout",
        }
    }
}

/// Why a node was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeScaleDownReason {
    Underutilized,
    Empty,
    Unready,
}

/// Timed sections of an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionLabel {
    Main,
    UpdateState,
    ScaleUp,
    FindUnneeded,
    ScaleDown,
}

impl FunctionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::UpdateState => "updateClusterState",
            Self::ScaleUp => "scaleUp",
            Self::FindUnneeded => "findUnneeded",
            Self::ScaleDown => "scaleDown",
        }
    }
}

/// Destination for autoscaler metrics
pub trait MetricsSink: Send + Sync {
    fn update_node_groups_count(&self, autoscaled: usize, autoprovisioned: usize);

    fn register_failed_scale_up(&self, reason: FailedScaleUpReason);

    fn register_scale_up(&self, nodes: usize);

    fn register_scale_down(&self, nodes: usize, reason: NodeScaleDownReason);

    fn register_evictions(&self, count: usize);

    fn register_error(&self, err: &AutoscalerError);

    fn update_unneeded_nodes_count(&self, count: usize);

    fn update_cluster_safe_to_autoscale(&self, safe: bool);

    fn update_duration(&self, label: FunctionLabel, duration: Duration);
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    #[serde(rename = "autoscaledNodeGroups")]
    pub autoscaled_node_groups: u64,
    #[serde(rename = "autoprovisionedNodeGroups")]
    pub autoprovisioned_node_groups: u64,
    #[serde(rename = "failedScaleUps")]
    pub failed_scale_ups: u64,
    #[serde(rename = "failedScaleUpTimeouts")]
    pub failed_scale_up_timeouts: u64,
    #[serde(rename = "scaledUpNodes")]
    pub scaled_up_nodes: u64,
    #[serde(rename = "scaledDownNodes")]
    pub scaled_down_nodes: u64,
    #[serde(rename = "scaledDownEmptyNodes")]
    pub scaled_down_empty_nodes: u64,
    pub evictions: u64,
    pub errors: u64,
    #[serde(rename = "unneededNodes")]
    pub unneeded_nodes: u64,
    #[serde(rename = "clusterSafeToAutoscale")]
    pub cluster_safe_to_autoscale: bool,
}

/// Metrics kept in atomic counters
#[derive(Debug, Default)]
pub struct AutoscalerMetrics {
    autoscaled_node_groups: AtomicU64,
    autoprovisioned_node_groups: AtomicU64,
    failed_scale_ups: AtomicU64,
    failed_scale_up_timeouts: AtomicU64,
    scaled_up_nodes: AtomicU64,
    scaled_down_nodes: AtomicU64,
    scaled_down_empty_nodes: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
    unneeded_nodes: AtomicU64,
    cluster_safe_to_autoscale: AtomicBool,

    /// Last observed duration per function, in microseconds
    durations: DashMap<&'static str, u64>,
}

impl AutoscalerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared instance for injection
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            autoscaled_node_groups: self.autoscaled_node_groups.load(Ordering::SeqCst),
            autoprovisioned_node_groups: self.autoprovisioned_node_groups.load(Ordering::SeqCst),
            failed_scale_ups: self.failed_scale_ups.load(Ordering::SeqCst),
            failed_scale_up_timeouts: self.failed_scale_up_timeouts.load(Ordering::SeqCst),
            scaled_up_nodes: self.scaled_up_nodes.load(Ordering::SeqCst),
            scaled_down_nodes: self.scaled_down_nodes.load(Ordering::SeqCst),
            scaled_down_empty_nodes: self.scaled_down_empty_nodes.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            unneeded_nodes: self.unneeded_nodes.load(Ordering::SeqCst),
            cluster_safe_to_autoscale: self.cluster_safe_to_autoscale.load(Ordering::SeqCst),
        }
    }

    /// Last recorded duration of a function
    pub fn last_duration(&self, label: FunctionLabel) -> Option<Duration> {
        self.durations
            .get(label.as_str())
            .map(|d| Duration::from_micros(*d.value()))
    }
}

impl MetricsSink for AutoscalerMetrics {
    fn update_node_groups_count(&self, autoscaled: usize, autoprovisioned: usize) {
        self.autoscaled_node_groups
            .store(autoscaled as u64, Ordering::SeqCst);
        self.autoprovisioned_node_groups
            .store(autoprovisioned as u64, Ordering::SeqCst);
    }

    fn register_failed_scale_up(&self, reason: FailedScaleUpReason) {
        self.failed_scale_ups.fetch_add(1, Ordering::SeqCst);
        if reason == FailedScaleUpReason::Timeout {
            self.failed_scale_up_timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn register_scale_up(&self, nodes: usize) {
        self.scaled_up_nodes.fetch_add(nodes as u64, Ordering::SeqCst);
    }

    fn register_scale_down(&self, nodes: usize, reason: NodeScaleDownReason) {
        self.scaled_down_nodes
            .fetch_add(nodes as u64, Ordering::SeqCst);
        if reason == NodeScaleDownReason::Empty {
            self.scaled_down_empty_nodes
                .fetch_add(nodes as u64, Ordering::SeqCst);
        }
    }

    fn register_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::SeqCst);
    }

    fn register_error(&self, _err: &AutoscalerError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn update_unneeded_nodes_count(&self, count: usize) {
        self.unneeded_nodes.store(count as u64, Ordering::SeqCst);
    }

    fn update_cluster_safe_to_autoscale(&self, safe: bool) {
        self.cluster_safe_to_autoscale
            .store(safe, Ordering::SeqCst);
    }

    fn update_duration(&self, label: FunctionLabel, duration: Duration) {
        self.durations
            .insert(label.as_str(), duration.as_micros() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = AutoscalerMetrics::new();
        metrics.register_failed_scale_up(FailedScaleUpReason::Timeout);
        metrics.register_failed_scale_up(FailedScaleUpReason::ApiError);
        metrics.register_scale_down(2, NodeScaleDownReason::Empty);
        metrics.register_scale_down(1, NodeScaleDownReason::Underutilized);
        metrics.update_unneeded_nodes_count(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.failed_scale_ups, 2);
        assert_eq!(snapshot.failed_scale_up_timeouts, 1);
        assert_eq!(snapshot.scaled_down_nodes, 3);
        assert_eq!(snapshot.scaled_down_empty_nodes, 2);
        assert_eq!(snapshot.unneeded_nodes, 4);
    }

    #[test]
    fn test_durations() {
        let metrics = AutoscalerMetrics::new();
        assert!(metrics.last_duration(FunctionLabel::Main).is_none());
        metrics.update_duration(FunctionLabel::Main, Duration::from_millis(12));
        assert_eq!(
            metrics.last_duration(FunctionLabel::Main),
            Some(Duration::from_millis(12))
        );
    }
}
