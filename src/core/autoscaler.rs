//! The autoscaler iteration and the loop that drives it

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::clusterstate::{AutoscalerStatus, ClusterStateRegistry, ClusterStateRegistryConfig, STATUS_OBJECT};
use crate::errors::AutoscalerError;
use crate::kube::EventType;
use crate::metrics::FunctionLabel;

use super::context::AutoscalingContext;
use super::scale_down::{ScaleDown, ScaleDownResult};
use super::scale_up::{scale_up, ScaleUpResult};
use super::utils::{
    filter_out_schedulable, fix_node_group_size, get_node_infos_for_groups, get_potentially_unneeded_nodes,
    remove_old_unregistered_nodes,
};

/// Autoscaler over a fixed set of node groups
pub struct StaticAutoscaler {
    context: Arc<AutoscalingContext>,
    cluster_state: Arc<ClusterStateRegistry>,
    scale_down: ScaleDown,
    last_scale_up_time: DateTime<Utc>,
    last_scale_down_delete_time: DateTime<Utc>,
    last_scale_down_fail_time: DateTime<Utc>,
    last_status: Option<AutoscalerStatus>,
    state_updated: bool,
}

impl StaticAutoscaler {
    pub fn new(context: AutoscalingContext) -> Self {
        let options = &context.options;
        let backoff = ExponentialBackoff::new(
            options.initial_node_group_backoff_duration,
            options.max_node_group_backoff_duration,
            options.node_group_backoff_reset_timeout,
        );
        let cluster_state = Arc::new(ClusterStateRegistry::new(
            Arc::clone(&context.cloud_provider),
            ClusterStateRegistryConfig::from(options),
            Box::new(backoff),
            Arc::clone(&context.metrics),
            Arc::clone(&context.recorder),
        ));
        let context = Arc::new(context);
        let scale_down = ScaleDown::new(Arc::clone(&context), Arc::clone(&cluster_state));

        Self {
            context,
            cluster_state,
            scale_down,
            last_scale_up_time: DateTime::<Utc>::MIN_UTC,
            last_scale_down_delete_time: DateTime::<Utc>::MIN_UTC,
            last_scale_down_fail_time: DateTime::<Utc>::MIN_UTC,
            last_status: None,
            state_updated: false,
        }
    }

    pub fn context(&self) -> &AutoscalingContext {
        &self.context
    }

    pub fn cluster_state(&self) -> &ClusterStateRegistry {
        &self.cluster_state
    }

    pub fn scale_down(&self) -> &ScaleDown {
        &self.scale_down
    }

    /// Status taken at the end of the last iteration that updated the registry
    pub fn last_status(&self) -> Option<&AutoscalerStatus> {
        self.last_status.as_ref()
    }

    /// Run one autoscaling iteration at `now`
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<(), AutoscalerError> {
        let start = Instant::now();
        self.state_updated = false;

        let result = self.run_iteration(now).await;
        if let Err(err) = &result {
            error!("Failed to run autoscaler iteration: {}", err);
            self.context.metrics.register_error(err);
        }
        if self.state_updated {
            self.write_status(now);
        }

        self.context.metrics.update_duration(FunctionLabel::Main, start.elapsed());
        result
    }

    fn write_status(&mut self, now: DateTime<Utc>) {
        for (node, result) in self.scale_down.node_delete_status().drain_node_delete_results() {
            match result {
                Ok(()) => info!("Node {} deleted", node),
                Err(err) => warn!("Failed to delete node {}: {}", node, err),
            }
        }
        self.last_status = Some(self.cluster_state.get_status(now));
    }

    async fn run_iteration(&mut self, now: DateTime<Utc>) -> Result<(), AutoscalerError> {
        let context = Arc::clone(&self.context);
        let listers = &context.listers;

        let update_start = Instant::now();
        context.cloud_provider.refresh().await?;

        let all_nodes = listers.all_nodes()?;
        if all_nodes.is_empty() {
            warn!("No nodes in the cluster");
            return Ok(());
        }
        let ready_nodes = listers.ready_nodes()?;
        if ready_nodes.is_empty() {
            warn!("No ready nodes in the cluster");
            return Ok(());
        }

        let scheduled_pods = listers.scheduled_pods()?;
        let daemonsets = listers.daemonsets()?;
        let node_infos = get_node_infos_for_groups(
            &ready_nodes,
            context.cloud_provider.as_ref(),
            &scheduled_pods,
            &daemonsets,
            context.predicate_checker.as_ref(),
        )
        .map_err(|err| err.add_prefix("failed to build node infos for node groups: "))?;

        self.cluster_state
            .update_nodes(&all_nodes, node_infos.clone(), now)
            .await
            .map_err(|err| err.add_prefix("failed to update node registry: "))?;
        self.state_updated = true;
        context
            .metrics
            .update_duration(FunctionLabel::UpdateState, update_start.elapsed());

        let unregistered = self.cluster_state.get_unregistered_nodes();
        if !unregistered.is_empty() {
            debug!("{} unregistered nodes present", unregistered.len());
            if remove_old_unregistered_nodes(&unregistered, &context, now).await? {
                info!("Some unregistered nodes were removed");
                return Ok(());
            }
        }

        if !self.cluster_state.is_cluster_healthy() {
            warn!("Cluster is not ready for autoscaling");
            self.scale_down.clean_up_unneeded_nodes();
            context.metrics.update_cluster_safe_to_autoscale(false);
            context.recorder.record(
                "ConfigMap",
                STATUS_OBJECT,
                EventType::Warning,
                "ClusterUnhealthy",
                "Cluster is unhealthy",
            );
            return Ok(());
        }
        context.metrics.update_cluster_safe_to_autoscale(true);

        if fix_node_group_size(&context, &self.cluster_state, now).await? {
            info!("Some node group target size was fixed, skipping the iteration");
            return Ok(());
        }

        // Scale-up
        let unschedulable = listers.unschedulable_pods()?;
        let to_help = filter_out_schedulable(
            &unschedulable,
            &ready_nodes,
            &scheduled_pods,
            context.predicate_checker.as_ref(),
        );
        let schedulable_pods_present = to_help.len() < unschedulable.len();
        if to_help.is_empty() {
            debug!("No unschedulable pods");
        } else if context.options.max_nodes_total > 0 && ready_nodes.len() >= context.options.max_nodes_total {
            debug!("Max total nodes in cluster reached");
        } else {
            let scale_up_start = Instant::now();
            let result = scale_up(&context, &self.cluster_state, &to_help, &ready_nodes, &node_infos, now).await;
            context
                .metrics
                .update_duration(FunctionLabel::ScaleUp, scale_up_start.elapsed());
            if let ScaleUpResult::Successful { node_group, increase } = result? {
                info!("Scaled up {} by {}", node_group, increase);
                self.last_scale_up_time = now;
                // No scale-down in the same iteration
                return Ok(());
            }
        }

        if !context.options.scale_down_enabled {
            return Ok(());
        }

        // Scale-down
        let unneeded_start = Instant::now();
        let pdbs = listers.pod_disruption_budgets()?;
        self.scale_down.clean_up(now);
        let potentially_unneeded = get_potentially_unneeded_nodes(context.cloud_provider.as_ref(), &all_nodes).await;
        self.scale_down
            .update_unneeded_nodes(&all_nodes, &potentially_unneeded, &scheduled_pods, now, &pdbs)
            .await
            .map_err(|err| {
                error!("Failed to scale down: {}", err);
                err
            })?;
        context
            .metrics
            .update_duration(FunctionLabel::FindUnneeded, unneeded_start.elapsed());
        self.cluster_state
            .update_scale_down_candidates(self.scale_down.unneeded_nodes(), now);

        let options = &context.options;
        let calculate_unneeded_only = self.last_scale_up_time + options.scale_down_delay_after_add > now
            || self.last_scale_down_fail_time + options.scale_down_delay_after_failure > now
            || self.last_scale_down_delete_time + options.scale_down_delay_after_delete > now
            || schedulable_pods_present;
        debug!(
            "Scale down status: unneededOnly={} lastScaleUpTime={} lastScaleDownDeleteTime={} lastScaleDownFailTime={} schedulablePodsPresent={}",
            calculate_unneeded_only,
            self.last_scale_up_time,
            self.last_scale_down_delete_time,
            self.last_scale_down_fail_time,
            schedulable_pods_present
        );
        if calculate_unneeded_only {
            return Ok(());
        }

        info!("Starting scale down");
        let scale_down_start = Instant::now();
        let result = self
            .scale_down
            .try_to_scale_down(&all_nodes, &scheduled_pods, &pdbs, now)
            .await;
        context
            .metrics
            .update_duration(FunctionLabel::ScaleDown, scale_down_start.elapsed());

        match result {
            Ok(ScaleDownResult::NodeDeleted) => {
                self.last_scale_down_delete_time = now;
                self.cluster_state.recalculate().await;
                Ok(())
            }
            Ok(result) => {
                debug!("Scale down result: {:?}", result);
                Ok(())
            }
            Err(err) => {
                error!("Failed to scale down: {}", err);
                self.last_scale_down_fail_time = now;
                Err(err)
            }
        }
    }
}

/// Run `run_once` every `scan_interval` until the returned sender fires or
/// `iterations` have run. The task hands the autoscaler back when it stops.
pub fn spawn_autoscaler(
    mut autoscaler: StaticAutoscaler,
    scan_interval: Duration,
    iterations: Option<usize>,
) -> (watch::Sender<()>, JoinHandle<StaticAutoscaler>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());

    let handle = tokio::spawn(async move {
        let mut ticker = interval(scan_interval);
        let mut completed = 0usize;

        info!("Autoscaler started, scanning every {:?}", scan_interval);

        loop {
            if iterations.is_some_and(|limit| completed >= limit) {
                info!("Autoscaler finished {} iterations", completed);
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    // Errors are logged and counted inside the iteration
                    let _ = autoscaler.run_once(Utc::now()).await;
                    completed += 1;
                }
                _ = shutdown_rx.changed() => {
                    info!("Autoscaler shutting down");
                    break;
                }
            }
        }
        autoscaler
    });

    (shutdown_tx, handle)
}
