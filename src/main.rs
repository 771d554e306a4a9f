use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use node_autoscaler::cli::Args;
use node_autoscaler::config::{load_options_file, AutoscalingOptions};
use node_autoscaler::core::{spawn_autoscaler, AutoscalingContext, StaticAutoscaler};
use node_autoscaler::kube::LogEventRecorder;
use node_autoscaler::manifest::load_manifest_file;
use node_autoscaler::metrics::AutoscalerMetrics;
use node_autoscaler::simulator::BasicPredicateChecker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter())),
        )
        .init();

    let mut options = match &args.config {
        Some(path) => load_options_file(path)
            .with_context(|| format!("failed to load options file {}", path.display()))?,
        None => AutoscalingOptions::default(),
    };
    if let Some(secs) = args.scan_interval {
        options.scan_interval = chrono::Duration::seconds(secs as i64);
    }
    let scan_interval = options
        .scan_interval
        .to_std()
        .context("scan interval must not be negative")?;

    let manifest = load_manifest_file(&args.manifest)
        .with_context(|| format!("failed to load manifest {}", args.manifest.display()))?;
    let seeded = manifest.seed();
    info!(
        "Loaded {} node groups and {} pods",
        manifest.groups.len(),
        manifest.pods.len()
    );

    let metrics = AutoscalerMetrics::shared();
    let context = AutoscalingContext::new(
        options,
        seeded.cloud_provider.clone(),
        seeded.cluster.clone(),
        seeded.cluster.clone(),
        Arc::new(BasicPredicateChecker::new()),
        Arc::new(LogEventRecorder),
        metrics.clone(),
    );

    let (shutdown, mut handle) = spawn_autoscaler(StaticAutoscaler::new(context), scan_interval, args.iterations);
    let autoscaler = tokio::select! {
        finished = &mut handle => finished.context("autoscaler task failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping autoscaler");
            let _ = shutdown.send(());
            handle.await.context("autoscaler task failed")?
        }
    };

    if let Some(status) = autoscaler.last_status() {
        println!("{}", serde_yaml::to_string(status)?);
    }
    println!("{}", serde_yaml::to_string(&metrics.snapshot())?);
    Ok(())
}
