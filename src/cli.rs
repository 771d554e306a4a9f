use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "node-autoscaler")]
#[command(about = "Resize node groups of a cluster described by a manifest")]
#[command(version)]
pub struct Args {
    /// Path to the cluster manifest (YAML)
    #[arg(required = true)]
    pub manifest: PathBuf,

    /// Path to an options file (YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Stop after this many iterations; runs until interrupted when absent
    #[arg(short = 'n', long, value_name = "N")]
    pub iterations: Option<usize>,

    /// Override the scan interval in seconds
    #[arg(long, value_name = "SECS")]
    pub scan_interval: Option<u64>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Default log filter for the verbosity count
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
