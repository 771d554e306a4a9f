//! Node autoscaler
//!
//! Keeps the node groups of a cluster sized to its pods: grows a group when
//! pods cannot be scheduled and removes nodes whose pods fit elsewhere.

pub mod api;
pub mod backoff;
pub mod cli;
pub mod cloudprovider;
pub mod clusterstate;
pub mod config;
pub mod core;
pub mod errors;
pub mod estimator;
pub mod kube;
pub mod manifest;
pub mod metrics;
pub mod simulator;
