//! Choosing which node group to grow
//!
//! Every viable node group yields one [`ExpansionOption`]; an [`Expander`]
//! picks the one to execute.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::debug;

use crate::api::resources::{RESOURCE_CPU, RESOURCE_MEMORY};
use crate::api::Pod;
use crate::cloudprovider::NodeGroup;
use crate::config::ExpanderStrategy;
use crate::simulator::NodeInfo;

/// Growing one node group by `node_count` nodes to place `pods`
#[derive(Debug, Clone)]
pub struct ExpansionOption {
    pub node_group: Arc<dyn NodeGroup>,
    pub node_count: usize,
    pub pods: Vec<Pod>,
    /// Human readable reason for logs
    pub debug: String,
}

/// Picks the best scale-up option
pub trait Expander: Send + Sync {
    fn best_option(
        &self,
        options: &[ExpansionOption],
        node_infos: &HashMap<String, NodeInfo>,
    ) -> Option<ExpansionOption>;
}

/// Build the expander for a strategy
pub fn new_expander(strategy: ExpanderStrategy) -> Box<dyn Expander> {
    match strategy {
        ExpanderStrategy::Random => Box::new(RandomExpander),
        ExpanderStrategy::MostPods => Box::new(MostPodsExpander),
        ExpanderStrategy::LeastWaste => Box::new(LeastWasteExpander),
    }
}

/// Any option
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomExpander;

impl Expander for RandomExpander {
    fn best_option(
        &self,
        options: &[ExpansionOption],
        _node_infos: &HashMap<String, NodeInfo>,
    ) -> Option<ExpansionOption> {
        options.choose(&mut rand::thread_rng()).cloned()
    }
}

/// The option placing the most pods; ties are broken randomly
#[derive(Debug, Default, Clone, Copy)]
pub struct MostPodsExpander;

impl Expander for MostPodsExpander {
    fn best_option(
        &self,
        options: &[ExpansionOption],
        node_infos: &HashMap<String, NodeInfo>,
    ) -> Option<ExpansionOption> {
        let most = options.iter().map(|o| o.pods.len()).max()?;
        let best: Vec<ExpansionOption> = options
            .iter()
            .filter(|o| o.pods.len() == most)
            .cloned()
            .collect();
        RandomExpander.best_option(&best, node_infos)
    }
}

/// The option leaving the smallest share of new CPU and memory idle
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastWasteExpander;

impl LeastWasteExpander {
    fn wasted_score(option: &ExpansionOption, node_info: &NodeInfo) -> Option<f64> {
        let node = node_info.node()?;
        let mut requested_cpu = 0;
        let mut requested_memory = 0;
        for pod in &option.pods {
            let requests = pod.requests();
            requested_cpu += requests.get_or_zero(RESOURCE_CPU);
            requested_memory += requests.get_or_zero(RESOURCE_MEMORY);
        }

        let count = option.node_count as i64;
        let available_cpu = node.status.capacity.get_or_zero(RESOURCE_CPU) * count;
        let available_memory = node.status.capacity.get_or_zero(RESOURCE_MEMORY) * count;
        if available_cpu <= 0 || available_memory <= 0 {
            return None;
        }

        let wasted_cpu = (available_cpu - requested_cpu) as f64 / available_cpu as f64;
        let wasted_memory = (available_memory - requested_memory) as f64 / available_memory as f64;
        Some(wasted_cpu + wasted_memory)
    }
}

impl Expander for LeastWasteExpander {
    fn best_option(
        &self,
        options: &[ExpansionOption],
        node_infos: &HashMap<String, NodeInfo>,
    ) -> Option<ExpansionOption> {
        let mut least_wasted_score = f64::MAX;
        let mut least_wasted: Vec<ExpansionOption> = Vec::new();

        for option in options {
            let Some(node_info) = node_infos.get(option.node_group.id()) else {
                continue;
            };
            let Some(score) = Self::wasted_score(option, node_info) else {
                continue;
            };
            debug!("Expanding node group {} would waste {}", option.node_group.id(), score);

            if score < least_wasted_score {
                least_wasted_score = score;
                least_wasted.clear();
            }
            if score == least_wasted_score {
                least_wasted.push(option.clone());
            }
        }

        RandomExpander.best_option(&least_wasted, node_infos)
    }
}
