//! Node count estimation for scale-up
//!
//! First-fit bin packing of pending pods onto copies of a node group's
//! template, largest pods first.

use std::sync::Arc;

use crate::api::resources::{RESOURCE_CPU, RESOURCE_MEMORY};
use crate::api::Pod;
use crate::simulator::{NodeInfo, PredicateChecker};

/// Estimates how many template nodes a set of pods needs
pub struct BinpackingNodeEstimator {
    predicate_checker: Arc<dyn PredicateChecker>,
}

impl BinpackingNodeEstimator {
    pub fn new(predicate_checker: Arc<dyn PredicateChecker>) -> Self {
        Self { predicate_checker }
    }

    /// Number of new nodes needed for `pods`, counting `upcoming` nodes as
    /// capacity that is already on its way.
    ///
    /// Pods that do not fit an empty template still get a node of their own;
    /// callers filter those out first.
    pub fn estimate(&self, pods: &[Pod], template: &NodeInfo, upcoming: &[NodeInfo]) -> usize {
        let mut scored: Vec<(f64, &Pod)> = pods.iter().map(|p| (pod_score(p, template), p)).collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut nodes: Vec<NodeInfo> = upcoming.to_vec();
        for (_, pod) in scored {
            let slot = nodes.iter().position(|info| {
                self.predicate_checker
                    .check_predicates(pod, None, info)
                    .is_ok()
            });
            match slot {
                Some(index) => nodes[index].add_pod(pod.clone()),
                None => {
                    let mut fresh = template.clone();
                    fresh.add_pod(pod.clone());
                    nodes.push(fresh);
                }
            }
        }

        nodes.len() - upcoming.len()
    }
}

/// Share of the template's CPU plus share of its memory
fn pod_score(pod: &Pod, template: &NodeInfo) -> f64 {
    let Some(node) = template.node() else {
        return 0.0;
    };
    let requests = pod.requests();
    let share = |resource: &str| {
        let allocatable = node.status.allocatable.get_or_zero(resource);
        if allocatable > 0 {
            requests.get_or_zero(resource) as f64 / allocatable as f64
        } else {
            0.0
        }
    };
    share(RESOURCE_CPU) + share(RESOURCE_MEMORY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Node;
    use crate::simulator::BasicPredicateChecker;

    fn estimator() -> BinpackingNodeEstimator {
        BinpackingNodeEstimator::new(Arc::new(BasicPredicateChecker::new()))
    }

    fn template() -> NodeInfo {
        NodeInfo::new(Node::new("template").with_capacity(1000, 1000))
    }

    fn pods(count: usize, cpu: i64) -> Vec<Pod> {
        (0..count)
            .map(|i| Pod::new("default", format!("p{}", i)).with_requests(cpu, 100))
            .collect()
    }

    #[test]
    fn test_estimate_packs_pods() {
        assert_eq!(estimator().estimate(&pods(5, 400), &template(), &[]), 3);
        assert_eq!(estimator().estimate(&pods(4, 250), &template(), &[]), 1);
        assert_eq!(estimator().estimate(&[], &template(), &[]), 0);
    }

    #[test]
    fn test_upcoming_nodes_absorb_pods() {
        let upcoming = vec![template(), template()];
        assert_eq!(estimator().estimate(&pods(5, 400), &template(), &upcoming), 1);
    }

    #[test]
    fn test_large_pods_placed_first() {
        let mut mixed = pods(2, 300);
        mixed.push(Pod::new("default", "large").with_requests(700, 100));
        assert_eq!(estimator().estimate(&mixed, &template(), &[]), 2);
    }
}
