//! Scheduling predicates used by the placement simulation

use thiserror::Error;

use crate::api::resources::RESOURCE_PODS;
use crate::api::{Pod, ResourceList, TaintEffect};

use super::node_info::NodeInfo;

/// Why a pod does not fit on a node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredicateError {
    #[error("node info has no node")]
    NoNode,

    #[error("node {0} is unschedulable")]
    Unschedulable(String),

    #[error("pod {pod} does not tolerate taint {taint} on node {node}")]
    UntoleratedTaint {
        pod: String,
        node: String,
        taint: String,
    },

    #[error("node {node} does not match the node selector of pod {pod}")]
    NodeSelectorMismatch { pod: String, node: String },

    #[error("insufficient {resource} on node {node}: requested {requested}, free {free}")]
    InsufficientResource {
        node: String,
        resource: String,
        requested: i64,
        free: i64,
    },
}

/// Per-pod data computed once and reused across nodes
#[derive(Debug, Clone, Default)]
pub struct PredicateMetadata {
    requests: ResourceList,
}

/// Decides whether a pod may be placed on a node
pub trait PredicateChecker: Send + Sync {
    fn predicate_metadata(&self, pod: &Pod) -> PredicateMetadata {
        PredicateMetadata {
            requests: pod.requests(),
        }
    }

    fn check_predicates(
        &self,
        pod: &Pod,
        metadata: Option<&PredicateMetadata>,
        node_info: &NodeInfo,
    ) -> Result<(), PredicateError>;
}

/// Checks schedulability, taints, node selectors and resource fit
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicPredicateChecker;

impl BasicPredicateChecker {
    pub fn new() -> Self {
        Self
    }
}

impl PredicateChecker for BasicPredicateChecker {
    fn check_predicates(
        &self,
        pod: &Pod,
        metadata: Option<&PredicateMetadata>,
        node_info: &NodeInfo,
    ) -> Result<(), PredicateError> {
        let node = node_info.node().ok_or(PredicateError::NoNode)?;

        if node.spec.unschedulable {
            return Err(PredicateError::Unschedulable(node.name().to_string()));
        }

        for taint in &node.spec.taints {
            if taint.effect == TaintEffect::PreferNoSchedule {
                continue;
            }
            if !pod.tolerates(taint) {
                return Err(PredicateError::UntoleratedTaint {
                    pod: pod.key(),
                    node: node.name().to_string(),
                    taint: taint.key.clone(),
                });
            }
        }

        let selector_ok = pod
            .spec
            .node_selector
            .iter()
            .all(|(k, v)| node.metadata.labels.get(k) == Some(v));
        if !selector_ok {
            return Err(PredicateError::NodeSelectorMismatch {
                pod: pod.key(),
                node: node.name().to_string(),
            });
        }

        let computed;
        let requests = match metadata {
            Some(meta) => &meta.requests,
            None => {
                computed = pod.requests();
                &computed
            }
        };

        if node.status.allocatable.get(RESOURCE_PODS).is_some() && node_info.free(RESOURCE_PODS) < 1 {
            return Err(PredicateError::InsufficientResource {
                node: node.name().to_string(),
                resource: RESOURCE_PODS.to_string(),
                requested: 1,
                free: node_info.free(RESOURCE_PODS),
            });
        }

        for (resource, requested) in requests.iter() {
            if *requested <= 0 {
                continue;
            }
            let free = node_info.free(resource);
            if *requested > free {
                return Err(PredicateError::InsufficientResource {
                    node: node.name().to_string(),
                    resource: resource.clone(),
                    requested: *requested,
                    free,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Node, Taint, Toleration, TolerationOperator};

    fn node_info(pods: Vec<Pod>) -> NodeInfo {
        NodeInfo::with_pods(Node::new("n1").with_capacity(1000, 2048), pods)
    }

    #[test]
    fn test_resource_fit() {
        let checker = BasicPredicateChecker::new();
        let info = node_info(vec![Pod::new("default", "a").with_requests(600, 1024).on_node("n1")]);

        let small = Pod::new("default", "small").with_requests(400, 512);
        assert!(checker.check_predicates(&small, None, &info).is_ok());

        let big = Pod::new("default", "big").with_requests(500, 512);
        let meta = checker.predicate_metadata(&big);
        let err = checker.check_predicates(&big, Some(&meta), &info).unwrap_err();
        assert_eq!(
            err,
            PredicateError::InsufficientResource {
                node: "n1".to_string(),
                resource: "cpu".to_string(),
                requested: 500,
                free: 400,
            }
        );
    }

    #[test]
    fn test_taints_block_untolerating_pods() {
        let checker = BasicPredicateChecker::new();
        let node = Node::new("n1").with_capacity(1000, 1000).with_taint(Taint {
            key: "dedicated".to_string(),
            value: "batch".to_string(),
            effect: TaintEffect::NoSchedule,
        });
        let info = NodeInfo::new(node);

        let pod = Pod::new("default", "web").with_requests(100, 100);
        assert!(matches!(
            checker.check_predicates(&pod, None, &info),
            Err(PredicateError::UntoleratedTaint { .. })
        ));

        let mut tolerant = pod.clone();
        tolerant.spec.tolerations.push(Toleration {
            key: "dedicated".to_string(),
            operator: TolerationOperator::Exists,
            ..Default::default()
        });
        assert!(checker.check_predicates(&tolerant, None, &info).is_ok());
    }

    #[test]
    fn test_unschedulable_and_selector() {
        let checker = BasicPredicateChecker::new();
        let mut node = Node::new("n1").with_capacity(1000, 1000).with_label("zone", "a");
        let mut pod = Pod::new("default", "web");
        pod.spec.node_selector.insert("zone".to_string(), "b".to_string());

        assert!(matches!(
            checker.check_predicates(&pod, None, &NodeInfo::new(node.clone())),
            Err(PredicateError::NodeSelectorMismatch { .. })
        ));

        node.spec.unschedulable = true;
        assert_eq!(
            checker.check_predicates(&pod, None, &NodeInfo::new(node)),
            Err(PredicateError::Unschedulable("n1".to_string()))
        );
    }

    #[test]
    fn test_missing_node() {
        let checker = BasicPredicateChecker::new();
        let pod = Pod::new("default", "web");
        assert_eq!(
            checker.check_predicates(&pod, None, &NodeInfo::default()),
            Err(PredicateError::NoNode)
        );
    }
}
