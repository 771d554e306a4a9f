//! Placement simulation
//!
//! Answers "could this node go away?" without touching the cluster:
//! - [`drain`]: which pods have to move and which block removal
//! - [`predicates`]: whether a pod fits on a node
//! - [`cluster`]: removal search across candidates and utilization math
//! - [`tracker`]: which nodes' results depend on which other nodes

pub mod cluster;
pub mod drain;
pub mod node_info;
pub mod predicates;
pub mod tracker;

pub use cluster::{
    calculate_utilization, find_nodes_to_remove, CheckMode, NodeToBeRemoved, RemovalSimulation,
    UtilizationError, UtilizationInfo,
};
pub use drain::{
    detailed_get_pods_for_move, fast_get_pods_to_move, find_empty_nodes_to_remove, ControllerCache,
    DrainError, DrainOptions,
};
pub use node_info::{create_node_name_to_info_map, NodeInfo};
pub use predicates::{BasicPredicateChecker, PredicateChecker, PredicateError, PredicateMetadata};
pub use tracker::{remove_node_from_tracker, UsageRecord, UsageTracker};
