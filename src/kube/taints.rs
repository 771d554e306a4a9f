//! The to-be-deleted taint
//!
//! Applied to a node before it is drained so that no new pods land on it.
//! The value holds the unix time at which the taint was added.

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info};

use super::{ApiError, KubeClient};
use crate::api::{Node, Taint, TaintEffect};

/// Taint key marking nodes being removed by the autoscaler
pub const TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";

/// Whether the node carries the to-be-deleted taint
pub fn has_to_be_deleted_taint(node: &Node) -> bool {
    node.taint(TO_BE_DELETED_TAINT).is_some()
}

/// When the to-be-deleted taint was added, if present and well-formed
pub fn get_to_be_deleted_time(node: &Node) -> Option<DateTime<Utc>> {
    let taint = node.taint(TO_BE_DELETED_TAINT)?;
    let secs: i64 = taint.value.parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Add the taint to a copy of the node
pub fn with_to_be_deleted_taint(mut node: Node, now: DateTime<Utc>) -> Node {
    if !has_to_be_deleted_taint(&node) {
        node.spec.taints.push(Taint {
            key: TO_BE_DELETED_TAINT.to_string(),
            value: now.timestamp().to_string(),
            effect: TaintEffect::NoSchedule,
        });
    }
    node
}

/// Taint the live version of the node
pub async fn mark_to_be_deleted(
    node: &Node,
    client: &dyn KubeClient,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let fresh = client.get_node(node.name()).await?;
    if has_to_be_deleted_taint(&fresh) {
        debug!("Node {} already marked for deletion", node.name());
        return Ok(());
    }
    client
        .update_node(&with_to_be_deleted_taint(fresh, now))
        .await?;
    info!("Marked node {} for deletion", node.name());
    Ok(())
}

/// Remove the taint from the live version of the node.
///
/// Returns whether a taint was removed.
pub async fn clean_to_be_deleted(node: &Node, client: &dyn KubeClient) -> Result<bool, ApiError> {
    let mut fresh = client.get_node(node.name()).await?;
    let before = fresh.spec.taints.len();
    fresh.spec.taints.retain(|t| t.key != TO_BE_DELETED_TAINT);
    if fresh.spec.taints.len() == before {
        return Ok(false);
    }
    client.update_node(&fresh).await?;
    info!("Removed deletion taint from node {}", node.name());
    Ok(true)
}
