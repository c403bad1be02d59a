//! The pure cluster state machine and the guarded status writer.
//!
//! [`compute_new_cluster_status`] is deterministic and idempotent: every
//! node runs the same computation over the same snapshot and arrives at the
//! same answer, and feeding a computed status back through the function is
//! a fixed point. CAS on the status UUID arbitrates which node's write
//! lands; everyone else just retries next tick.

use kestrel_common::error::StoreError;
use kestrel_common::state::{
    cluster_status_changed, ClusterHealth, ClusterState, ClusterStatus, NodeRole,
};
use kestrel_store::StateStore;
use uuid::Uuid;

/// Compute the intended roles and health for the cluster as observed in
/// `state`.
///
/// Rules, in order:
/// 1. Keep the current intended primary only while it is still a known
///    node. Otherwise pick the first node (name order) without an error,
///    falling back to the first node outright. No nodes ⇒ no primary.
/// 2. Every other known node is an intended replica, in name order.
/// 3. Health is the conjunction of per-node checks; each failing node
///    contributes one reason, in name order.
pub fn compute_new_cluster_status(state: &ClusterState) -> ClusterStatus {
    let mut status = state.status.clone();

    let primary_still_known = !status.intended_primary.is_empty()
        && state.nodes.contains_key(&status.intended_primary);
    if !primary_still_known {
        status.intended_primary = state
            .nodes
            .iter()
            .find(|(_, node)| node.error().is_none())
            .map(|(name, _)| name.clone())
            .or_else(|| state.nodes.keys().next().cloned())
            .unwrap_or_default();
    }

    status.intended_replicas = state
        .nodes
        .keys()
        .filter(|name| **name != status.intended_primary)
        .cloned()
        .collect();

    let mut reasons = Vec::new();
    if state.nodes.is_empty() {
        reasons.push("No nodes in the cluster".to_string());
    }
    for (name, node) in &state.nodes {
        match &node.role {
            NodeRole::Failed { .. } => {
                reasons.push(format!("Node {name} has an error"));
            }
            NodeRole::Primary { replicas } => {
                if *name != status.intended_primary {
                    reasons.push(format!(
                        "Node {name} is marked as primary but not intended primary"
                    ));
                } else if replicas.len() != status.intended_replicas.len() {
                    reasons.push(format!(
                        "Node {name} has {} replica statuses but there are {} intended replicas",
                        replicas.len(),
                        status.intended_replicas.len()
                    ));
                }
            }
            NodeRole::Replica { replication } => {
                if !status.intended_replicas.iter().any(|r| r == name) {
                    reasons.push(format!("Node {name} is not in the intended replicas list"));
                } else if replication.is_none() {
                    reasons.push(format!("Node {name} has no replication status"));
                }
            }
        }
    }

    if reasons.is_empty() {
        status.health = ClusterHealth::Healthy;
        status.health_reasons = Vec::new();
    } else {
        status.health = ClusterHealth::Unhealthy;
        status.health_reasons = reasons;
    }

    status
}

/// Write `computed` iff it differs semantically from `old`.
///
/// On a semantic change the status is stamped with a fresh UUID, this
/// node's name, and its wall-clock time, then CASed against `old`'s UUID.
/// Returns the effective status and whether a write actually landed; a
/// lost CAS race reports `false` and the caller simply retries next tick.
pub async fn write_cluster_status_if_changed(
    store: &dyn StateStore,
    old: &ClusterStatus,
    computed: ClusterStatus,
    source_node: &str,
) -> Result<(ClusterStatus, bool), StoreError> {
    if !cluster_status_changed(old, &computed) {
        return Ok((computed, false));
    }

    let mut stamped = computed;
    stamped.status_uuid = Uuid::new_v4();
    stamped.source_node = source_node.to_string();
    stamped.source_node_time = chrono::Utc::now().to_rfc3339();

    let applied = store
        .cas_cluster_status(old.status_uuid, stamped.clone())
        .await?;
    kestrel_observability::record_status_write(applied);
    if applied {
        tracing::info!(
            primary = %stamped.intended_primary,
            health = ?stamped.health,
            "Cluster status updated"
        );
    } else {
        tracing::info!("Lost cluster status CAS race, will re-evaluate next cycle");
    }
    Ok((stamped, applied))
}
