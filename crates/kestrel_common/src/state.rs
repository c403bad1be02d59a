//! The shared cluster data model.
//!
//! Field names here are the wire format: every record is stored as JSON in
//! the coordination store and read back by every node and by the CLI, so
//! renames are compatibility breaks. Semantics:
//!
//! - `ClusterStatus` is the cluster's *intent* (who should be primary) plus
//!   a health assessment. It is shared and mutated under CAS on
//!   `status_uuid`.
//! - `NodeStatus` is one node's *observation* of its local database. It is
//!   written only by the node it describes, last-writer-wins.
//! - `ClusterState` is the derived read-everything view.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operator-provided desired configuration. Currently an empty placeholder;
/// kept as its own record so adding fields later is not a format change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    Healthy,
    Unhealthy,
}

/// The authoritative intended role assignment and health of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Unique identifier for this write, used as the compare-and-swap
    /// witness so concurrent writers cannot clobber each other.
    pub status_uuid: Uuid,

    /// Name of the node that last wrote this status. Informational only.
    #[serde(default)]
    pub source_node: String,

    /// Wall-clock time reported by the source node. Informational only;
    /// never an input to any decision.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_node_time: String,

    pub health: ClusterHealth,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_reasons: Vec<String>,

    /// The node the cluster has decided should be primary. May differ from
    /// the actual topology briefly during failovers. Empty only before
    /// bootstrap.
    pub intended_primary: String,

    pub intended_replicas: Vec<String>,
}

impl Default for ClusterStatus {
    fn default() -> Self {
        Self {
            status_uuid: Uuid::nil(),
            source_node: String::new(),
            source_node_time: String::new(),
            health: ClusterHealth::Healthy,
            health_reasons: Vec::new(),
            intended_primary: String::new(),
            intended_replicas: Vec::new(),
        }
    }
}

/// True iff a meaningful field of the cluster status changed. The status
/// UUID, source node, and source time are bookkeeping and are ignored;
/// sequences compare element-wise, and an empty sequence equals an absent
/// one (the model always materializes sequences, so this holds by
/// construction).
pub fn cluster_status_changed(old: &ClusterStatus, new: &ClusterStatus) -> bool {
    old.health != new.health
        || old.health_reasons != new.health_reasons
        || old.intended_primary != new.intended_primary
        || old.intended_replicas != new.intended_replicas
}

/// One row of `pg_stat_replication`, as observed on a primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStat {
    pub hostname: String,
    pub state: String,
    pub write_lsn: Option<String>,
    pub write_lag: Option<String>,
    pub sync_state: Option<String>,
    pub reply_time: Option<String>,
}

/// The `pg_stat_wal_receiver` row, as observed on a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub primary_host: String,
    pub status: String,
    pub written_lsn: Option<String>,
}

/// What one node observed about its local database this cycle.
///
/// Internally the primary / replica / failed alternatives are a sum type so
/// impossible combinations (an errored node with replica rows, a primary
/// with a wal-receiver entry) cannot be represented. On the wire this
/// flattens to the original optional-field record; see [`NodeStatusWire`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NodeStatusWire", into = "NodeStatusWire")]
pub struct NodeStatus {
    pub name: String,
    pub status_uuid: Uuid,
    /// Wall clock reported by the node. Informational only.
    pub node_time: Option<String>,
    pub role: NodeRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRole {
    /// The database accepted `NOT pg_is_in_recovery()` and reported its
    /// downstream producers.
    Primary { replicas: Vec<ReplicaStat> },
    /// The database is in recovery. `replication` is absent when the
    /// wal-receiver row could not be read.
    Replica { replication: Option<ReplicationStatus> },
    /// The node could not introspect its local database this cycle.
    Failed { error: String },
}

impl NodeStatus {
    /// The introspection error, if this node failed its cycle.
    pub fn error(&self) -> Option<&str> {
        match &self.role {
            NodeRole::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.role, NodeRole::Primary { .. })
    }

    pub fn replicas(&self) -> Option<&[ReplicaStat]> {
        match &self.role {
            NodeRole::Primary { replicas } => Some(replicas),
            _ => None,
        }
    }

    pub fn replication(&self) -> Option<&ReplicationStatus> {
        match &self.role {
            NodeRole::Replica { replication } => replication.as_ref(),
            _ => None,
        }
    }
}

/// Flat wire form of [`NodeStatus`]: the original record with optional
/// fields. `error` wins over everything else; `is_primary` selects between
/// the replica-producer list and the wal-receiver entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusWire {
    #[serde(default)]
    pub name: String,
    pub status_uuid: Uuid,
    /// Always on the wire, unlike the truly-optional fields below: readers
    /// expect the key even when no reading was taken.
    #[serde(default)]
    pub node_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<ReplicaStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_status: Option<ReplicationStatus>,
}

impl From<NodeStatusWire> for NodeStatus {
    fn from(w: NodeStatusWire) -> Self {
        let role = if let Some(error) = w.error {
            NodeRole::Failed { error }
        } else if w.is_primary {
            NodeRole::Primary {
                replicas: w.replicas,
            }
        } else {
            NodeRole::Replica {
                replication: w.replication_status,
            }
        };
        NodeStatus {
            name: w.name,
            status_uuid: w.status_uuid,
            node_time: w.node_time,
            role,
        }
    }
}

impl From<NodeStatus> for NodeStatusWire {
    fn from(s: NodeStatus) -> Self {
        let mut w = NodeStatusWire {
            name: s.name,
            status_uuid: s.status_uuid,
            node_time: s.node_time,
            error: None,
            is_primary: false,
            replicas: Vec::new(),
            replication_status: None,
        };
        match s.role {
            NodeRole::Primary { replicas } => {
                w.is_primary = true;
                w.replicas = replicas;
            }
            NodeRole::Replica { replication } => {
                w.replication_status = replication;
            }
            NodeRole::Failed { error } => {
                w.error = Some(error);
            }
        }
        w
    }
}

/// The entire state of the cluster, read under one logical snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
    /// Keyed by node name; a `BTreeMap` so every iteration is name-sorted,
    /// which the state machine relies on for determinism.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeStatus>,
}

impl ClusterState {
    /// Names of every known node except `me`, for wakeup broadcasts.
    pub fn peer_names(&self, me: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|name| name.as_str() != me && !name.is_empty())
            .cloned()
            .collect()
    }
}
