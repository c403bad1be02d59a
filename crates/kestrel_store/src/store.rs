use async_trait::async_trait;
use uuid::Uuid;

use kestrel_common::error::StoreError;
use kestrel_common::lease::Lease;
use kestrel_common::state::{ClusterSpec, ClusterState, ClusterStatus, NodeStatus};

/// The coordination-store contract. One implementation per backend; every
/// backend must provide linearizable compare-and-swap on single records.
///
/// Error discipline: only transport-level failures are `Err`. Losing a CAS
/// race returns `Ok(false)` — callers log it and retry next tick.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The current lease, or `None` if no lease has ever been written.
    /// Structurally broken lease records surface as
    /// [`StoreError::IncompleteLease`]; the election layer downgrades that
    /// to "no lease" with a warning.
    async fn fetch_lease(&self) -> Result<Option<Lease>, StoreError>;

    /// Atomically install `new_lease` iff the stored lease's RVN equals
    /// `prev_rvn` (`None` meaning "no lease exists yet"). Returns whether
    /// the swap applied.
    async fn cas_lease(&self, prev_rvn: Option<Uuid>, new_lease: Lease)
        -> Result<bool, StoreError>;

    /// Spec, status, and every node's last-written status, read under one
    /// logical snapshot. [`StoreError::NotFound`] when no keys exist yet.
    async fn fetch_cluster_state(&self) -> Result<ClusterState, StoreError>;

    /// Atomically install `status` iff the stored status UUID equals
    /// `prev_status_uuid` (the nil UUID meaning "no status exists yet").
    /// Returns whether the swap applied.
    async fn cas_cluster_status(
        &self,
        prev_status_uuid: Uuid,
        status: ClusterStatus,
    ) -> Result<bool, StoreError>;

    /// Unconditional last-writer-wins put of this node's own status.
    async fn write_node_status(&self, status: &NodeStatus) -> Result<(), StoreError>;

    /// Unconditional put of the operator-owned spec.
    async fn set_cluster_spec(&self, spec: &ClusterSpec) -> Result<(), StoreError>;
}
