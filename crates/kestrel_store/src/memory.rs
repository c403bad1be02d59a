//! Process-local store backend with linearizable CAS under one mutex.
//!
//! Used by the test suites as the reference backend and by
//! `--store-backend memory` single-node development runs. Not usable for a
//! real multi-node cluster (nothing is shared across processes).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use kestrel_common::error::StoreError;
use kestrel_common::lease::Lease;
use kestrel_common::state::{ClusterSpec, ClusterState, ClusterStatus, NodeStatus};

use crate::store::StateStore;

#[derive(Default)]
struct Inner {
    lease: Option<Lease>,
    spec: Option<ClusterSpec>,
    status: Option<ClusterStatus>,
    nodes: BTreeMap<String, NodeStatus>,
}

/// In-memory [`StateStore`]. Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn fetch_lease(&self) -> Result<Option<Lease>, StoreError> {
        Ok(self.inner.lock().lease.clone())
    }

    async fn cas_lease(
        &self,
        prev_rvn: Option<Uuid>,
        new_lease: Lease,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let matches = match (&inner.lease, prev_rvn) {
            (None, None) => true,
            (Some(current), Some(prev)) => current.revision_version_number == prev,
            _ => false,
        };
        if matches {
            inner.lease = Some(new_lease);
        }
        Ok(matches)
    }

    async fn fetch_cluster_state(&self) -> Result<ClusterState, StoreError> {
        let inner = self.inner.lock();
        if inner.lease.is_none()
            && inner.spec.is_none()
            && inner.status.is_none()
            && inner.nodes.is_empty()
        {
            return Err(StoreError::NotFound);
        }
        Ok(ClusterState {
            spec: inner.spec.clone().unwrap_or_default(),
            status: inner.status.clone().unwrap_or_default(),
            nodes: inner.nodes.clone(),
        })
    }

    async fn cas_cluster_status(
        &self,
        prev_status_uuid: Uuid,
        status: ClusterStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let matches = match &inner.status {
            None => prev_status_uuid.is_nil(),
            Some(current) => current.status_uuid == prev_status_uuid,
        };
        if matches {
            inner.status = Some(status);
        }
        Ok(matches)
    }

    async fn write_node_status(&self, status: &NodeStatus) -> Result<(), StoreError> {
        self.inner
            .lock()
            .nodes
            .insert(status.name.clone(), status.clone());
        Ok(())
    }

    async fn set_cluster_spec(&self, spec: &ClusterSpec) -> Result<(), StoreError> {
        self.inner.lock().spec = Some(spec.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::state::NodeRole;
    use std::time::Duration;

    fn lease(leader: &str) -> Lease {
        Lease {
            leader: leader.into(),
            revision_version_number: Uuid::new_v4(),
            duration: Duration::from_secs(5),
        }
    }

    fn node_status(name: &str) -> NodeStatus {
        NodeStatus {
            name: name.into(),
            status_uuid: Uuid::new_v4(),
            node_time: None,
            role: NodeRole::Replica { replication: None },
        }
    }

    #[tokio::test]
    async fn test_empty_store_has_no_lease_and_no_state() {
        let store = MemoryStore::new();
        assert!(store.fetch_lease().await.unwrap().is_none());
        assert!(matches!(
            store.fetch_cluster_state().await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_cas_lease_from_empty() {
        let store = MemoryStore::new();
        let l = lease("db-1");

        // Expecting an existing lease in an empty store must fail.
        assert!(!store
            .cas_lease(Some(Uuid::new_v4()), l.clone())
            .await
            .unwrap());

        assert!(store.cas_lease(None, l.clone()).await.unwrap());
        assert_eq!(store.fetch_lease().await.unwrap(), Some(l));
    }

    #[tokio::test]
    async fn test_cas_lease_requires_current_rvn() {
        let store = MemoryStore::new();
        let first = lease("db-1");
        assert!(store.cas_lease(None, first.clone()).await.unwrap());

        // Stale expectations lose.
        assert!(!store.cas_lease(None, lease("db-2")).await.unwrap());
        assert!(!store
            .cas_lease(Some(Uuid::new_v4()), lease("db-2"))
            .await
            .unwrap());

        // The current RVN wins, exactly once.
        let second = lease("db-2");
        assert!(store
            .cas_lease(Some(first.revision_version_number), second.clone())
            .await
            .unwrap());
        assert!(!store
            .cas_lease(Some(first.revision_version_number), lease("db-3"))
            .await
            .unwrap());
        assert_eq!(store.fetch_lease().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_lease_safety_over_contended_history() {
        // At most one CAS per observed RVN can succeed, no matter how the
        // attempts interleave.
        let store = MemoryStore::new();
        assert!(store.cas_lease(None, lease("seed")).await.unwrap());

        let mut successes = 0;
        for round in 0..20 {
            let observed = store.fetch_lease().await.unwrap().unwrap();
            let prev = observed.revision_version_number;
            // Two contenders race on the same observed RVN.
            let a = store.cas_lease(Some(prev), lease("a")).await.unwrap();
            let b = store.cas_lease(Some(prev), lease("b")).await.unwrap();
            assert!(
                !(a && b),
                "both contenders won on round {round}, rvn {prev}"
            );
            successes += u32::from(a) + u32::from(b);
        }
        assert_eq!(successes, 20, "exactly one winner per round");
    }

    #[tokio::test]
    async fn test_cas_cluster_status_nil_means_absent() {
        let store = MemoryStore::new();
        let mut status = ClusterStatus {
            status_uuid: Uuid::new_v4(),
            intended_primary: "db-1".into(),
            ..ClusterStatus::default()
        };

        // Wrong creation witness.
        assert!(!store
            .cas_cluster_status(Uuid::new_v4(), status.clone())
            .await
            .unwrap());
        // Nil = "must not exist" applies on the empty store.
        assert!(store
            .cas_cluster_status(Uuid::nil(), status.clone())
            .await
            .unwrap());
        // And no longer applies once a status exists.
        assert!(!store
            .cas_cluster_status(Uuid::nil(), status.clone())
            .await
            .unwrap());

        let prev = status.status_uuid;
        status.status_uuid = Uuid::new_v4();
        status.intended_primary = "db-2".into();
        assert!(store.cas_cluster_status(prev, status.clone()).await.unwrap());

        let state = store.fetch_cluster_state().await.unwrap();
        assert_eq!(state.status.intended_primary, "db-2");
    }

    #[tokio::test]
    async fn test_node_status_is_last_writer_wins() {
        let store = MemoryStore::new();
        store.write_node_status(&node_status("db-1")).await.unwrap();
        let newer = node_status("db-1");
        store.write_node_status(&newer).await.unwrap();
        store.write_node_status(&node_status("db-2")).await.unwrap();

        let state = store.fetch_cluster_state().await.unwrap();
        assert_eq!(state.nodes.len(), 2);
        assert_eq!(state.nodes["db-1"].status_uuid, newer.status_uuid);
    }
}
