//! etcd backend.
//!
//! Layout, per cluster `C` (values are JSON):
//!
//! ```text
//! /C/lease          the current lease record
//! /C/lease-rvn      CAS witness: the lease's RVN as a string
//! /C/status         the cluster status record
//! /C/status-uuid    CAS witness: the status UUID as a string
//! /C/spec           the operator-owned cluster spec
//! /C/nodes/<name>   each node's self-reported status
//! ```
//!
//! Both CAS operations are etcd transactions that compare the witness key's
//! value against the caller's expectation (or its `create_revision` against
//! zero for "must not exist") and put the witness and the record together.
//! `fetch_cluster_state` is a single prefix range read, which etcd serves
//! at one revision, giving the consistent snapshot the contract requires.

use std::time::Duration;

use etcd_client::{Client, Compare, CompareOp, ConnectOptions, GetOptions, Txn, TxnOp};
use uuid::Uuid;

use async_trait::async_trait;
use kestrel_common::error::StoreError;
use kestrel_common::lease::Lease;
use kestrel_common::state::{ClusterSpec, ClusterState, ClusterStatus, NodeStatus};

use crate::store::StateStore;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Key builder for one cluster's namespace.
struct Keyspace {
    prefix: String,
}

impl Keyspace {
    fn new(cluster_name: &str) -> Self {
        Self {
            prefix: format!("/{cluster_name}"),
        }
    }

    fn cluster(&self) -> String {
        self.prefix.clone()
    }

    fn lease(&self) -> String {
        format!("{}/lease", self.prefix)
    }

    fn lease_rvn(&self) -> String {
        format!("{}/lease-rvn", self.prefix)
    }

    fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }

    fn status_uuid(&self) -> String {
        format!("{}/status-uuid", self.prefix)
    }

    fn spec(&self) -> String {
        format!("{}/spec", self.prefix)
    }

    fn nodes_prefix(&self) -> String {
        format!("{}/nodes/", self.prefix)
    }

    fn node(&self, node_name: &str) -> String {
        self.nodes_prefix() + node_name
    }
}

pub struct EtcdStore {
    client: Client,
    keys: Keyspace,
}

impl EtcdStore {
    /// Connect to etcd at `endpoint` (`host:port`).
    pub async fn connect(endpoint: &str, cluster_name: &str) -> Result<Self, StoreError> {
        let options = ConnectOptions::new().with_connect_timeout(DIAL_TIMEOUT);
        let client = Client::connect([endpoint], Some(options))
            .await
            .map_err(transport)?;
        Ok(Self {
            client,
            keys: Keyspace::new(cluster_name),
        })
    }
}

fn transport(err: etcd_client::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

/// A lease record must name a leader, carry a non-nil RVN, and have a
/// positive duration; anything else is corrupt data, not a lease.
fn validate_lease(lease: &Lease) -> Result<(), StoreError> {
    if lease.leader.is_empty()
        || lease.revision_version_number.is_nil()
        || lease.duration.is_zero()
    {
        return Err(StoreError::IncompleteLease(format!("{lease:?}")));
    }
    Ok(())
}

#[async_trait]
impl StateStore for EtcdStore {
    async fn fetch_lease(&self) -> Result<Option<Lease>, StoreError> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(self.keys.lease(), None).await.map_err(transport)?;
        let Some(entry) = resp.kvs().first() else {
            return Ok(None);
        };
        let lease: Lease = serde_json::from_slice(entry.value())
            .map_err(|e| StoreError::IncompleteLease(e.to_string()))?;
        validate_lease(&lease)?;
        Ok(Some(lease))
    }

    async fn cas_lease(
        &self,
        prev_rvn: Option<Uuid>,
        new_lease: Lease,
    ) -> Result<bool, StoreError> {
        let compare = match prev_rvn {
            Some(prev) => {
                Compare::value(self.keys.lease_rvn(), CompareOp::Equal, prev.to_string())
            }
            None => Compare::create_revision(self.keys.lease_rvn(), CompareOp::Equal, 0),
        };

        let lease_bytes = serde_json::to_vec(&new_lease)?;
        let txn = Txn::new().when([compare]).and_then([
            TxnOp::put(
                self.keys.lease_rvn(),
                new_lease.revision_version_number.to_string(),
                None,
            ),
            TxnOp::put(self.keys.lease(), lease_bytes, None),
        ]);

        let mut kv = self.client.kv_client();
        let resp = kv.txn(txn).await.map_err(transport)?;
        Ok(resp.succeeded())
    }

    async fn fetch_cluster_state(&self) -> Result<ClusterState, StoreError> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(self.keys.cluster(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(transport)?;

        if resp.kvs().is_empty() {
            return Err(StoreError::NotFound);
        }

        let nodes_prefix = self.keys.nodes_prefix();
        let mut state = ClusterState::default();
        for entry in resp.kvs() {
            let key = entry.key_str().map_err(transport)?;
            if key == self.keys.spec() {
                state.spec = serde_json::from_slice(entry.value())?;
            } else if key == self.keys.status() {
                state.status = serde_json::from_slice(entry.value())?;
            } else if key == self.keys.status_uuid()
                || key == self.keys.lease()
                || key == self.keys.lease_rvn()
            {
                // Witness and lease keys are not part of the state view.
            } else if let Some(node_name) = key.strip_prefix(nodes_prefix.as_str()) {
                let status: NodeStatus = serde_json::from_slice(entry.value())?;
                if status.name != node_name {
                    tracing::warn!(
                        key = node_name,
                        reported = %status.name,
                        "Node status name does not match its key, using the key"
                    );
                }
                state.nodes.insert(node_name.to_string(), status);
            } else {
                tracing::warn!(key, "Ignoring unexpected key under cluster prefix");
            }
        }

        Ok(state)
    }

    async fn cas_cluster_status(
        &self,
        prev_status_uuid: Uuid,
        status: ClusterStatus,
    ) -> Result<bool, StoreError> {
        let compare = if prev_status_uuid.is_nil() {
            Compare::create_revision(self.keys.status_uuid(), CompareOp::Equal, 0)
        } else {
            Compare::value(
                self.keys.status_uuid(),
                CompareOp::Equal,
                prev_status_uuid.to_string(),
            )
        };

        let status_bytes = serde_json::to_vec(&status)?;
        let txn = Txn::new().when([compare]).and_then([
            TxnOp::put(
                self.keys.status_uuid(),
                status.status_uuid.to_string(),
                None,
            ),
            TxnOp::put(self.keys.status(), status_bytes, None),
        ]);

        let mut kv = self.client.kv_client();
        let resp = kv.txn(txn).await.map_err(transport)?;
        Ok(resp.succeeded())
    }

    async fn write_node_status(&self, status: &NodeStatus) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(status)?;
        let mut kv = self.client.kv_client();
        kv.put(self.keys.node(&status.name), bytes, None)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn set_cluster_spec(&self, spec: &ClusterSpec) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(spec)?;
        let mut kv = self.client.kv_client();
        kv.put(self.keys.spec(), bytes, None)
            .await
            .map_err(transport)?;
        tracing::info!("Cluster spec set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_layout() {
        let keys = Keyspace::new("pg-main");
        assert_eq!(keys.lease(), "/pg-main/lease");
        assert_eq!(keys.lease_rvn(), "/pg-main/lease-rvn");
        assert_eq!(keys.status(), "/pg-main/status");
        assert_eq!(keys.status_uuid(), "/pg-main/status-uuid");
        assert_eq!(keys.spec(), "/pg-main/spec");
        assert_eq!(keys.node("db-1"), "/pg-main/nodes/db-1");
        assert!(keys.node("db-1").starts_with(&keys.nodes_prefix()));
    }

    #[test]
    fn test_validate_lease_rejects_incomplete() {
        let good = Lease {
            leader: "db-1".into(),
            revision_version_number: Uuid::new_v4(),
            duration: Duration::from_secs(5),
        };
        assert!(validate_lease(&good).is_ok());

        let mut no_leader = good.clone();
        no_leader.leader.clear();
        assert!(matches!(
            validate_lease(&no_leader),
            Err(StoreError::IncompleteLease(_))
        ));

        let mut nil_rvn = good.clone();
        nil_rvn.revision_version_number = Uuid::nil();
        assert!(validate_lease(&nil_rvn).is_err());

        let mut zero_duration = good;
        zero_duration.duration = Duration::ZERO;
        assert!(validate_lease(&zero_duration).is_err());
    }
}
