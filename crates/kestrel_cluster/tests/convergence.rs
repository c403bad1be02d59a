//! End-to-end reconciliation scenarios against the in-memory store and a
//! scripted local database: bootstrap, CAS races, failover, and the wakeup
//! fast path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use kestrel_cluster::database::{DbNodeState, LocalDatabase};
use kestrel_cluster::failover::FailoverSettings;
use kestrel_cluster::leader::perform_leader_tasks;
use kestrel_cluster::node::reconcile_cycle;
use kestrel_cluster::status::{compute_new_cluster_status, write_cluster_status_if_changed};
use kestrel_cluster::wakeup::WakeupManager;
use kestrel_common::error::PostgresError;
use kestrel_common::state::{
    ClusterHealth, ClusterStatus, NodeRole, NodeStatus, ReplicaStat, ReplicationStatus,
};
use kestrel_store::{MemoryStore, StateStore};

/// A scripted database that records which convergence calls it receives.
struct FakeDb {
    observed: Mutex<Option<DbNodeState>>,
    calls: Mutex<Vec<String>>,
}

impl FakeDb {
    fn new(observed: Option<DbNodeState>) -> Arc<Self> {
        Arc::new(Self {
            observed: Mutex::new(observed),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn primary(replica_hosts: &[&str]) -> Arc<Self> {
        let replicas = replica_hosts
            .iter()
            .map(|host| ReplicaStat {
                hostname: host.to_string(),
                state: "streaming".into(),
                write_lsn: Some("0/3000000".into()),
                write_lag: None,
                sync_state: Some("async".into()),
                reply_time: None,
            })
            .collect();
        Self::new(Some(DbNodeState {
            node_time: "2024-04-02T10:00:00Z".into(),
            is_primary: true,
            replicas,
            wal_receiver: None,
        }))
    }

    fn replica(primary_host: &str, written_lsn: &str) -> Arc<Self> {
        Self::new(Some(DbNodeState {
            node_time: "2024-04-02T10:00:00Z".into(),
            is_primary: false,
            replicas: Vec::new(),
            wal_receiver: Some(ReplicationStatus {
                primary_host: primary_host.into(),
                status: "streaming".into(),
                written_lsn: Some(written_lsn.into()),
            }),
        }))
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl LocalDatabase for FakeDb {
    async fn fetch_state(&self) -> Result<DbNodeState, PostgresError> {
        self.record("fetch_state".into());
        match self.observed.lock().clone() {
            Some(state) => Ok(state),
            None => Err(PostgresError::Io {
                path: "127.0.0.1:5432".into(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ),
            }),
        }
    }

    async fn configure_as_primary(&self) -> Result<(), PostgresError> {
        self.record("configure_as_primary".into());
        Ok(())
    }

    async fn configure_as_replica(&self, primary_host: &str) -> Result<(), PostgresError> {
        self.record(format!("configure_as_replica({primary_host})"));
        Ok(())
    }

    async fn ensure_pooler_running(&self) -> Result<(), PostgresError> {
        self.record("ensure_pooler_running".into());
        Ok(())
    }
}

fn fast_settings() -> FailoverSettings {
    FailoverSettings {
        catchup_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
    }
}

fn stored_node(name: &str, role: NodeRole) -> NodeStatus {
    NodeStatus {
        name: name.into(),
        status_uuid: Uuid::new_v4(),
        node_time: None,
        role,
    }
}

#[tokio::test]
async fn test_bootstrap_converges_to_first_node_as_primary() {
    let store = MemoryStore::new();
    let db_a = FakeDb::primary(&["db-b"]);
    let db_b = FakeDb::replica("db-a", "0/3000000");

    // First cycle on a: publishes itself, writes the first status from an
    // empty store, and configures itself as primary.
    reconcile_cycle(&store, db_a.as_ref(), "db-a", None)
        .await
        .unwrap();
    let state = store.fetch_cluster_state().await.unwrap();
    assert_eq!(state.status.intended_primary, "db-a");
    assert!(db_a.calls().contains(&"configure_as_primary".to_string()));

    // b joins: replica list fills in and the cluster goes healthy.
    reconcile_cycle(&store, db_b.as_ref(), "db-b", None)
        .await
        .unwrap();
    let state = store.fetch_cluster_state().await.unwrap();
    assert_eq!(state.status.intended_primary, "db-a");
    assert_eq!(state.status.intended_replicas, vec!["db-b"]);
    assert_eq!(state.status.health, ClusterHealth::Healthy);
    assert!(state.status.health_reasons.is_empty());
    assert!(db_b
        .calls()
        .contains(&"configure_as_replica(db-a)".to_string()));

    // Idempotent reconvergence: another pass changes nothing, and the
    // status UUID proves no write happened.
    let settled_uuid = state.status.status_uuid;
    reconcile_cycle(&store, db_a.as_ref(), "db-a", None)
        .await
        .unwrap();
    reconcile_cycle(&store, db_b.as_ref(), "db-b", None)
        .await
        .unwrap();
    let state = store.fetch_cluster_state().await.unwrap();
    assert_eq!(state.status.status_uuid, settled_uuid);

    // Pooler supervision runs every cycle.
    assert!(db_a
        .calls()
        .iter()
        .filter(|c| *c == "ensure_pooler_running")
        .count() >= 2);
}

#[tokio::test]
async fn test_concurrent_bootstrap_writers_one_wins() {
    let store = MemoryStore::new();
    for node in [
        stored_node("db-a", NodeRole::Primary { replicas: vec![] }),
        stored_node("db-b", NodeRole::Replica { replication: None }),
    ] {
        store.write_node_status(&node).await.unwrap();
    }

    // Both nodes read the same snapshot and race their first status write.
    let state = store.fetch_cluster_state().await.unwrap();
    let computed_a = compute_new_cluster_status(&state);
    let computed_b = compute_new_cluster_status(&state);
    assert_eq!(computed_a.intended_primary, computed_b.intended_primary);

    let (_, a_applied) =
        write_cluster_status_if_changed(&store, &state.status, computed_a, "db-a")
            .await
            .unwrap();
    let (_, b_applied) =
        write_cluster_status_if_changed(&store, &state.status, computed_b, "db-b")
            .await
            .unwrap();
    assert!(a_applied);
    assert!(!b_applied, "second writer must lose the CAS race");

    // The loser re-fetches and finds nothing left to write.
    let state = store.fetch_cluster_state().await.unwrap();
    let recomputed = compute_new_cluster_status(&state);
    let (_, applied) =
        write_cluster_status_if_changed(&store, &state.status, recomputed, "db-b")
            .await
            .unwrap();
    assert!(!applied);
    assert_eq!(state.status.intended_primary, "db-a");
}

#[tokio::test]
async fn test_leader_fails_over_to_most_caught_up_replica() {
    let store = MemoryStore::new();

    // Establish the pre-failure status {primary: a, replicas: [b, c]}.
    let status = ClusterStatus {
        status_uuid: Uuid::new_v4(),
        intended_primary: "db-a".into(),
        intended_replicas: vec!["db-b".into(), "db-c".into()],
        ..ClusterStatus::default()
    };
    assert!(store
        .cas_cluster_status(Uuid::nil(), status.clone())
        .await
        .unwrap());

    // a dies; b is ahead of c in WAL position.
    for node in [
        stored_node(
            "db-a",
            NodeRole::Failed {
                error: "connection refused".into(),
            },
        ),
        stored_node(
            "db-b",
            NodeRole::Replica {
                replication: Some(ReplicationStatus {
                    primary_host: "db-a".into(),
                    status: "streaming".into(),
                    written_lsn: Some("0/10000000".into()),
                }),
            },
        ),
        stored_node(
            "db-c",
            NodeRole::Replica {
                replication: Some(ReplicationStatus {
                    primary_host: "db-a".into(),
                    status: "streaming".into(),
                    written_lsn: Some("0/0FFF0000".into()),
                }),
            },
        ),
    ] {
        store.write_node_status(&node).await.unwrap();
    }

    // The leader (b, say) runs its pass: failover fires, b is chosen.
    perform_leader_tasks(&store, "db-b", &fast_settings(), None)
        .await
        .unwrap();

    let state = store.fetch_cluster_state().await.unwrap();
    assert_eq!(state.status.intended_primary, "db-b");
    assert_eq!(state.status.intended_replicas, vec!["db-a", "db-c"]);
    assert_eq!(state.status.health, ClusterHealth::Unhealthy);

    // b's next node cycle acts on the new assignment and promotes itself.
    let db_b = FakeDb::replica("db-a", "0/10000000");
    reconcile_cycle(&store, db_b.as_ref(), "db-b", None)
        .await
        .unwrap();
    assert!(db_b.calls().contains(&"configure_as_primary".to_string()));

    // c keeps replicating, now from b.
    let db_c = FakeDb::replica("db-a", "0/0FFF0000");
    reconcile_cycle(&store, db_c.as_ref(), "db-c", None)
        .await
        .unwrap();
    assert!(db_c
        .calls()
        .contains(&"configure_as_replica(db-b)".to_string()));
}

#[tokio::test]
async fn test_leader_pass_is_quiet_when_cluster_is_settled() {
    let store = MemoryStore::new();
    let db_a = FakeDb::primary(&["db-b"]);
    let db_b = FakeDb::replica("db-a", "0/3000000");
    reconcile_cycle(&store, db_a.as_ref(), "db-a", None)
        .await
        .unwrap();
    reconcile_cycle(&store, db_b.as_ref(), "db-b", None)
        .await
        .unwrap();

    let before = store.fetch_cluster_state().await.unwrap().status;
    perform_leader_tasks(&store, "db-a", &fast_settings(), None)
        .await
        .unwrap();
    let after = store.fetch_cluster_state().await.unwrap().status;
    assert_eq!(before.status_uuid, after.status_uuid, "no write on a settled cluster");
}

#[tokio::test]
async fn test_errored_node_is_published_and_flagged() {
    let store = MemoryStore::new();
    let db_a = FakeDb::primary(&[]);
    let db_down = FakeDb::new(None); // introspection fails

    reconcile_cycle(&store, db_a.as_ref(), "db-a", None)
        .await
        .unwrap();
    // The down node still publishes an errored status; its own convergence
    // proceeds from the shared state (it is an intended replica).
    reconcile_cycle(&store, db_down.as_ref(), "db-b", None)
        .await
        .unwrap();

    let state = store.fetch_cluster_state().await.unwrap();
    let b = &state.nodes["db-b"];
    assert!(b.error().unwrap().contains("connection refused"));

    let status = compute_new_cluster_status(&state);
    assert_eq!(status.health, ClusterHealth::Unhealthy);
    assert!(status
        .health_reasons
        .contains(&"Node db-b has an error".to_string()));
}

#[tokio::test]
async fn test_stale_primary_is_reconfigured_as_replica() {
    // The cluster moved on to b while a was partitioned; a heals and still
    // reports as primary. Its node loop must demote it toward b.
    let store = MemoryStore::new();
    let status = ClusterStatus {
        status_uuid: Uuid::new_v4(),
        intended_primary: "db-b".into(),
        intended_replicas: vec!["db-a".into()],
        ..ClusterStatus::default()
    };
    assert!(store.cas_cluster_status(Uuid::nil(), status).await.unwrap());
    store
        .write_node_status(&stored_node(
            "db-b",
            NodeRole::Primary { replicas: vec![] },
        ))
        .await
        .unwrap();

    let db_a = FakeDb::primary(&[]); // still believes it is primary
    reconcile_cycle(&store, db_a.as_ref(), "db-a", None)
        .await
        .unwrap();

    assert!(db_a
        .calls()
        .contains(&"configure_as_replica(db-b)".to_string()));
    let state = store.fetch_cluster_state().await.unwrap();
    assert!(state
        .status
        .health_reasons
        .contains(&"Node db-a is marked as primary but not intended primary".to_string()));
}

#[tokio::test]
async fn test_status_change_broadcasts_wakeup_to_peers() {
    let store = MemoryStore::new();

    // A peer listener bound to an ephemeral port; the "peer node" is named
    // by an address so the broadcast can actually reach it.
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (peer_manager, mut peer_rx) = WakeupManager::new(0, "pg-main", "127.0.0.1");
    let listener = peer_manager.start_listener(shutdown_rx).await.unwrap();

    store
        .write_node_status(&stored_node(
            "127.0.0.1",
            NodeRole::Replica { replication: None },
        ))
        .await
        .unwrap();

    let (manager, _rx) = WakeupManager::new(listener.local_addr.port(), "pg-main", "db-a");
    let db_a = FakeDb::primary(&[]);
    reconcile_cycle(&store, db_a.as_ref(), "db-a", Some(&manager))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), peer_rx.recv())
        .await
        .expect("peer should receive a wakeup after a status change")
        .expect("channel open");
    listener.handle.abort();
}
