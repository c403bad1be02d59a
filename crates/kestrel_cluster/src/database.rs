//! The seam between the reconciler loops and the local database.
//!
//! A capability set, not a process model: every operation is idempotent,
//! and the loops call them every tick without tracking what they did last
//! time. The production implementation lives in `kestrel_postgres`; tests
//! script a fake.

use async_trait::async_trait;

use kestrel_common::error::PostgresError;
use kestrel_common::state::{ReplicaStat, ReplicationStatus};

/// What one introspection pass observed about the local database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbNodeState {
    /// The database's `now()`, as text. Informational only.
    pub node_time: String,
    /// `NOT pg_is_in_recovery()`.
    pub is_primary: bool,
    /// Downstream producers (`pg_stat_replication`), when primary.
    pub replicas: Vec<ReplicaStat>,
    /// The wal-receiver row, when a replica and currently streaming.
    pub wal_receiver: Option<ReplicationStatus>,
}

/// Operations the reconciler needs from the node's database and its
/// connection pooler.
#[async_trait]
pub trait LocalDatabase: Send + Sync {
    /// One short-lived introspection session. Failure means the node
    /// publishes an errored status this cycle.
    async fn fetch_state(&self) -> Result<DbNodeState, PostgresError>;

    /// Drive the local database toward the primary role: initialize the
    /// data directory if needed, ensure the process runs, promote if it is
    /// still in recovery.
    async fn configure_as_primary(&self) -> Result<(), PostgresError>;

    /// Drive the local database toward replicating from `primary_host`:
    /// base-backup if empty, repoint `primary_conninfo` when it differs,
    /// rewind and restart a stale primary.
    async fn configure_as_replica(&self, primary_host: &str) -> Result<(), PostgresError>;

    /// Make sure the connection pooler's supervised service is up.
    async fn ensure_pooler_running(&self) -> Result<(), PostgresError>;
}
