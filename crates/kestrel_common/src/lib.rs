//! Shared foundation for the kestrel supervisor: error taxonomy,
//! configuration, the lease / cluster-state data model, and the LSN type.
//!
//! Apart from config-file loading this crate is pure data: no sockets, no
//! clocks read behind the caller's back. The store, database adapter, and
//! reconciler crates all build on these types.

pub mod config;
pub mod error;
pub mod lease;
pub mod lsn;
pub mod state;

pub use error::{ConfigError, ElectionError, ErrorKind, KestrelError, KestrelResult, PostgresError, StoreError};
pub use lease::{Lease, ObservedLease};
pub use lsn::Lsn;
pub use state::{
    cluster_status_changed, ClusterHealth, ClusterSpec, ClusterState, ClusterStatus, NodeRole,
    NodeStatus, ReplicaStat, ReplicationStatus,
};
