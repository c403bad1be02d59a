//! The coordination store: the one contract the rest of the daemon uses to
//! share state between nodes, plus its backends.
//!
//! Upper layers never see backend keys or wire encodings; they see leases,
//! cluster status, and node statuses, with linearizable compare-and-swap
//! on the two shared records. A failed CAS is a normal outcome (`Ok(false)`),
//! never an error.

mod etcd;
mod memory;
mod store;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use store::StateStore;
