use thiserror::Error;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for retry/escalation decisions.
///
/// - `Transient`    — store or database RPC failed this tick; the loop logs
///   and retries next tick. Nothing in-process is corrupted.
/// - `Precondition` — the local node is in a state the cluster status does
///   not sanction (e.g. "not in cluster"); reported through the node's own
///   status, never fatal.
/// - `Corrupt`      — structurally broken store data (incomplete lease
///   record); treated as absence, logged at warn.
/// - `Fatal`        — forward progress impossible (listener won't bind,
///   client won't construct); propagated to the daemon's task group.
///
/// CAS conflicts are deliberately *not* errors anywhere in this taxonomy:
/// a lost CAS race is an `Ok(false)` outcome retried next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Precondition,
    Corrupt,
    Fatal,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Election error: {0}")]
    Election(#[from] ElectionError),

    #[error("Postgres error: {0}")]
    Postgres(#[from] PostgresError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node {node} is not a primary or replica in the cluster status")]
    NotInCluster { node: String },

    #[error("no suitable replica found for promotion")]
    NoSuitableReplica,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coordination-store errors. Transport-level only: a failed compare-and-swap
/// is reported through the operation's return value, not through this enum.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cluster state not found")]
    NotFound,

    #[error("incomplete lease data: {0}")]
    IncompleteLease(String),

    #[error("store request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Lease / election errors.
#[derive(Error, Debug)]
pub enum ElectionError {
    #[error("lease duration must be greater than zero")]
    ZeroDuration,

    #[error("failed to fetch lease: {0}")]
    FetchLease(#[source] StoreError),

    #[error("failed to compare-and-swap lease: {0}")]
    CasLease(#[source] StoreError),
}

/// Local database adapter errors.
#[derive(Error, Debug)]
pub enum PostgresError {
    #[error("connect to Postgres at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("query failed: {context}: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("node is not in recovery mode - cannot promote")]
    NotInRecovery,

    #[error("{command} exited with {status}")]
    CommandFailed {
        command: &'static str,
        status: std::process::ExitStatus,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cluster name must not be empty")]
    MissingClusterName,

    #[error("unknown store backend {0:?} (expected \"etcd\" or \"memory\")")]
    UnknownBackend(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Store(StoreError::IncompleteLease(_)) => ErrorKind::Corrupt,
            KestrelError::Store(_) => ErrorKind::Transient,
            KestrelError::Election(ElectionError::ZeroDuration) => ErrorKind::Fatal,
            KestrelError::Election(_) => ErrorKind::Transient,
            KestrelError::Postgres(PostgresError::NotInRecovery) => ErrorKind::Precondition,
            KestrelError::Postgres(_) => ErrorKind::Transient,
            KestrelError::Config(_) => ErrorKind::Fatal,
            KestrelError::NotInCluster { .. } => ErrorKind::Precondition,
            KestrelError::NoSuitableReplica => ErrorKind::Precondition,
            KestrelError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// True when the surrounding loop should swallow this error, log it, and
    /// try again next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// True when this error must end the daemon with a non-zero exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }
}
