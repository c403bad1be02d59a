//! Daemon configuration: TOML file sections with defaults, overridden by
//! CLI flags in the binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub pooler: PoolerConfig,
    #[serde(default)]
    pub wakeup: WakeupConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Name of the Postgres cluster. Namespaces every store key; required.
    pub name: String,
    /// Name of this node. Defaults to the hostname when empty.
    #[serde(default)]
    pub node_name: String,
    /// Leader lease duration in milliseconds.
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            node_name: String::new(),
            lease_duration_ms: default_lease_duration_ms(),
        }
    }
}

/// Which coordination store backend to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// etcd, via value-compare transactions.
    #[default]
    Etcd,
    /// Process-local store for tests and single-node development runs.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Backend endpoint, `host:port` for etcd.
    pub endpoint: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Etcd,
            endpoint: "127.0.0.1:2379".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// PGDATA. The adapter initializes it when absent.
    pub data_dir: String,
    /// systemd unit the adapter starts/stops.
    pub service_unit: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            data_dir: "/var/lib/postgres/data".into(),
            service_unit: "postgresql.service".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolerConfig {
    pub host: String,
    pub port: u16,
    pub service_unit: String,
}

impl Default for PoolerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6432,
            service_unit: "pgbouncer.service".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeupConfig {
    /// UDP port peers send wakeup packets to. 0 disables the channel.
    pub port: u16,
}

impl Default for WakeupConfig {
    fn default() -> Self {
        Self { port: 8381 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Health HTTP listen address.
    pub listen_addr: String,
    /// Prometheus exporter listen address. Empty disables metrics.
    #[serde(default)]
    pub metrics_addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            metrics_addr: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// How long the leader waits for the remaining replicas to catch up to
    /// the chosen promotion candidate. Soft: expiry logs and continues.
    #[serde(default = "default_catchup_timeout_ms")]
    pub catchup_timeout_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            catchup_timeout_ms: default_catchup_timeout_ms(),
        }
    }
}

fn default_lease_duration_ms() -> u64 {
    5_000
}

fn default_catchup_timeout_ms() -> u64 {
    30_000
}

impl KestrelConfig {
    /// Load from a TOML file. A missing file yields defaults; a present but
    /// malformed file is an error (silently ignoring a typo'd config is
    /// worse than failing to start).
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            tracing::info!("Config file {} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.into(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.into(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path);
        Ok(config)
    }

    /// Validate required fields and fill the node name from the hostname.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        if self.cluster.name.is_empty() {
            return Err(ConfigError::MissingClusterName);
        }
        if self.cluster.node_name.is_empty() {
            self.cluster.node_name = hostname();
        }
        Ok(self)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.cluster.lease_duration_ms)
    }

    pub fn catchup_timeout(&self) -> Duration {
        Duration::from_millis(self.failover.catchup_timeout_ms)
    }
}

fn hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".into())
}
