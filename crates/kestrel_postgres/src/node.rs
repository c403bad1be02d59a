//! [`PostgresNode`]: converge the supervised PostgreSQL instance (and its
//! pooler) to the role the cluster status assigns this node.
//!
//! Every operation is idempotent and ordered the same way: make sure the
//! data directory exists, fix configuration (only when it differs), make
//! sure the process runs, then correct the runtime role (promote or
//! stop/rewind/start). The reconciler calls these every tick; a tick that
//! finds nothing to do must do nothing.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use kestrel_cluster::database::{DbNodeState, LocalDatabase};
use kestrel_common::config::{PoolerConfig, PostgresConfig};
use kestrel_common::error::PostgresError;

use crate::client;
use crate::conninfo;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra server configuration appended once, right after the data
/// directory is initialized.
const BASE_POSTGRESQL_CONF: &str = "\
# Appended by kestrel at initialization time.
listen_addresses = '*'
log_connections = on
log_hostname = on
synchronous_commit = off
wal_level = logical
";

/// HBA rules appended once at initialization: the cluster nodes must be
/// able to connect for introspection and replication.
const BASE_PG_HBA_CONF: &str = "\
# Appended by kestrel at initialization time.
host    all             all             0.0.0.0/0            trust
host    replication     all             0.0.0.0/0            trust
";

pub struct PostgresNode {
    postgres: PostgresConfig,
    pooler: PoolerConfig,
}

impl PostgresNode {
    pub fn new(postgres: PostgresConfig, pooler: PoolerConfig) -> Self {
        Self { postgres, pooler }
    }

    fn data_dir(&self) -> &Path {
        Path::new(&self.postgres.data_dir)
    }

    /// `PG_VERSION` is written by initdb and base backups alike; its
    /// absence means there is no database here yet.
    fn data_dir_initialized(&self) -> bool {
        self.data_dir().join("PG_VERSION").exists()
    }

    async fn init_primary_data_dir(&self) -> Result<(), PostgresError> {
        tracing::info!(data_dir = %self.postgres.data_dir, "Initializing primary data directory");
        run_command("initdb", &["--pgdata", &self.postgres.data_dir]).await?;
        self.append_base_config()
    }

    async fn init_replica_data_dir(&self, primary_host: &str) -> Result<(), PostgresError> {
        tracing::info!(
            data_dir = %self.postgres.data_dir,
            primary = primary_host,
            "Taking base backup from primary"
        );
        let port = self.postgres.port.to_string();
        run_command(
            "pg_basebackup",
            &[
                "-h",
                primary_host,
                "-p",
                &port,
                "-U",
                &self.postgres.user,
                "-D",
                &self.postgres.data_dir,
                "-R",
                "-P",
            ],
        )
        .await?;
        self.append_base_config()
    }

    fn append_base_config(&self) -> Result<(), PostgresError> {
        append_to_file(&self.data_dir().join("postgresql.conf"), BASE_POSTGRESQL_CONF)?;
        append_to_file(&self.data_dir().join("pg_hba.conf"), BASE_PG_HBA_CONF)?;
        Ok(())
    }

    /// The standby marker tells Postgres to start in recovery. Touching an
    /// existing file is a no-op.
    fn ensure_standby_signal(&self) -> Result<(), PostgresError> {
        let path = self.data_dir().join("standby.signal");
        if path.exists() {
            return Ok(());
        }
        std::fs::write(&path, "").map_err(|source| PostgresError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Rewind a stale primary's timeline against the new primary, then
    /// bring it back as a standby. The instance must be stopped first.
    async fn rewind_against(&self, primary_host: &str) -> Result<(), PostgresError> {
        tracing::info!(
            primary = primary_host,
            "Rewinding stale primary against new primary"
        );
        let source_server = conninfo::primary_conninfo(
            primary_host,
            self.postgres.port,
            &self.postgres.user,
        );
        run_command(
            "pg_rewind",
            &[
                "--target-pgdata",
                &self.postgres.data_dir,
                "--source-server",
                &source_server,
            ],
        )
        .await
    }

    async fn ensure_running(&self) -> Result<(), PostgresError> {
        ensure_unit_running(&self.postgres.service_unit).await
    }
}

#[async_trait]
impl LocalDatabase for PostgresNode {
    async fn fetch_state(&self) -> Result<DbNodeState, PostgresError> {
        client::fetch_node_state(
            &self.postgres.host,
            self.postgres.port,
            &self.postgres.user,
            CONNECT_TIMEOUT,
        )
        .await
    }

    async fn configure_as_primary(&self) -> Result<(), PostgresError> {
        if !self.data_dir_initialized() {
            self.init_primary_data_dir().await?;
        }

        self.ensure_running().await?;

        let in_recovery = client::is_in_recovery(
            &self.postgres.host,
            self.postgres.port,
            &self.postgres.user,
            CONNECT_TIMEOUT,
        )
        .await?;
        if in_recovery {
            client::promote_replica(
                &self.postgres.host,
                self.postgres.port,
                &self.postgres.user,
            )
            .await?;
        }
        Ok(())
    }

    async fn configure_as_replica(&self, primary_host: &str) -> Result<(), PostgresError> {
        if !self.data_dir_initialized() {
            // pg_basebackup -R already writes the standby marker and
            // conninfo, but the shared path below re-checks both anyway.
            self.init_replica_data_dir(primary_host).await?;
        }

        self.ensure_standby_signal()?;

        let conninfo = conninfo::primary_conninfo(
            primary_host,
            self.postgres.port,
            &self.postgres.user,
        );
        let rewritten = conninfo::update_primary_conninfo(self.data_dir(), &conninfo)
            .map_err(|source| PostgresError::Io {
                path: self.data_dir().join(conninfo::AUTO_CONF).display().to_string(),
                source,
            })?;

        self.ensure_running().await?;

        if rewritten {
            tracing::info!(primary = primary_host, "Repointed primary_conninfo");
            if let Err(err) = client::reload_config(
                &self.postgres.host,
                self.postgres.port,
                &self.postgres.user,
                CONNECT_TIMEOUT,
            )
            .await
            {
                // The instance may still be starting; it will pick the file
                // up at boot.
                tracing::warn!(%err, "Failed to reload configuration");
            }
        }

        let in_recovery = client::is_in_recovery(
            &self.postgres.host,
            self.postgres.port,
            &self.postgres.user,
            CONNECT_TIMEOUT,
        )
        .await?;
        if !in_recovery {
            // A stale primary: its timeline diverged when the cluster moved
            // on. Stop it, rewind against the new primary, start it back up
            // as the standby it is meant to be.
            tracing::warn!("Local database is a stale primary, rewinding");
            stop_unit(&self.postgres.service_unit).await?;
            self.rewind_against(primary_host).await?;
            self.ensure_standby_signal()?;
            ensure_unit_running(&self.postgres.service_unit).await?;
        }

        Ok(())
    }

    async fn ensure_pooler_running(&self) -> Result<(), PostgresError> {
        ensure_unit_running(&self.pooler.service_unit).await
    }
}

async fn run_command(program: &'static str, args: &[&str]) -> Result<(), PostgresError> {
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|source| PostgresError::Io {
            path: program.to_string(),
            source,
        })?;
    if !status.success() {
        return Err(PostgresError::CommandFailed {
            command: program,
            status,
        });
    }
    Ok(())
}

async fn unit_is_active(unit: &str) -> bool {
    Command::new("systemctl")
        .args(["is-active", "--quiet", unit])
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

async fn ensure_unit_running(unit: &str) -> Result<(), PostgresError> {
    if unit_is_active(unit).await {
        return Ok(());
    }
    tracing::info!(unit, "Service not active, starting it");
    let status = Command::new("sudo")
        .args(["systemctl", "start", unit])
        .status()
        .await
        .map_err(|source| PostgresError::Io {
            path: format!("systemctl start {unit}"),
            source,
        })?;
    if !status.success() {
        return Err(PostgresError::CommandFailed {
            command: "systemctl start",
            status,
        });
    }
    Ok(())
}

async fn stop_unit(unit: &str) -> Result<(), PostgresError> {
    tracing::info!(unit, "Stopping service");
    let status = Command::new("sudo")
        .args(["systemctl", "stop", unit])
        .status()
        .await
        .map_err(|source| PostgresError::Io {
            path: format!("systemctl stop {unit}"),
            source,
        })?;
    if !status.success() {
        return Err(PostgresError::CommandFailed {
            command: "systemctl stop",
            status,
        });
    }
    Ok(())
}

fn append_to_file(path: &Path, content: &str) -> Result<(), PostgresError> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|source| PostgresError::Io {
            path: path.display().to_string(),
            source,
        })?;
    file.write_all(content.as_bytes())
        .map_err(|source| PostgresError::Io {
            path: path.display().to_string(),
            source,
        })
}
