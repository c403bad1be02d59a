//! Short-lived PostgreSQL sessions.
//!
//! Every operation opens a fresh connection, runs a handful of statements,
//! and drops it. The daemon talks to its database once a second at most;
//! a pool would only hide connection failures we actively want to observe.

use std::time::Duration;

use tokio_postgres::{Client, NoTls};

use kestrel_cluster::database::DbNodeState;
use kestrel_common::error::PostgresError;
use kestrel_common::state::{ReplicaStat, ReplicationStatus};

const PROMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect to `host:port` as `user`, spawning the connection driver task.
pub async fn connect(
    host: &str,
    port: u16,
    user: &str,
    connect_timeout: Duration,
) -> Result<Client, PostgresError> {
    let addr = format!("{host}:{port}");
    let conn_str = format!(
        "host={host} port={port} user={user} connect_timeout={}",
        connect_timeout.as_secs().max(1)
    );

    let (client, connection) = tokio_postgres::connect(&conn_str, NoTls)
        .await
        .map_err(|source| PostgresError::Connect {
            addr: addr.clone(),
            source,
        })?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(%err, "Postgres connection driver ended");
        }
    });

    Ok(client)
}

/// One introspection pass: role, then either the replication producers
/// (primary) or the wal-receiver row (replica).
pub async fn fetch_node_state(
    host: &str,
    port: u16,
    user: &str,
    connect_timeout: Duration,
) -> Result<DbNodeState, PostgresError> {
    let client = connect(host, port, user, connect_timeout).await?;

    let row = client
        .query_one("SELECT now()::text, NOT pg_is_in_recovery()", &[])
        .await
        .map_err(|source| PostgresError::Query {
            context: "check pg_is_in_recovery",
            source,
        })?;
    let node_time: String = row.get(0);
    let is_primary: bool = row.get(1);

    if is_primary {
        let rows = client
            .query(
                "SELECT coalesce(client_hostname, client_addr::text, '') AS hostname, \
                        coalesce(state, '') AS state, \
                        write_lsn::text, write_lag::text, sync_state, reply_time::text \
                 FROM pg_stat_replication",
                &[],
            )
            .await
            .map_err(|source| PostgresError::Query {
                context: "query pg_stat_replication",
                source,
            })?;

        let replicas = rows
            .iter()
            .map(|row| ReplicaStat {
                hostname: row.get(0),
                state: row.get(1),
                write_lsn: row.get(2),
                write_lag: row.get(3),
                sync_state: row.get(4),
                reply_time: row.get(5),
            })
            .collect();

        return Ok(DbNodeState {
            node_time,
            is_primary,
            replicas,
            wal_receiver: None,
        });
    }

    // A replica without a wal-receiver row (e.g. mid-restart) is still a
    // valid observation; the state machine reports it as a health reason.
    let receiver = client
        .query_opt(
            "SELECT coalesce(sender_host, '') AS sender_host, \
                    coalesce(status, '') AS status, \
                    written_lsn::text \
             FROM pg_stat_wal_receiver",
            &[],
        )
        .await
        .map_err(|source| PostgresError::Query {
            context: "query pg_stat_wal_receiver",
            source,
        })?
        .map(|row| ReplicationStatus {
            primary_host: row.get(0),
            status: row.get(1),
            written_lsn: row.get(2),
        });

    Ok(DbNodeState {
        node_time,
        is_primary,
        replicas: Vec::new(),
        wal_receiver: receiver,
    })
}

/// Whether the instance reports `pg_is_in_recovery()`.
pub async fn is_in_recovery(
    host: &str,
    port: u16,
    user: &str,
    connect_timeout: Duration,
) -> Result<bool, PostgresError> {
    let client = connect(host, port, user, connect_timeout).await?;
    let row = client
        .query_one("SELECT pg_is_in_recovery()", &[])
        .await
        .map_err(|source| PostgresError::Query {
            context: "check pg_is_in_recovery",
            source,
        })?;
    Ok(row.get(0))
}

/// Promote a replica to primary, synchronously. Fails when the target is
/// not in recovery.
pub async fn promote_replica(host: &str, port: u16, user: &str) -> Result<(), PostgresError> {
    tracing::info!(host, port, "Promoting replica to primary");
    let client = connect(host, port, user, PROMOTE_TIMEOUT).await?;

    let row = client
        .query_one("SELECT pg_is_in_recovery()", &[])
        .await
        .map_err(|source| PostgresError::Query {
            context: "check recovery status before promote",
            source,
        })?;
    if !row.get::<_, bool>(0) {
        return Err(PostgresError::NotInRecovery);
    }

    // pg_promote(wait := true) blocks until promotion completes.
    client
        .execute("SELECT pg_promote(true)", &[])
        .await
        .map_err(|source| PostgresError::Query {
            context: "pg_promote",
            source,
        })?;

    tracing::info!(host, port, "Promotion complete");
    Ok(())
}

/// Ask the server to re-read its configuration files.
pub async fn reload_config(
    host: &str,
    port: u16,
    user: &str,
    connect_timeout: Duration,
) -> Result<(), PostgresError> {
    let client = connect(host, port, user, connect_timeout).await?;
    client
        .execute("SELECT pg_reload_conf()", &[])
        .await
        .map_err(|source| PostgresError::Query {
            context: "pg_reload_conf",
            source,
        })?;
    Ok(())
}

/// Liveness probe: connect and run the cheapest possible statement.
pub async fn check_db(
    host: &str,
    port: u16,
    user: &str,
    connect_timeout: Duration,
) -> Result<(), PostgresError> {
    let client = connect(host, port, user, connect_timeout).await?;
    client
        .query_one("SELECT 1", &[])
        .await
        .map_err(|source| PostgresError::Query {
            context: "liveness probe",
            source,
        })?;
    Ok(())
}
