//! Daemon wiring: spawn the reconciler loops, the wakeup listener, and the
//! health server under one shutdown signal, and fall over hard when any of
//! them fails.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;

use kestrel_cluster::database::LocalDatabase;
use kestrel_cluster::failover::FailoverSettings;
use kestrel_cluster::leader::leader_reconciler_loop;
use kestrel_cluster::node::node_reconciler_loop;
use kestrel_cluster::wakeup::WakeupManager;
use kestrel_common::config::KestrelConfig;
use kestrel_common::error::KestrelError;
use kestrel_postgres::PostgresNode;
use kestrel_store::StateStore;

use crate::health;

/// Grace period for draining the health server and loops at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the supervisor until a signal arrives or a task fails fatally.
pub async fn run(config: KestrelConfig, store: Arc<dyn StateStore>) -> Result<()> {
    let node_name = config.cluster.node_name.clone();
    tracing::info!(
        cluster = %config.cluster.name,
        node = %node_name,
        lease_ms = config.cluster.lease_duration_ms,
        "Starting kestrel daemon"
    );

    if !config.health.metrics_addr.is_empty() {
        if let Err(err) = kestrel_observability::init_metrics(&config.health.metrics_addr) {
            tracing::warn!(%err, "Failed to initialize metrics exporter");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let db: Arc<dyn LocalDatabase> = Arc::new(PostgresNode::new(
        config.postgres.clone(),
        config.pooler.clone(),
    ));

    // The wakeup channel is optional; a bind failure, however, is fatal —
    // a daemon that silently lost its fast path is harder to debug than
    // one that refuses to start.
    let (wakeup, wakeup_rx) = if config.wakeup.port > 0 {
        let (manager, rx) = WakeupManager::new(
            config.wakeup.port,
            config.cluster.name.clone(),
            node_name.clone(),
        );
        manager
            .start_listener(shutdown_rx.clone())
            .await
            .context("failed to start wakeup listener")?;
        (Some(manager), Some(rx))
    } else {
        tracing::info!("Wakeup channel disabled (port 0)");
        (None, None)
    };

    let mut tasks: JoinSet<Result<(), KestrelError>> = JoinSet::new();

    tasks.spawn(leader_reconciler_loop(
        store.clone(),
        node_name.clone(),
        config.lease_duration(),
        FailoverSettings {
            catchup_timeout: config.catchup_timeout(),
            ..FailoverSettings::default()
        },
        wakeup.clone(),
        shutdown_rx.clone(),
    ));

    tasks.spawn(node_reconciler_loop(
        store.clone(),
        db,
        node_name.clone(),
        wakeup,
        wakeup_rx,
        shutdown_rx.clone(),
    ));

    tasks.spawn(health::run_health_server(
        config.clone(),
        shutdown_rx.clone(),
    ));

    // First of: an exit signal, or any task ending. A task that returns at
    // all before shutdown is a failure — the loops only return on shutdown
    // or fatal error.
    let outcome: Result<()> = tokio::select! {
        reason = wait_for_shutdown_signal() => {
            tracing::info!("{reason}, shutting down");
            Ok(())
        }
        joined = tasks.join_next() => match joined {
            Some(Ok(Ok(()))) => Err(anyhow::anyhow!("daemon task exited unexpectedly")),
            Some(Ok(Err(err))) => Err(err).context("fatal daemon error"),
            Some(Err(join_err)) => Err(join_err).context("daemon task panicked"),
            None => Err(anyhow::anyhow!("no daemon tasks were started")),
        },
    };

    // Drain: signal everyone, give them a grace period, then cut losses.
    let _ = shutdown_tx.send(true);
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(%err, "Task failed during shutdown"),
                Err(join_err) => tracing::warn!(%join_err, "Task panicked during shutdown"),
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("Shutdown drain timed out, aborting remaining tasks");
        tasks.abort_all();
    }

    outcome
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, returning which one fired.
async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(%err, "Failed to register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT received";
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT received",
            _ = sigterm.recv() => "SIGTERM received",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT received"
    }
}
