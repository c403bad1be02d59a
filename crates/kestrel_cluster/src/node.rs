//! The node reconciler: publish what the local database looks like, agree
//! on the cluster status, and drive the local database toward its intended
//! role.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use kestrel_common::error::{KestrelError, StoreError};
use kestrel_common::state::{NodeRole, NodeStatus};
use kestrel_store::StateStore;

use crate::database::LocalDatabase;
use crate::status::{compute_new_cluster_status, write_cluster_status_if_changed};
use crate::wakeup::WakeupManager;

/// Reconciliation tick period for both loops.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

const FETCH_STATE_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_STATUS_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the node reconciler until shutdown. Ticks every second; a wakeup
/// packet short-circuits the wait. Per-cycle failures are logged and the
/// loop continues; only fatal errors propagate.
pub async fn node_reconciler_loop(
    store: Arc<dyn StateStore>,
    db: Arc<dyn LocalDatabase>,
    node_name: String,
    wakeup: Option<WakeupManager>,
    mut wakeup_rx: Option<mpsc::Receiver<()>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), KestrelError> {
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wakeup_signal(&mut wakeup_rx) => {
                tracing::debug!("Wakeup received, reconciling immediately");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("Node reconciler stopping");
                    return Ok(());
                }
                continue;
            }
        }

        match reconcile_cycle(store.as_ref(), db.as_ref(), &node_name, wakeup.as_ref()).await {
            Ok(()) => kestrel_observability::record_reconcile_cycle(true),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                kestrel_observability::record_reconcile_cycle(false);
                tracing::warn!(%err, "Reconciliation cycle failed");
            }
        }
    }
}

/// One full reconciliation cycle. Public so integration tests can drive
/// cycles directly against a scripted store and database.
pub async fn reconcile_cycle(
    store: &dyn StateStore,
    db: &dyn LocalDatabase,
    node_name: &str,
    wakeup: Option<&WakeupManager>,
) -> Result<(), KestrelError> {
    // A failed status publish must not stop convergence; the node will
    // simply look stale to others until the next cycle.
    if let Err(err) = publish_node_status(store, db, node_name).await {
        tracing::warn!(%err, "Failed to publish node status");
    }

    perform_node_tasks(store, db, node_name, wakeup).await
}

/// Observe the local database and publish the result, stamping a fresh
/// status UUID. An introspection failure is itself an observation: the
/// published status carries the error.
pub async fn publish_node_status(
    store: &dyn StateStore,
    db: &dyn LocalDatabase,
    node_name: &str,
) -> Result<(), KestrelError> {
    let (node_time, role) = match tokio::time::timeout(FETCH_STATE_TIMEOUT, db.fetch_state()).await
    {
        Ok(Ok(observed)) => {
            let role = if observed.is_primary {
                NodeRole::Primary {
                    replicas: observed.replicas,
                }
            } else {
                NodeRole::Replica {
                    replication: observed.wal_receiver,
                }
            };
            (Some(observed.node_time), role)
        }
        Ok(Err(err)) => {
            tracing::warn!(%err, "Failed to fetch local database state");
            (
                None,
                NodeRole::Failed {
                    error: err.to_string(),
                },
            )
        }
        Err(_) => {
            tracing::warn!(timeout_ms = FETCH_STATE_TIMEOUT.as_millis() as u64, "Local database state fetch timed out");
            (
                None,
                NodeRole::Failed {
                    error: format!(
                        "fetch state timed out after {}ms",
                        FETCH_STATE_TIMEOUT.as_millis()
                    ),
                },
            )
        }
    };

    let status = NodeStatus {
        name: node_name.to_string(),
        status_uuid: Uuid::new_v4(),
        node_time,
        role,
    };

    tokio::time::timeout(WRITE_STATUS_TIMEOUT, store.write_node_status(&status))
        .await
        .map_err(|_| StoreError::Timeout(WRITE_STATUS_TIMEOUT))??;
    Ok(())
}

/// Fetch the shared state, converge the status record, and converge the
/// local database to the effective role assignment.
async fn perform_node_tasks(
    store: &dyn StateStore,
    db: &dyn LocalDatabase,
    node_name: &str,
    wakeup: Option<&WakeupManager>,
) -> Result<(), KestrelError> {
    let state = store.fetch_cluster_state().await?;

    let computed = compute_new_cluster_status(&state);
    let (effective, changed) =
        write_cluster_status_if_changed(store, &state.status, computed, node_name).await?;

    if changed {
        if let Some(wakeup) = wakeup {
            wakeup.broadcast(state.peer_names(node_name));
        }
    }

    if effective.intended_primary == node_name {
        db.configure_as_primary().await?;
    } else if effective.intended_replicas.iter().any(|r| r == node_name) {
        db.configure_as_replica(&effective.intended_primary).await?;
    } else {
        return Err(KestrelError::NotInCluster {
            node: node_name.to_string(),
        });
    }

    db.ensure_pooler_running().await?;
    Ok(())
}

/// Resolves when a wakeup arrives; pends forever when the channel is
/// disabled or has closed.
async fn wakeup_signal(rx: &mut Option<mpsc::Receiver<()>>) {
    if let Some(rx) = rx {
        if rx.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}
