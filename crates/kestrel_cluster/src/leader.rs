//! The leader reconciler: run the election every tick and, while leading,
//! arbitrate failover and publish the authoritative cluster status.
//!
//! Non-leaders do nothing here beyond keeping their lease observation
//! fresh — the node loop still recomputes and may publish status updates,
//! but only the leader proposes primary reassignment.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use kestrel_common::error::KestrelError;
use kestrel_store::StateStore;

use crate::election::Election;
use crate::failover::{orchestrate_if_needed, FailoverSettings};
use crate::node::TICK_PERIOD;
use crate::status::{compute_new_cluster_status, write_cluster_status_if_changed};
use crate::wakeup::WakeupManager;

/// Budget for one election pass (lease fetch plus CAS).
const ELECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the leader reconciler until shutdown. The `Election` lives entirely
/// inside this task; no other task reads or writes the observed lease.
pub async fn leader_reconciler_loop(
    store: Arc<dyn StateStore>,
    node_name: String,
    lease_duration: Duration,
    settings: FailoverSettings,
    wakeup: Option<WakeupManager>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), KestrelError> {
    let mut election = Election::new(node_name.clone(), lease_duration)?;

    let mut ticker = tokio::time::interval(TICK_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("Leader reconciler stopping");
                    return Ok(());
                }
                continue;
            }
        }

        match tokio::time::timeout(ELECTION_TIMEOUT, election.run(store.as_ref())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(%err, "Election error"),
            Err(_) => tracing::warn!("Election pass timed out"),
        }

        if election.is_leader() {
            if let Err(err) =
                perform_leader_tasks(store.as_ref(), &node_name, &settings, wakeup.as_ref()).await
            {
                if err.is_fatal() {
                    return Err(err);
                }
                tracing::warn!(%err, "Failed to perform leader tasks");
            }
        }
    }
}

/// One leader pass: snapshot the cluster, let the failover orchestrator
/// override the intended primary when the current one is gone, then
/// compute and publish the status. Public so integration tests can drive
/// leader passes directly.
pub async fn perform_leader_tasks(
    store: &dyn StateStore,
    node_name: &str,
    settings: &FailoverSettings,
    wakeup: Option<&WakeupManager>,
) -> Result<(), KestrelError> {
    let mut state = store.fetch_cluster_state().await?;
    let fetched_status = state.status.clone();

    match orchestrate_if_needed(store, &state, settings).await {
        Ok(Some(proposed)) => state.status = proposed,
        Ok(None) => {}
        // No promotable replica is a condition the next cycle may cure,
        // not a reason to stop publishing health.
        Err(err) => tracing::warn!(%err, "Failover orchestration skipped"),
    }

    let computed = compute_new_cluster_status(&state);
    let (_, changed) =
        write_cluster_status_if_changed(store, &fetched_status, computed, node_name).await?;
    if changed {
        if let Some(wakeup) = wakeup {
            wakeup.broadcast(state.peer_names(node_name));
        }
    }
    Ok(())
}
