//! Leader-side failover: detect a dead or demoted primary, pick the most
//! caught-up replica, wait (softly) for the others, and propose the new
//! role assignment.
//!
//! Only the elected leader runs this path, so at most one node proposes a
//! primary reassignment at a time; the CAS on the cluster status remains
//! the final arbiter regardless.

use std::time::{Duration, Instant};

use kestrel_common::error::KestrelError;
use kestrel_common::lsn::Lsn;
use kestrel_common::state::{ClusterState, ClusterStatus};
use kestrel_store::StateStore;

/// Tunables for the catch-up wait.
#[derive(Debug, Clone)]
pub struct FailoverSettings {
    /// Soft ceiling on the catch-up wait. Expiry logs and continues.
    pub catchup_timeout: Duration,
    /// Poll interval while waiting for replicas to catch up.
    pub poll_interval: Duration,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            catchup_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// The chosen promotion candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestReplica {
    pub name: String,
    pub written_lsn: Lsn,
}

/// Whether the current intended primary needs replacing, and why.
///
/// Returns `None` before bootstrap (no intended primary yet — primary
/// selection is the state machine's job, not a failover).
pub fn needs_failover(status: &ClusterStatus, state: &ClusterState) -> Option<&'static str> {
    if status.intended_primary.is_empty() {
        return None;
    }
    match state.nodes.get(&status.intended_primary) {
        None => Some("intended primary has no status entry"),
        Some(node) if node.error().is_some() => Some("intended primary reports an error"),
        Some(node) if !node.is_primary() => Some("intended primary is not running as primary"),
        Some(_) => None,
    }
}

/// Pick the replica with the highest written LSN, skipping nodes with
/// errors, nodes that claim to be primary, and nodes without a usable
/// wal-receiver position. Ties go to the lexicographically first name
/// (iteration is name-sorted and a tie does not displace the incumbent).
pub fn find_best_replica(
    state: &ClusterState,
    exclude_primary: &str,
) -> Result<BestReplica, KestrelError> {
    let mut best: Option<BestReplica> = None;

    for (name, node) in &state.nodes {
        if name == exclude_primary {
            continue;
        }
        if let Some(error) = node.error() {
            tracing::debug!(node = %name, error, "Skipping candidate with an error");
            continue;
        }
        if node.is_primary() {
            tracing::debug!(node = %name, "Skipping candidate that reports as primary");
            continue;
        }
        let Some(written) = node.replication().and_then(|r| r.written_lsn.as_deref()) else {
            tracing::debug!(node = %name, "Skipping candidate without a written LSN");
            continue;
        };
        let lsn: Lsn = match written.parse() {
            Ok(lsn) => lsn,
            Err(err) => {
                tracing::warn!(node = %name, %err, "Skipping candidate with unparseable LSN");
                continue;
            }
        };
        if best.as_ref().is_none_or(|b| lsn > b.written_lsn) {
            best = Some(BestReplica {
                name: name.clone(),
                written_lsn: lsn,
            });
        }
    }

    match best {
        Some(best) => {
            tracing::info!(
                node = %best.name,
                lsn = %best.written_lsn,
                "Selected best replica for promotion"
            );
            Ok(best)
        }
        None => Err(KestrelError::NoSuitableReplica),
    }
}

/// Wait until every other measurable replica has written at least the
/// candidate's starting LSN. The timeout is soft: expiry logs, bumps a
/// metric, and returns normally — promotion proceeds either way.
pub async fn wait_for_replicas_to_catch_up(
    store: &dyn StateStore,
    chosen: &BestReplica,
    old_primary: &str,
    settings: &FailoverSettings,
) {
    let deadline = Instant::now() + settings.catchup_timeout;

    loop {
        match store.fetch_cluster_state().await {
            Ok(state) => {
                let mut behind = Vec::new();
                for (name, node) in &state.nodes {
                    if name == &chosen.name || name == old_primary {
                        continue;
                    }
                    // Nodes without a readable position cannot be waited on.
                    let Some(lsn) = node
                        .replication()
                        .and_then(|r| r.written_lsn.as_deref())
                        .and_then(|s| s.parse::<Lsn>().ok())
                    else {
                        continue;
                    };
                    if lsn < chosen.written_lsn {
                        behind.push(name.clone());
                    }
                }
                if behind.is_empty() {
                    tracing::info!("All replicas caught up to {}", chosen.written_lsn);
                    return;
                }
                tracing::debug!(?behind, target = %chosen.written_lsn, "Waiting for replicas to catch up");
            }
            Err(err) => {
                tracing::warn!(%err, "Failed to fetch cluster state during catch-up wait");
            }
        }

        if Instant::now() >= deadline {
            tracing::warn!(
                timeout_ms = settings.catchup_timeout.as_millis() as u64,
                "Replica catch-up wait timed out, continuing with failover"
            );
            kestrel_observability::record_catchup_timeout();
            return;
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

/// Build the post-failover status: the chosen node becomes the intended
/// primary, the old primary joins the replica list, and the replica list
/// stays name-sorted.
pub fn apply_failover(status: &ClusterStatus, chosen: &str) -> ClusterStatus {
    let mut new_status = status.clone();
    let old_primary = std::mem::replace(&mut new_status.intended_primary, chosen.to_string());
    new_status.intended_replicas.retain(|name| name != chosen);
    if !old_primary.is_empty()
        && old_primary != chosen
        && !new_status.intended_replicas.contains(&old_primary)
    {
        new_status.intended_replicas.push(old_primary);
    }
    new_status.intended_replicas.sort();
    new_status
}

/// Run the full orchestration against a fresh state snapshot. Returns the
/// proposed status when a failover is warranted, `None` when the primary
/// is fine.
pub async fn orchestrate_if_needed(
    store: &dyn StateStore,
    state: &ClusterState,
    settings: &FailoverSettings,
) -> Result<Option<ClusterStatus>, KestrelError> {
    let Some(reason) = needs_failover(&state.status, state) else {
        return Ok(None);
    };
    tracing::warn!(
        primary = %state.status.intended_primary,
        reason,
        "Primary failover triggered"
    );
    kestrel_observability::record_failover_triggered();

    let best = find_best_replica(state, &state.status.intended_primary)?;
    wait_for_replicas_to_catch_up(store, &best, &state.status.intended_primary, settings).await;
    Ok(Some(apply_failover(&state.status, &best.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::state::{NodeRole, NodeStatus, ReplicationStatus};
    use kestrel_store::{MemoryStore, StateStore as _};
    use uuid::Uuid;

    fn replica(name: &str, written_lsn: Option<&str>) -> NodeStatus {
        NodeStatus {
            name: name.into(),
            status_uuid: Uuid::new_v4(),
            node_time: None,
            role: NodeRole::Replica {
                replication: Some(ReplicationStatus {
                    primary_host: "db-a".into(),
                    status: "streaming".into(),
                    written_lsn: written_lsn.map(Into::into),
                }),
            },
        }
    }

    fn primary(name: &str) -> NodeStatus {
        NodeStatus {
            name: name.into(),
            status_uuid: Uuid::new_v4(),
            node_time: None,
            role: NodeRole::Primary { replicas: vec![] },
        }
    }

    fn failed(name: &str) -> NodeStatus {
        NodeStatus {
            name: name.into(),
            status_uuid: Uuid::new_v4(),
            node_time: None,
            role: NodeRole::Failed {
                error: "connection refused".into(),
            },
        }
    }

    fn state_of(status: ClusterStatus, nodes: Vec<NodeStatus>) -> ClusterState {
        let mut state = ClusterState {
            status,
            ..ClusterState::default()
        };
        for n in nodes {
            state.nodes.insert(n.name.clone(), n);
        }
        state
    }

    fn status_with(primary: &str, replicas: &[&str]) -> ClusterStatus {
        ClusterStatus {
            status_uuid: Uuid::new_v4(),
            intended_primary: primary.into(),
            intended_replicas: replicas.iter().map(|s| s.to_string()).collect(),
            ..ClusterStatus::default()
        }
    }

    #[test]
    fn test_no_failover_before_bootstrap() {
        let state = state_of(status_with("", &[]), vec![replica("db-b", Some("0/1"))]);
        assert_eq!(needs_failover(&state.status, &state), None);
    }

    #[test]
    fn test_no_failover_for_healthy_primary() {
        let state = state_of(
            status_with("db-a", &["db-b"]),
            vec![primary("db-a"), replica("db-b", Some("0/1"))],
        );
        assert_eq!(needs_failover(&state.status, &state), None);
    }

    #[test]
    fn test_failover_triggers() {
        // Missing entry.
        let state = state_of(status_with("db-a", &["db-b"]), vec![replica("db-b", Some("0/1"))]);
        assert!(needs_failover(&state.status, &state).is_some());

        // Errored entry.
        let state = state_of(
            status_with("db-a", &["db-b"]),
            vec![failed("db-a"), replica("db-b", Some("0/1"))],
        );
        assert!(needs_failover(&state.status, &state).is_some());

        // Demoted entry.
        let state = state_of(
            status_with("db-a", &["db-b"]),
            vec![replica("db-a", Some("0/1")), replica("db-b", Some("0/1"))],
        );
        assert_eq!(
            needs_failover(&state.status, &state),
            Some("intended primary is not running as primary")
        );
    }

    #[test]
    fn test_best_replica_by_lsn() {
        // The clean-failover scenario: B at 0/10000000 beats C at 0/0FFF0000.
        let state = state_of(
            status_with("db-a", &["db-b", "db-c"]),
            vec![
                failed("db-a"),
                replica("db-b", Some("0/10000000")),
                replica("db-c", Some("0/0FFF0000")),
            ],
        );
        let best = find_best_replica(&state, "db-a").unwrap();
        assert_eq!(best.name, "db-b");
        assert_eq!(best.written_lsn, "0/10000000".parse().unwrap());
    }

    #[test]
    fn test_best_replica_skips_unusable_candidates() {
        let state = state_of(
            status_with("db-a", &[]),
            vec![
                failed("db-b"),
                primary("db-c"),
                replica("db-d", None),
                replica("db-e", Some("not-an-lsn")),
                replica("db-f", Some("0/100")),
            ],
        );
        let best = find_best_replica(&state, "db-a").unwrap();
        assert_eq!(best.name, "db-f");
    }

    #[test]
    fn test_best_replica_tie_prefers_first_name() {
        let state = state_of(
            status_with("db-a", &[]),
            vec![
                replica("db-c", Some("0/500")),
                replica("db-b", Some("0/500")),
            ],
        );
        assert_eq!(find_best_replica(&state, "db-a").unwrap().name, "db-b");
    }

    #[test]
    fn test_no_candidate_is_an_error() {
        let state = state_of(status_with("db-a", &[]), vec![failed("db-b")]);
        assert!(matches!(
            find_best_replica(&state, "db-a"),
            Err(KestrelError::NoSuitableReplica)
        ));
    }

    #[test]
    fn test_apply_failover_swaps_roles() {
        let status = status_with("db-a", &["db-b", "db-c"]);
        let new_status = apply_failover(&status, "db-b");
        assert_eq!(new_status.intended_primary, "db-b");
        assert_eq!(new_status.intended_replicas, vec!["db-a", "db-c"]);
    }

    #[test]
    fn test_apply_failover_does_not_duplicate_old_primary() {
        let status = status_with("db-a", &["db-a", "db-b"]);
        let new_status = apply_failover(&status, "db-b");
        assert_eq!(new_status.intended_replicas, vec!["db-a"]);
    }

    #[test]
    fn test_apply_failover_to_current_primary_is_identity() {
        let status = status_with("db-a", &["db-b", "db-c"]);
        let new_status = apply_failover(&status, "db-a");
        assert_eq!(new_status.intended_primary, "db-a");
        assert_eq!(new_status.intended_replicas, vec!["db-b", "db-c"]);
    }

    #[tokio::test]
    async fn test_catchup_returns_when_all_caught_up() {
        let store = MemoryStore::new();
        for node in [
            replica("db-b", Some("0/200")),
            replica("db-c", Some("0/200")),
        ] {
            store.write_node_status(&node).await.unwrap();
        }
        let chosen = BestReplica {
            name: "db-b".into(),
            written_lsn: "0/200".parse().unwrap(),
        };
        let settings = FailoverSettings {
            catchup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        };
        // Completes well inside the timeout because db-c is already there.
        tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_replicas_to_catch_up(&store, &chosen, "db-a", &settings),
        )
        .await
        .expect("catch-up wait should return promptly");
    }

    #[tokio::test]
    async fn test_catchup_timeout_is_soft() {
        let store = MemoryStore::new();
        for node in [
            replica("db-b", Some("0/200")),
            replica("db-c", Some("0/100")), // forever behind
        ] {
            store.write_node_status(&node).await.unwrap();
        }
        let chosen = BestReplica {
            name: "db-b".into(),
            written_lsn: "0/200".parse().unwrap(),
        };
        let settings = FailoverSettings {
            catchup_timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        };
        // Returns (not hangs, not errors) once the soft timeout passes.
        tokio::time::timeout(
            Duration::from_secs(2),
            wait_for_replicas_to_catch_up(&store, &chosen, "db-a", &settings),
        )
        .await
        .expect("soft timeout must return normally");
    }

    #[tokio::test]
    async fn test_orchestrate_full_pass() {
        let store = MemoryStore::new();
        let status = status_with("db-a", &["db-b", "db-c"]);
        let nodes = vec![
            failed("db-a"),
            replica("db-b", Some("0/10000000")),
            replica("db-c", Some("0/10000000")),
        ];
        for node in &nodes {
            store.write_node_status(node).await.unwrap();
        }
        let state = state_of(status, nodes);
        let settings = FailoverSettings {
            catchup_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        };

        let proposed = orchestrate_if_needed(&store, &state, &settings)
            .await
            .unwrap()
            .expect("failover should be proposed");
        assert_eq!(proposed.intended_primary, "db-b");
        assert_eq!(proposed.intended_replicas, vec!["db-a", "db-c"]);

        // A healthy primary proposes nothing.
        let healthy = state_of(
            status_with("db-a", &["db-b"]),
            vec![primary("db-a"), replica("db-b", Some("0/1"))],
        );
        assert!(orchestrate_if_needed(&store, &healthy, &settings)
            .await
            .unwrap()
            .is_none());
    }
}
