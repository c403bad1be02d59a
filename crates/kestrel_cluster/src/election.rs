//! Leader election over the store's compare-and-swap lease.
//!
//! The decision logic is the pure function [`evaluate_election`]; the
//! [`Election`] wrapper owns the locally-observed lease and drives the
//! store. Nothing here shares state across tasks: the leader loop owns its
//! `Election` outright.

use std::time::{Duration, Instant};

use uuid::Uuid;

use kestrel_common::error::{ElectionError, StoreError};
use kestrel_common::lease::{Lease, ObservedLease};
use kestrel_store::StateStore;

/// Outcome of one election evaluation.
#[derive(Debug)]
pub struct ElectionEvaluation {
    /// Attempt a lease CAS this cycle (either to take over or to refresh).
    pub should_campaign: bool,
    /// The observed lease to carry into the next cycle.
    pub observed: Option<ObservedLease>,
    /// Why, for the log line.
    pub note: &'static str,
}

/// Pure election decision. Given the previously observed lease, the lease
/// just fetched, and the current monotonic instant, decide whether to
/// campaign and what the new observation is.
///
/// Rules, in order:
/// - no lease in the store: campaign, observe nothing;
/// - first observation of any lease: record it with its full duration and
///   stand by (the hold-down that gives every new leader a full duration
///   from each observer's perspective);
/// - we hold the lease: campaign to refresh it;
/// - same RVN as before: decay the remaining time by the elapsed interval;
///   a new RVN restarts the clock at the full duration;
/// - whatever remains expired (`time_left <= 0`): campaign.
pub fn evaluate_election(
    prev: Option<&ObservedLease>,
    fetched: Option<Lease>,
    node_name: &str,
    now: Instant,
) -> ElectionEvaluation {
    let Some(lease) = fetched else {
        return ElectionEvaluation {
            should_campaign: true,
            observed: None,
            note: "No current leader, running for election",
        };
    };

    let mut observed = ObservedLease::fresh(lease, now);

    let Some(prev) = prev else {
        return ElectionEvaluation {
            should_campaign: false,
            observed: Some(observed),
            note: "Seeing first lease, doing nothing",
        };
    };

    if prev.lease.leader == node_name {
        return ElectionEvaluation {
            should_campaign: true,
            observed: Some(observed),
            note: "We are the current lease holder, refreshing lease",
        };
    }

    let mut note = "Updated observed lease";
    if prev.lease.revision_version_number == observed.lease.revision_version_number {
        let elapsed_ms = now.duration_since(prev.seen).as_millis() as i64;
        observed.time_left_ms = prev.time_left_ms - elapsed_ms;
        note = "No change in observed lease, updated time left";
    }

    if observed.is_expired() {
        let note = if observed.lease.leader == node_name {
            "Our own lease expired, running for election"
        } else {
            "Previous lease expired, running for election"
        };
        return ElectionEvaluation {
            should_campaign: true,
            observed: Some(observed),
            note,
        };
    }

    ElectionEvaluation {
        should_campaign: false,
        observed: Some(observed),
        note,
    }
}

/// Stateful election driver. Owned exclusively by the leader loop.
pub struct Election {
    node_name: String,
    lease_duration: Duration,
    last_observed: Option<ObservedLease>,
}

impl Election {
    pub fn new(node_name: impl Into<String>, lease_duration: Duration) -> Result<Self, ElectionError> {
        if lease_duration.is_zero() {
            return Err(ElectionError::ZeroDuration);
        }
        Ok(Self {
            node_name: node_name.into(),
            lease_duration,
            last_observed: None,
        })
    }

    /// One election cycle: fetch, evaluate, and campaign if told to.
    ///
    /// Winning the CAS is only logged; `last_observed` is not touched — the
    /// next fetch observes the newly written lease naturally, like any
    /// other node. Losing the race is routine.
    pub async fn run(&mut self, store: &dyn StateStore) -> Result<(), ElectionError> {
        let fetched = match store.fetch_lease().await {
            Ok(lease) => lease,
            Err(StoreError::IncompleteLease(detail)) => {
                tracing::warn!(detail, "Incomplete lease data in store, treating as no lease");
                None
            }
            Err(err) => {
                self.last_observed = None;
                return Err(ElectionError::FetchLease(err));
            }
        };

        let result = evaluate_election(
            self.last_observed.as_ref(),
            fetched,
            &self.node_name,
            Instant::now(),
        );
        self.last_observed = result.observed;

        if let Some(observed) = &self.last_observed {
            tracing::debug!(
                leader = %observed.lease.leader,
                rvn = %observed.lease.revision_version_number,
                duration_ms = observed.lease.duration.as_millis() as u64,
                time_left_ms = observed.time_left_ms,
                "Observed lease"
            );
        }
        tracing::debug!("Election evaluation: {}", result.note);

        if result.should_campaign {
            let new_lease = Lease {
                leader: self.node_name.clone(),
                revision_version_number: Uuid::new_v4(),
                duration: self.lease_duration,
            };
            let prev_rvn = self
                .last_observed
                .as_ref()
                .map(|o| o.lease.revision_version_number);

            let won = store
                .cas_lease(prev_rvn, new_lease)
                .await
                .map_err(ElectionError::CasLease)?;
            kestrel_observability::record_election_attempt(won);
            if won {
                tracing::info!("We are the leader");
            } else {
                tracing::info!("Lost CAS race to become leader");
            }
        }

        Ok(())
    }

    /// True while the last observation names us leader and its duration has
    /// not elapsed on the local monotonic clock.
    pub fn is_leader(&self) -> bool {
        let Some(observed) = &self.last_observed else {
            return false;
        };
        if observed.lease.leader != self.node_name {
            return false;
        }
        observed.seen.elapsed() <= observed.lease.duration
    }
}
