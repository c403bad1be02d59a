//! Leader lease records and their locally-observed view.
//!
//! A lease is a time-bound lock named after the node that holds it. The
//! holder refreshes it by writing a fresh revision-version number (RVN);
//! every other node expires it on a *local monotonic clock*, counting from
//! the instant it first observed that RVN. No wall-clock value ever crosses
//! nodes, so clock skew cannot produce two simultaneous self-believed
//! leaders longer than one lease duration.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A lease as stored in the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Name of the leader node that holds the lock.
    pub leader: String,

    /// Revision-version number: a fresh random identifier written on every
    /// refresh. Doubles as the compare-and-swap witness.
    #[serde(rename = "rvn")]
    pub revision_version_number: Uuid,

    /// Lease duration. Observers expire the lease this long after they
    /// first saw its RVN.
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

/// The latest lease this node has observed, plus when it observed it.
#[derive(Debug, Clone)]
pub struct ObservedLease {
    pub lease: Lease,

    /// Monotonic instant at which this RVN was first observed locally.
    pub seen: Instant,

    /// Remaining lifetime at `seen`, in milliseconds. Carried signed so the
    /// expiration boundary is exact: the lease is expired when this drops
    /// to zero or below.
    pub time_left_ms: i64,
}

impl ObservedLease {
    /// A freshly observed lease gets the full duration from this node's
    /// perspective.
    pub fn fresh(lease: Lease, seen: Instant) -> Self {
        let time_left_ms = lease.duration.as_millis() as i64;
        Self {
            lease,
            seen,
            time_left_ms,
        }
    }

    /// Expired exactly when no time is left (`time_left <= 0`).
    pub fn is_expired(&self) -> bool {
        self.time_left_ms <= 0
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_i64(d.as_millis() as i64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms = i64::deserialize(de)?;
        if ms < 0 {
            return Err(serde::de::Error::custom(format!(
                "negative lease duration: {ms}ms"
            )));
        }
        Ok(Duration::from_millis(ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(duration: Duration) -> Lease {
        Lease {
            leader: "db-1".into(),
            revision_version_number: Uuid::new_v4(),
            duration,
        }
    }

    #[test]
    fn test_fresh_observation_has_full_duration() {
        let obs = ObservedLease::fresh(lease(Duration::from_secs(5)), Instant::now());
        assert_eq!(obs.time_left_ms, 5_000);
        assert!(!obs.is_expired());
    }

    #[test]
    fn test_expired_at_exact_boundary() {
        let mut obs = ObservedLease::fresh(lease(Duration::from_secs(5)), Instant::now());
        obs.time_left_ms = 1;
        assert!(!obs.is_expired());
        obs.time_left_ms = 0;
        assert!(obs.is_expired());
        obs.time_left_ms = -250;
        assert!(obs.is_expired());
    }

    #[test]
    fn test_lease_wire_format() {
        let l = Lease {
            leader: "db-2".into(),
            revision_version_number: Uuid::nil(),
            duration: Duration::from_secs(5),
        };
        let json = serde_json::to_value(&l).unwrap();
        assert_eq!(json["leader"], "db-2");
        assert_eq!(json["duration_ms"], 5_000);
        assert_eq!(json["rvn"], "00000000-0000-0000-0000-000000000000");

        let back: Lease = serde_json::from_value(json).unwrap();
        assert_eq!(back, l);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let err = serde_json::from_str::<Lease>(
            r#"{"leader":"a","rvn":"00000000-0000-0000-0000-000000000000","duration_ms":-1}"#,
        );
        assert!(err.is_err());
    }
}
