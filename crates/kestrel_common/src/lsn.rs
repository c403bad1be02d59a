//! PostgreSQL write-ahead-log positions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A WAL position, parsed from Postgres' `"HHHH/LLLL"` hex form into
/// `(high << 32) | low`. Ordering matches byte-comparing `(high, low)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to parse LSN {0:?}")]
pub struct ParseLsnError(pub String);

impl Lsn {
    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn low(self) -> u32 {
        self.0 as u32
    }
}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s.split_once('/').ok_or_else(|| ParseLsnError(s.into()))?;
        let high = u32::from_str_radix(high, 16).map_err(|_| ParseLsnError(s.into()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| ParseLsnError(s.into()))?;
        Ok(Lsn(((high as u64) << 32) | low as u64))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.high(), self.low())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_basic() {
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn(0));
        assert_eq!("0/10000000".parse::<Lsn>().unwrap(), Lsn(0x1000_0000));
        assert_eq!(
            "16/B374D848".parse::<Lsn>().unwrap(),
            Lsn(0x16_B374_D848)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("0".parse::<Lsn>().is_err());
        assert!("0/".parse::<Lsn>().is_err());
        assert!("zz/0".parse::<Lsn>().is_err());
        assert!("0/0/0".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_ordering_matches_scenario() {
        let b: Lsn = "0/10000000".parse().unwrap();
        let c: Lsn = "0/0FFF0000".parse().unwrap();
        assert!(b > c);
    }

    proptest! {
        #[test]
        fn prop_ordering_matches_pair_ordering(ah: u32, al: u32, bh: u32, bl: u32) {
            let a: Lsn = format!("{ah:X}/{al:X}").parse().unwrap();
            let b: Lsn = format!("{bh:X}/{bl:X}").parse().unwrap();
            prop_assert_eq!(a < b, (ah, al) < (bh, bl));
            prop_assert_eq!(a == b, (ah, al) == (bh, bl));
        }

        #[test]
        fn prop_display_roundtrips(high: u32, low: u32) {
            let lsn = Lsn(((high as u64) << 32) | low as u64);
            prop_assert_eq!(lsn.to_string().parse::<Lsn>().unwrap(), lsn);
        }
    }
}
