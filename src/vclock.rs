//! Vector clock: a mapping from replica identifier to the last known log
//! sequence number of that replica.
//!
//! The WAL writer holds the authoritative clock and advances it by
//! "following" the rows it commits; the transaction thread assigns tentative
//! LSNs from its own copy. The sum of all components (the *signature*) names
//! log files and orders log states.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::{Lsn, ReplicaId, Signature};
use crate::error::{Error, Result};

/// A mapping `replica_id -> LSN` with monotonically non-decreasing components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VClock {
    components: BTreeMap<ReplicaId, Lsn>,
}

impl VClock {
    /// Creates an empty clock (signature 0).
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the LSN recorded for `replica_id`, or 0 if unknown.
    pub fn get(&self, replica_id: ReplicaId) -> Lsn {
        self.components.get(&replica_id).copied().unwrap_or(0)
    }

    /// Sum of all components.
    pub fn sum(&self) -> Signature {
        self.components.values().sum()
    }

    /// Moves the component for `replica_id` forward to `lsn`.
    ///
    /// The new value must be strictly greater than the current one: a write
    /// must advance at least one component, never rewind it.
    pub fn follow(&mut self, replica_id: ReplicaId, lsn: Lsn) -> Result<()> {
        let current = self.get(replica_id);
        if lsn <= current {
            return Err(Error::VClockOrder {
                replica_id,
                from: current,
                to: lsn,
            });
        }
        self.components.insert(replica_id, lsn);
        Ok(())
    }

    /// Increments the component for `replica_id` and returns the new LSN.
    pub fn advance(&mut self, replica_id: ReplicaId) -> Lsn {
        let next = self.get(replica_id) + 1;
        self.components.insert(replica_id, next);
        next
    }

    /// True if no component has ever advanced.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Iterates `(replica_id, lsn)` pairs in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, Lsn)> + '_ {
        self.components.iter().map(|(&id, &lsn)| (id, lsn))
    }
}

/// Text form used in log file headers: `{1: 5, 2: 10}`.
impl fmt::Display for VClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (id, lsn)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", id, lsn)?;
        }
        write!(f, "}}")
    }
}

impl FromStr for VClock {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let inner = s
            .trim()
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| format!("vclock must be enclosed in braces: {s:?}"))?;
        let mut clock = VClock::new();
        for pair in inner.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (id, lsn) = pair
                .split_once(':')
                .ok_or_else(|| format!("bad vclock component: {pair:?}"))?;
            let id: ReplicaId = id
                .trim()
                .parse()
                .map_err(|_| format!("bad replica id: {id:?}"))?;
            let lsn: Lsn = lsn
                .trim()
                .parse()
                .map_err(|_| format!("bad lsn: {lsn:?}"))?;
            if clock.components.insert(id, lsn).is_some() {
                return Err(format!("duplicate replica id {id} in vclock"));
            }
        }
        Ok(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follow_advances() {
        let mut clock = VClock::new();
        clock.follow(1, 5).unwrap();
        clock.follow(2, 3).unwrap();
        assert_eq!(clock.get(1), 5);
        assert_eq!(clock.sum(), 8);
    }

    #[test]
    fn test_follow_rejects_rewind() {
        let mut clock = VClock::new();
        clock.follow(1, 5).unwrap();
        assert!(clock.follow(1, 5).is_err());
        assert!(clock.follow(1, 4).is_err());
        assert_eq!(clock.get(1), 5);
    }

    #[test]
    fn test_advance_allocates_sequentially() {
        let mut clock = VClock::new();
        assert_eq!(clock.advance(7), 1);
        assert_eq!(clock.advance(7), 2);
        assert_eq!(clock.advance(3), 1);
        assert_eq!(clock.sum(), 3);
    }

    #[test]
    fn test_text_round_trip() {
        let mut clock = VClock::new();
        clock.follow(1, 10).unwrap();
        clock.follow(5, 2).unwrap();
        let text = clock.to_string();
        assert_eq!(text, "{1: 10, 5: 2}");
        let parsed: VClock = text.parse().unwrap();
        assert_eq!(parsed, clock);
    }

    #[test]
    fn test_parse_empty() {
        let clock: VClock = "{}".parse().unwrap();
        assert!(clock.is_empty());
        assert_eq!(clock.sum(), 0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("1: 10".parse::<VClock>().is_err());
        assert!("{1}".parse::<VClock>().is_err());
        assert!("{1: x}".parse::<VClock>().is_err());
        assert!("{1: 1, 1: 2}".parse::<VClock>().is_err());
    }
}
