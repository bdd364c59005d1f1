//! Replica identifiers and vector clocks.
//!
//! A vector clock tracks, per replica, the highest version that replica has
//! written to a piece of state. Missing entries read as zero, so two clocks
//! can always be compared over the union of their keys.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque identifier of a writer.
///
/// Ordering is plain byte order of the underlying string; it is used as the
/// final tie-breaker whenever two writes are otherwise indistinguishable.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns whichever of the two ids sorts first.
    pub fn lowest<'a>(a: &'a ReplicaId, b: &'a ReplicaId) -> &'a ReplicaId {
        if b < a {
            b
        } else {
            a
        }
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ReplicaId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        ReplicaId(s.to_string())
    }
}

impl From<String> for ReplicaId {
    fn from(s: String) -> Self {
        ReplicaId(s)
    }
}

/// Outcome of comparing two vector clocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockOrdering {
    Equal,
    /// Every entry of the left clock is >= the right one, at least one is >.
    Dominates,
    /// Every entry of the left clock is <= the right one, at least one is <.
    IsDominated,
    Concurrent,
}

/// Per-replica version counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        VectorClock {
            entries: BTreeMap::new(),
        }
    }

    /// Create a clock holding a single entry.
    pub fn single(replica: ReplicaId, version: u64) -> Self {
        let mut clock = VectorClock::new();
        clock.set(replica, version);
        clock
    }

    /// Create a clock from entries.
    pub fn from_entries(entries: impl IntoIterator<Item = (ReplicaId, u64)>) -> Self {
        VectorClock {
            entries: entries.into_iter().collect(),
        }
    }

    /// Version recorded for a replica, zero when absent.
    pub fn get(&self, replica: &str) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// Set the version for a replica.
    pub fn set(&mut self, replica: ReplicaId, version: u64) {
        self.entries.insert(replica, version);
    }

    /// Increment the version for a replica, returning the new value.
    pub fn increment(&mut self, replica: &ReplicaId) -> u64 {
        let entry = self.entries.entry(replica.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Highest version across all replicas.
    pub fn max_version(&self) -> u64 {
        self.entries.values().copied().max().unwrap_or(0)
    }

    /// Compare two clocks over the union of their keys.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut greater = false;
        let mut less = false;

        for (replica, &version) in &self.entries {
            let theirs = other.get(replica.as_str());
            if version > theirs {
                greater = true;
            } else if version < theirs {
                less = true;
            }
        }
        for (replica, &version) in &other.entries {
            if !self.entries.contains_key(replica) && version > 0 {
                less = true;
            }
        }

        match (greater, less) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Dominates,
            (false, true) => ClockOrdering::IsDominated,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when `self` strictly dominates `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Dominates
    }

    /// Merge with another clock (component-wise max).
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &version) in &other.entries {
            let current = self.entries.entry(replica.clone()).or_insert(0);
            *current = (*current).max(version);
        }
    }

    /// Create a merged clock without modifying self.
    pub fn merged_with(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Iterate over all entries in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (replica, version)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", replica, version)?;
        }
        write!(f, "}}")
    }
}
