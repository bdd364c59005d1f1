//! Deterministic conflict resolution between two writes.
//!
//! Every state-changing tree operation builds the clock it would install and
//! asks [`resolve`] whether that clock beats the one already in place. The
//! rule depends only on the two clocks and owners, never on which side
//! initiated the merge, so replicas resolving in opposite directions agree.

use crate::clock::{ClockOrdering, ReplicaId, VectorClock};

/// How Equal/Concurrent clocks are settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveMode {
    /// Scalar semantics: last writer by version wins, lower replica id on ties.
    Overwrite,
    /// Collection semantics: both writes survive and the clocks are merged.
    Append,
}

/// Winning clock and owner of a resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub clock: VectorClock,
    /// `None` when append mode kept both writes; callers keep their current owner.
    pub owner: Option<ReplicaId>,
}

impl Resolution {
    fn winner(clock: &VectorClock, owner: &ReplicaId) -> Self {
        Resolution {
            clock: clock.clone(),
            owner: Some(owner.clone()),
        }
    }

    /// True when the resolution installed exactly `clock` owned by `owner`.
    pub fn is_won_by(&self, clock: &VectorClock, owner: &ReplicaId) -> bool {
        self.owner.as_ref() == Some(owner) && &self.clock == clock
    }
}

/// Pick the winner between the state `(a, owner_a)` and `(b, owner_b)`.
pub fn resolve(
    a: &VectorClock,
    b: &VectorClock,
    owner_a: &ReplicaId,
    owner_b: &ReplicaId,
    mode: ResolveMode,
) -> Resolution {
    match a.compare(b) {
        ClockOrdering::Dominates => Resolution::winner(a, owner_a),
        ClockOrdering::IsDominated => Resolution::winner(b, owner_b),
        ordering => {
            if mode == ResolveMode::Append {
                tracing::trace!(?ordering, "append mode keeps both writes");
                return Resolution {
                    clock: a.merged_with(b),
                    owner: None,
                };
            }

            let version_a = a.get(owner_a.as_str());
            let version_b = b.get(owner_b.as_str());
            if version_a > version_b || (version_a == version_b && owner_a < owner_b) {
                Resolution::winner(a, owner_a)
            } else {
                Resolution::winner(b, owner_b)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> ReplicaId {
        ReplicaId::from(s)
    }

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(entries.iter().map(|(r, v)| (rid(r), *v)))
    }

    #[test]
    fn test_dominating_clock_wins() {
        let a = clock(&[("x", 2)]);
        let b = clock(&[("x", 1)]);
        let res = resolve(&a, &b, &rid("x"), &rid("y"), ResolveMode::Overwrite);
        assert!(res.is_won_by(&a, &rid("x")));

        let res = resolve(&b, &a, &rid("y"), &rid("x"), ResolveMode::Append);
        assert!(res.is_won_by(&a, &rid("x")));
    }

    #[test]
    fn test_concurrent_higher_version_wins() {
        let a = clock(&[("x", 2)]);
        let b = clock(&[("y", 3)]);
        let res = resolve(&a, &b, &rid("x"), &rid("y"), ResolveMode::Overwrite);
        assert!(res.is_won_by(&b, &rid("y")));
        let res = resolve(&b, &a, &rid("y"), &rid("x"), ResolveMode::Overwrite);
        assert!(res.is_won_by(&b, &rid("y")));
    }

    #[test]
    fn test_equal_versions_lower_replica_wins() {
        let a = clock(&[("x", 2)]);
        let b = clock(&[("y", 2)]);
        let res = resolve(&a, &b, &rid("x"), &rid("y"), ResolveMode::Overwrite);
        assert!(res.is_won_by(&a, &rid("x")));
        let res = resolve(&b, &a, &rid("y"), &rid("x"), ResolveMode::Overwrite);
        assert!(res.is_won_by(&a, &rid("x")));
    }

    #[test]
    fn test_equal_clocks_overwrite() {
        let a = clock(&[("x", 1)]);
        let res = resolve(&a, &a.clone(), &rid("x"), &rid("x"), ResolveMode::Overwrite);
        assert!(res.is_won_by(&a, &rid("x")));
    }

    #[test]
    fn test_append_merges_without_owner() {
        let a = clock(&[("x", 1)]);
        let b = clock(&[("y", 1)]);
        let res = resolve(&a, &b, &rid("x"), &rid("y"), ResolveMode::Append);
        assert_eq!(res.owner, None);
        assert_eq!(res.clock, clock(&[("x", 1), ("y", 1)]));
    }
}
