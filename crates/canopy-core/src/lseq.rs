//! LSEQ positions for ordered siblings.
//!
//! A position is a sequence of small digits compared lexicographically, with
//! a prefix sorting before any of its extensions. Allocated positions never
//! end in a zero digit, so a new position between two of them always exists
//! and concurrent inserts at the same spot never need to renumber siblings.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Allocation base: every digit lies in `0..BASE`.
pub const BASE: u32 = 16;

/// Fractional position of an edge among its siblings.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(Vec<u32>);

impl Position {
    pub fn new(digits: Vec<u32>) -> Self {
        Position(digits)
    }

    /// The empty position, which sorts before every other position.
    pub fn empty() -> Self {
        Position(Vec::new())
    }

    /// Exclusive upper bound used when inserting at the end of a list.
    pub fn upper_bound() -> Self {
        Position(vec![BASE])
    }

    pub fn digits(&self) -> &[u32] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Allocate a position strictly between `left` and `right`.
    pub fn between(left: &Position, right: &Position) -> Position {
        Self::between_with_rng(left, right, &mut rand::thread_rng())
    }

    /// Allocate a position strictly between `left` and `right` using `rng`.
    ///
    /// Walks both positions digit by digit. At each depth the left digit
    /// defaults to 0 and the right digit to [`BASE`]; when the gap leaves
    /// room a random digit inside it ends the walk, otherwise the left digit
    /// is copied and the walk descends. If `left` does not sort before
    /// `right`, the right side is treated as unbounded. When `right` is
    /// `left` followed only by zeros nothing fits in between and `right`
    /// itself is returned.
    pub fn between_with_rng<R: Rng + ?Sized>(
        left: &Position,
        right: &Position,
        rng: &mut R,
    ) -> Position {
        let mut digits = Vec::with_capacity(left.depth().max(right.depth()) + 1);
        // Cleared once the copied prefix sorts strictly below `right`.
        let mut bounded = left < right;
        let mut depth = 0;

        loop {
            let l = left.0.get(depth).copied().unwrap_or(0);
            let r = match (bounded, right.0.get(depth)) {
                (true, Some(&r)) => r,
                (true, None) => return right.clone(),
                (false, _) => BASE,
            };

            if r > l && r - l > 1 {
                digits.push(rng.gen_range(l + 1..r));
                return Position(digits);
            }

            digits.push(l);
            if l < r {
                bounded = false;
            }
            depth += 1;
        }
    }

    /// `count` deterministic, strictly increasing positions spread evenly over
    /// the whole range.
    pub fn evenly_spaced(count: usize) -> Vec<Position> {
        if count == 0 {
            return Vec::new();
        }

        let mut depth = 1u32;
        while (BASE as u128).pow(depth) <= count as u128 {
            depth += 1;
        }
        let span = (BASE as u128).pow(depth);

        (1..=count as u128)
            .map(|i| {
                let mut value = i * span / (count as u128 + 1);
                let mut digits = vec![0u32; depth as usize];
                for slot in digits.iter_mut().rev() {
                    *slot = (value % BASE as u128) as u32;
                    value /= BASE as u128;
                }
                while digits.len() > 1 && digits.last() == Some(&0) {
                    digits.pop();
                }
                Position(digits)
            })
            .collect()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, digit) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", digit)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pos(digits: &[u32]) -> Position {
        Position::new(digits.to_vec())
    }

    #[test]
    fn test_prefix_sorts_first() {
        assert!(pos(&[3]) < pos(&[3, 1]));
        assert!(pos(&[3, 15]) < pos(&[4]));
        assert!(Position::empty() < pos(&[0]));
    }

    #[test]
    fn test_between_open_range() {
        let p = Position::between(&Position::empty(), &Position::upper_bound());
        assert_eq!(p.depth(), 1);
        assert!(p.digits()[0] >= 1 && p.digits()[0] < BASE);
    }

    #[test]
    fn test_between_adjacent_digits_descends() {
        let left = pos(&[3]);
        let right = pos(&[4]);
        let p = Position::between(&left, &right);
        assert_eq!(p.depth(), 2);
        assert_eq!(p.digits()[0], 3);
        assert!(left < p && p < right);
    }

    #[test]
    fn test_between_prefix_neighbours() {
        let left = pos(&[3]);
        let right = pos(&[3, 1]);
        let p = Position::between(&left, &right);
        assert!(left < p && p < right, "{} not between", p);
    }

    #[test]
    fn test_zero_padded_right_has_no_room() {
        let mut rng = StdRng::seed_from_u64(3);
        let left = pos(&[3]);
        let right = pos(&[3, 0]);
        assert_eq!(Position::between_with_rng(&left, &right, &mut rng), right);

        let right = pos(&[3, 0, 5]);
        let mid = Position::between_with_rng(&left, &right, &mut rng);
        assert!(left < mid && mid < right, "{mid:?}");
    }

    #[test]
    fn test_repeated_append_stays_ordered() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut last = Position::empty();
        for _ in 0..200 {
            let next = Position::between_with_rng(&last, &Position::upper_bound(), &mut rng);
            assert!(next > last);
            assert!(next < Position::upper_bound());
            last = next;
        }
    }

    #[test]
    fn test_same_seed_same_position() {
        let left = pos(&[2, 5]);
        let right = pos(&[9]);
        let a = Position::between_with_rng(&left, &right, &mut StdRng::seed_from_u64(42));
        let b = Position::between_with_rng(&left, &right, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_inverted_bounds_allocate_after_left() {
        let p = Position::between(&pos(&[9]), &pos(&[2]));
        assert!(p > pos(&[9]));
    }

    #[test]
    fn test_evenly_spaced() {
        assert_eq!(Position::evenly_spaced(2), vec![pos(&[5]), pos(&[10])]);

        let many = Position::evenly_spaced(40);
        assert_eq!(many.len(), 40);
        for pair in many.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(many.iter().all(|p| p.digits().last() != Some(&0)));
    }

    #[test]
    fn test_serializes_as_digit_array() {
        let json = serde_json::to_string(&pos(&[1, 2, 3])).unwrap();
        assert_eq!(json, "[1,2,3]");
    }
}
