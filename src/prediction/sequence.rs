//! Wrapping sequence ids
//!
//! Ids wrap at `u32::MAX`, so ordering is defined by forward distance: `a`
//! is newer than `b` when stepping forward from `b` reaches `a` in less than
//! half the id space.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub u32);

impl SequenceId {
    pub const HALF: u32 = 1 << 31;

    /// One before zero. Used as "nothing acknowledged yet".
    pub const NONE: Self = Self(u32::MAX);

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Steps forward from `reference` to `self`
    pub fn distance_from(self, reference: Self) -> u32 {
        self.0.wrapping_sub(reference.0)
    }

    pub fn is_newer_than(self, other: Self) -> bool {
        self != other && self.distance_from(other) < Self::HALF
    }
}

impl From<u32> for SequenceId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<SequenceId> for u32 {
    fn from(id: SequenceId) -> Self {
        id.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// True if `candidate` lies in `(reference, current]` going forward.
///
/// `current` is the newest id issued locally, so anything past it cannot be
/// a genuine acknowledgment and anything at or behind `reference` is stale.
pub fn is_more_recent(candidate: SequenceId, reference: SequenceId, current: SequenceId) -> bool {
    let window = current.distance_from(reference);
    candidate.is_newer_than(reference)
        && window < SequenceId::HALF
        && candidate.distance_from(reference) <= window
}

/// Issues consecutive sequence ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceCounter {
    current: SequenceId,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(current: SequenceId) -> Self {
        Self { current }
    }

    /// Last issued id, 0 before the first call to [`advance`](Self::advance)
    pub fn current(&self) -> SequenceId {
        self.current
    }

    pub fn advance(&mut self) -> SequenceId {
        self.current = self.current.next();
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u32) -> SequenceId {
        SequenceId(v)
    }

    #[test]
    fn test_newer_than_across_wrap() {
        assert!(id(0).is_newer_than(id(u32::MAX)));
        assert!(id(5).is_newer_than(id(u32::MAX - 5)));
        assert!(!id(u32::MAX).is_newer_than(id(0)));
        assert!(!id(7).is_newer_than(id(7)));
        assert!(!id(SequenceId::HALF).is_newer_than(id(0)));
        assert!(id(SequenceId::HALF - 1).is_newer_than(id(0)));
    }

    #[test]
    fn test_more_recent_is_bounded_by_current() {
        assert!(is_more_recent(id(3), id(1), id(5)));
        assert!(is_more_recent(id(5), id(1), id(5)));
        assert!(!is_more_recent(id(6), id(1), id(5)));
        assert!(!is_more_recent(id(1), id(1), id(5)));
        assert!(!is_more_recent(id(0), id(1), id(5)));
    }

    #[test]
    fn test_more_recent_near_max() {
        let reference = id(u32::MAX - 1);
        let current = id(2);
        assert!(is_more_recent(id(u32::MAX), reference, current));
        assert!(is_more_recent(id(0), reference, current));
        assert!(is_more_recent(id(2), reference, current));
        assert!(!is_more_recent(id(3), reference, current));
        assert!(!is_more_recent(id(u32::MAX - 2), reference, current));
    }

    #[test]
    fn test_more_recent_matches_shorter_forward_distance() {
        // Sweep a window straddling the wrap point and compare against the
        // plain "forward distance within (0, current]" definition in u64.
        let base = u32::MAX - 8;
        for r in 0..16u32 {
            for c in 0..16u32 {
                for k in 0..16u32 {
                    let reference = id(base.wrapping_add(r));
                    let current = id(base.wrapping_add(c));
                    let candidate = id(base.wrapping_add(k));

                    let expected = k > r && k <= c;
                    assert_eq!(
                        is_more_recent(candidate, reference, current),
                        expected,
                        "candidate {candidate} reference {reference} current {current}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_counter_wraps() {
        let mut counter = SequenceCounter::starting_at(id(u32::MAX - 1));
        assert_eq!(counter.advance(), id(u32::MAX));
        assert_eq!(counter.advance(), id(0));
        assert_eq!(counter.current(), id(0));
    }

    #[test]
    fn test_none_precedes_first_id() {
        assert!(is_more_recent(id(0), SequenceId::NONE, id(0)));
        assert!(SequenceId::NONE.next() == id(0));
    }
}
