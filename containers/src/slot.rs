use chain::SLOTS_PER_EPOCH;
use serde::{Deserialize, Serialize};
use ssz_derive::Ssz;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Ssz, Default, Serialize, Deserialize)]
#[ssz(transparent)]
pub struct Slot(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Slot {
    /// Epoch containing this slot.
    pub fn epoch(self) -> Epoch {
        Epoch(self.0 / SLOTS_PER_EPOCH)
    }

    pub fn saturating_sub(self, rhs: u64) -> Slot {
        Slot(self.0.saturating_sub(rhs))
    }

    /// Number of slots from `other` up to `self`, zero if `other` is ahead.
    pub fn distance_from(self, other: Slot) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Epoch {
    /// First slot of this epoch.
    pub fn start_slot(self) -> Slot {
        Slot(self.0.saturating_mul(SLOTS_PER_EPOCH))
    }

    pub fn saturating_sub(self, rhs: u64) -> Epoch {
        Epoch(self.0.saturating_sub(rhs))
    }
}

impl Add<u64> for Slot {
    type Output = Slot;

    fn add(self, rhs: u64) -> Slot {
        Slot(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for Slot {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs);
    }
}

impl Sub<u64> for Slot {
    type Output = Slot;

    fn sub(self, rhs: u64) -> Slot {
        self.saturating_sub(rhs)
    }
}

impl Add<u64> for Epoch {
    type Output = Epoch;

    fn add(self, rhs: u64) -> Epoch {
        Epoch(self.0.saturating_add(rhs))
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(31, 0)]
    #[case(32, 1)]
    #[case(320, 10)]
    #[case(57_256, 1_789)]
    fn test_slot_epoch(#[case] slot: u64, #[case] epoch: u64) {
        assert_eq!(Slot(slot).epoch(), Epoch(epoch));
    }

    #[test]
    fn test_epoch_start_slot() {
        assert_eq!(Epoch(0).start_slot(), Slot(0));
        assert_eq!(Epoch(8).start_slot(), Slot(256));
        assert_eq!(Epoch(u64::MAX).start_slot(), Slot(u64::MAX));
    }

    #[test]
    fn test_slot_arithmetic_saturates() {
        assert_eq!(Slot(5) - 10, Slot(0));
        assert_eq!(Slot(u64::MAX) + 1, Slot(u64::MAX));
        assert_eq!(Slot(10).distance_from(Slot(4)), 6);
        assert_eq!(Slot(4).distance_from(Slot(10)), 0);
    }
}
