//! Slot and Bus Bitsets
//!
//! ## Overview
//!
//! Two actors touch the group's masks: the main flow (trigger, configure,
//! readout) and interrupt handlers (per-slot completion, per-bus I/O
//! completion). [`BitMask`] is the plain value type both sides compute with;
//! [`AtomicMask`] is the shared storage they mutate.
//!
//! ```text
//! bit:    31 ...  5   4   3   2   1   0
//! slot:              ┌───┬───┬───┬───┬───┐
//! active             │ 0 │ 1 │ 0 │ 1 │ 1 │   slots 0, 1, 3
//! ready              │ 0 │ 1 │ 0 │ 0 │ 1 │   waiting on slot 1
//!                    └───┴───┴───┴───┴───┘
//! ```
//!
//! ## Completion Detection
//!
//! [`AtomicMask::set_and_check`] folds "set my bit" and "is the set now
//! complete" into one compare-and-set loop. When the new value covers the
//! target the mask is swapped to its cleared state in the same CAS, so
//! exactly one caller observes [`Completion::Complete`] no matter how many
//! interrupts race.
//!
//! ## Memory Ordering
//!
//! - **Acquire** on loads that gate completion
//! - **AcqRel** on the CAS that publishes completion
//! - Plain stores from the main flow use **Release**

use core::sync::atomic::{AtomicU32, Ordering};

/// Bitset over up to 32 indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct BitMask(u32);

/// Mask over slot indices
pub type SlotMask = BitMask;

/// Mask over bus indices
pub type BusMask = BitMask;

impl BitMask {
    /// No bits set
    pub const EMPTY: Self = Self(0);

    /// Wrap raw bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Mask with only `index` set, empty when out of range
    pub const fn bit(index: u8) -> Self {
        if index < 32 {
            Self(1 << index)
        } else {
            Self(0)
        }
    }

    /// Mask with indices `0..count` set
    pub const fn first(count: usize) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else {
            Self((1u32 << count) - 1)
        }
    }

    /// Raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// True when no bit is set
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Check a single index
    pub const fn contains(&self, index: u8) -> bool {
        index < 32 && (self.0 & (1 << index)) != 0
    }

    /// True when every bit of `self` is also in `other`
    pub const fn is_subset_of(&self, other: Self) -> bool {
        (self.0 & !other.0) == 0
    }

    /// Number of set bits
    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Copy with `index` set
    #[must_use]
    pub const fn with(self, index: u8) -> Self {
        Self(self.0 | Self::bit(index).0)
    }

    /// Copy with `index` cleared
    #[must_use]
    pub const fn without(self, index: u8) -> Self {
        Self(self.0 & !Self::bit(index).0)
    }

    /// Set `index`
    pub fn insert(&mut self, index: u8) {
        self.0 |= Self::bit(index).0;
    }

    /// Clear `index`
    pub fn remove(&mut self, index: u8) {
        self.0 &= !Self::bit(index).0;
    }

    /// Lowest set index
    pub const fn lowest(&self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }

    /// Iterate set indices from lowest to highest
    pub fn iter(&self) -> Iter {
        Iter { remaining: self.0 }
    }
}

impl core::ops::BitOr for BitMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for BitMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for BitMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl core::ops::Sub for BitMask {
    type Output = Self;

    /// Set difference
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl IntoIterator for BitMask {
    type Item = u8;
    type IntoIter = Iter;

    fn into_iter(self) -> Iter {
        self.iter()
    }
}

impl core::fmt::Binary for BitMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Binary::fmt(&self.0, f)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BitMask {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=u32:b}", self.0)
    }
}

/// Iterator over set indices of a [`BitMask`]
#[derive(Debug, Clone)]
pub struct Iter {
    remaining: u32,
}

impl Iterator for Iter {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.remaining.trailing_zeros();
        self.remaining &= self.remaining - 1;
        Some(index as u8)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.count_ones() as usize;
        (n, Some(n))
    }
}

/// Result of [`AtomicMask::set_and_check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Bit recorded, target not yet covered. Carries the current mask.
    Pending(BitMask),
    /// This call completed the target and the mask was cleared
    Complete,
    /// Bit was outside the target and nothing changed
    Outside,
}

/// Interrupt-safe bitset
///
/// Safe to share between an interrupt handler and the main flow. All
/// read-modify-write operations are single atomic instructions or CAS loops.
#[derive(Debug)]
pub struct AtomicMask {
    bits: AtomicU32,
}

impl AtomicMask {
    /// Empty mask, usable in statics
    pub const fn new() -> Self {
        Self { bits: AtomicU32::new(0) }
    }

    /// Current value
    pub fn load(&self) -> BitMask {
        BitMask(self.bits.load(Ordering::Acquire))
    }

    /// Replace the value
    pub fn store(&self, mask: BitMask) {
        self.bits.store(mask.0, Ordering::Release);
    }

    /// Set `index`, returning the previous value
    pub fn set(&self, index: u8) -> BitMask {
        BitMask(self.bits.fetch_or(BitMask::bit(index).0, Ordering::AcqRel))
    }

    /// Swap in `new` if the value is still `current`
    pub fn compare_and_set(&self, current: BitMask, new: BitMask) -> Result<BitMask, BitMask> {
        self.bits
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(BitMask)
            .map_err(BitMask)
    }

    /// Set `index` and detect completion of `target`
    ///
    /// When the mask covers `target` after setting the bit, `target` is
    /// cleared from the mask in the same CAS and [`Completion::Complete`] is
    /// returned. Repeat bits and bits outside `target` never complete.
    /// An empty target never completes here.
    pub fn set_and_check(&self, index: u8, target: BitMask) -> Completion {
        let bit = BitMask::bit(index);
        if target.is_empty() || (bit & target).is_empty() {
            return Completion::Outside;
        }

        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let next = current | bit.0;
            let covered = (next & target.0) == target.0;
            let stored = if covered { next & !target.0 } else { next };

            if next == current && !covered {
                // Bit already set, nothing to publish.
                return Completion::Pending(BitMask(current));
            }

            match self.bits.compare_exchange_weak(
                current,
                stored,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if covered => return Completion::Complete,
                Ok(_) => return Completion::Pending(BitMask(stored)),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicMask {
    fn default() -> Self {
        Self::new()
    }
}
