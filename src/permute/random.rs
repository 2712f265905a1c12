//! Per-instance randomization of the permutation sequence.
//!
//! A bare `ParallelIterator` is fully deterministic: two processes started
//! with the same range visit the same values in the same order, which is
//! observable from outside. `RandomizedIterator` breaks that by drawing two
//! offsets from the OS entropy source at construction: one shifts the range
//! the underlying permutation runs over, the other rotates the output back
//! into the caller's range. A modular rotation of a bijection is still a
//! bijection, so the visit-everything-once guarantee is unchanged.

use rand::rngs::OsRng;
use rand::RngCore;

use super::ParallelIterator;

/// A `ParallelIterator` whose sequence differs between instances.
#[derive(Debug)]
pub struct RandomizedIterator {
    inner: ParallelIterator,
    low: u128,
    size: u128,
    range_offset: u128,
    output_offset: u128,
}

impl RandomizedIterator {
    /// Creates a randomized iterator over `[low, low + size)` with fresh
    /// 32-bit offsets from the OS entropy source.
    pub fn new(low: u128, size: u128) -> Self {
        Self::with_offsets(low, size, OsRng.next_u32(), OsRng.next_u32())
    }

    pub(crate) fn with_offsets(low: u128, size: u128, range: u32, output: u32) -> Self {
        let range_offset = range as u128;
        let output_offset = output as u128;
        RandomizedIterator {
            inner: ParallelIterator::new(low + range_offset, size),
            low,
            size,
            range_offset,
            output_offset,
        }
    }

    /// Returns the next unique value in `[low, low + size)`, or `None`
    /// once every value has been produced.
    pub fn next(&self) -> Option<u128> {
        let shifted = self.inner.next()?;
        // Back to [0, size), then rotate by the output offset.
        let index = shifted - self.range_offset - self.low;
        Some(self.low + (index + self.output_offset) % self.size)
    }

    /// Returns the number of elements in the range.
    pub fn size(&self) -> u128 {
        self.size
    }

    /// Returns the offsets drawn at construction. Used to guarantee that a
    /// replacement iterator does not repeat the previous sequence.
    pub fn offsets(&self) -> (u32, u32) {
        (self.range_offset as u32, self.output_offset as u32)
    }
}
