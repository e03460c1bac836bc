//! Cyclic id allocation.
//!
//! [`IdAllocator`] hands out integer ids from an inclusive range, starting
//! at the minimum and moving forward, wrapping back to the minimum after the
//! maximum. It does not remember which ids are in use: the caller supplies a
//! predicate on every allocation and the allocator skips ids the predicate
//! reports as taken.

use thiserror::Error;

/// Errors reported by [`IdAllocator`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("min must be less than max (min {min}, max {max})")]
    MinGreaterThanMax { min: u64, max: u64 },

    #[error("max is too big ({max})")]
    MaxTooBig { max: u64 },

    #[error("all ids allocated")]
    AllAllocated,
}

/// Allocates ids from `[min, max]` in cyclic order.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    min: u32,
    max: u32,
    next: u32,
}

impl IdAllocator {
    /// Creates an allocator over the inclusive range `[min, max]`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::MinGreaterThanMax`] if `min > max` and
    /// [`AllocError::MaxTooBig`] if `max` does not fit in 32 bits.
    pub fn new(min: u64, max: u64) -> Result<Self, AllocError> {
        if min > max {
            return Err(AllocError::MinGreaterThanMax { min, max });
        }
        let max = u32::try_from(max).map_err(|_| AllocError::MaxTooBig { max })?;
        // min <= max, so min fits as well
        let min = min as u32;

        Ok(Self { min, max, next: min })
    }

    /// Builds an allocator for a range fixed at compile time. Used in `const`
    /// items, where a bad range fails the build instead of panicking.
    pub const fn new_const(min: u32, max: u32) -> Self {
        assert!(min <= max, "min must be less than max");
        Self { min, max, next: min }
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Returns the next id for which `is_allocated` returns `false`.
    ///
    /// The search starts where the previous allocation left off and probes
    /// each candidate exactly once. If every id in the range is taken after
    /// a full cycle, [`AllocError::AllAllocated`] is returned and the cursor
    /// is left where it started.
    pub fn alloc(&mut self, mut is_allocated: impl FnMut(u32) -> bool) -> Result<u32, AllocError> {
        let start = self.next;
        loop {
            let candidate = self.next;
            self.next = if candidate == self.max {
                self.min
            } else {
                candidate + 1
            };

            if !is_allocated(candidate) {
                return Ok(candidate);
            }

            if self.next == start {
                return Err(AllocError::AllAllocated);
            }
        }
    }
}
