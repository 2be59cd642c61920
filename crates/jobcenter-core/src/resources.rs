//! Resource algebra shared by every capacity check.
//!
//! A [`ResourceAllocation`] is a `(cpu, memory, swap)` triple with
//! component-wise arithmetic. [`WorkMachineResources`] pairs a total with
//! the currently free share of a machine and guards the `0 <= free <= total`
//! invariant on every mutation.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// A `(cpu_threads, memory_mb, swap_mb)` triple.
///
/// Components are signed so that subtraction can express a deficit; a
/// negative component is what makes an allocation infeasible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub cpu_threads: i64,
    pub memory_mb: i64,
    pub swap_mb: i64,
}

impl ResourceAllocation {
    pub const fn new(cpu_threads: i64, memory_mb: i64, swap_mb: i64) -> Self {
        Self {
            cpu_threads,
            memory_mb,
            swap_mb,
        }
    }

    pub const fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    /// True iff any component is negative.
    pub fn is_negative(&self) -> bool {
        self.cpu_threads < 0 || self.memory_mb < 0 || self.swap_mb < 0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    /// True iff `self <= other` component-wise.
    pub fn fits_in(&self, other: &ResourceAllocation) -> bool {
        !(*other - *self).is_negative()
    }

    /// The cpu and memory part only, swap zeroed.
    pub fn compute_part(&self) -> Self {
        Self::new(self.cpu_threads, self.memory_mb, 0)
    }

    /// The swap part only, cpu and memory zeroed.
    pub fn swap_part(&self) -> Self {
        Self::new(0, 0, self.swap_mb)
    }
}

impl Add for ResourceAllocation {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.cpu_threads + rhs.cpu_threads,
            self.memory_mb + rhs.memory_mb,
            self.swap_mb + rhs.swap_mb,
        )
    }
}

impl Sub for ResourceAllocation {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(
            self.cpu_threads - rhs.cpu_threads,
            self.memory_mb - rhs.memory_mb,
            self.swap_mb - rhs.swap_mb,
        )
    }
}

impl AddAssign for ResourceAllocation {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl SubAssign for ResourceAllocation {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for ResourceAllocation {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), Add::add)
    }
}

impl fmt::Display for ResourceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} mem={}MB swap={}MB",
            self.cpu_threads, self.memory_mb, self.swap_mb
        )
    }
}

/// Total and free resources of a work machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMachineResources {
    pub total: ResourceAllocation,
    pub free: ResourceAllocation,
}

impl WorkMachineResources {
    /// A fully idle machine: `free == total`.
    pub fn new(total: ResourceAllocation) -> Self {
        Self { total, free: total }
    }

    /// Subtract `r` from `free` iff the result stays non-negative.
    ///
    /// With `test_only` the check is performed without mutating.
    pub fn allocate(&mut self, r: ResourceAllocation, test_only: bool) -> bool {
        let remaining = self.free - r;
        if remaining.is_negative() {
            return false;
        }
        if !test_only {
            self.free = remaining;
        }
        true
    }

    /// Add `r` back to `free` iff the result does not exceed `total`.
    pub fn deallocate(&mut self, r: ResourceAllocation) -> bool {
        let restored = self.free + r;
        if (self.total - restored).is_negative() {
            return false;
        }
        self.free = restored;
        true
    }

    /// Resources currently handed out.
    pub fn used(&self) -> ResourceAllocation {
        self.total - self.free
    }

    pub fn is_idle(&self) -> bool {
        self.free == self.total
    }
}
