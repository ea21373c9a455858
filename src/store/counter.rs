//! Shared Counter Module
//!
//! Budget counters shared by every table of one partition.

use std::sync::atomic::{AtomicI64, Ordering};

// == Shared Counter ==
/// A bounded counter (element count or byte size) shared by sibling tables.
///
/// A non-positive maximum means the budget is unlimited. Updates from different
/// tables are not coordinated: everything sharing one counter must be driven
/// from a single exclusion domain, typically the thread owning the partition.
#[derive(Debug)]
pub struct SharedCounter {
    counter: AtomicI64,
    max_value: i64,
}

impl SharedCounter {
    /// Creates a counter at zero with the given maximum.
    pub fn new(max_value: i64) -> Self {
        Self {
            counter: AtomicI64::new(0),
            max_value,
        }
    }

    /// Creates a counter that never reports being over budget.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn value(&self) -> i64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn max_value(&self) -> i64 {
        self.max_value
    }

    /// True iff the maximum is non-positive.
    pub fn is_unlimited_size(&self) -> bool {
        self.max_value <= 0
    }

    /// True when a limit is set and the counter is above it.
    pub fn is_over_limit(&self) -> bool {
        !self.is_unlimited_size() && self.value() > self.max_value
    }

    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    pub fn decrement(&self) -> i64 {
        self.subtract(1)
    }

    /// Adds `delta` and returns the new value.
    pub fn add(&self, delta: i64) -> i64 {
        self.counter.fetch_add(delta, Ordering::Relaxed) + delta
    }

    /// Subtracts `delta` and returns the new value.
    pub fn subtract(&self, delta: i64) -> i64 {
        self.counter.fetch_sub(delta, Ordering::Relaxed) - delta
    }
}
