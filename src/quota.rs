//! Memory quota: a blocking byte counter bounding bytes in flight between
//! one upstream stage and one downstream stage. Distinct from the central
//! [`crate::allocator::MemoryAllocator`] — a quota gives back-pressure
//! between exactly two stages without coupling it to total process
//! memory usage (spec §4.3).

use std::sync::{Condvar, Mutex};

use crate::error::{Result, ThemisError};

struct Inner {
    in_flight: u64,
}

/// `{ name, budget, in_flight, condition_variable }` from spec §3.
pub struct MemoryQuota {
    name: String,
    budget: u64,
    inner: Mutex<Inner>,
    drained: Condvar,
}

impl MemoryQuota {
    /// Create a quota bounding `budget` bytes in flight.
    pub fn new(name: impl Into<String>, budget: u64) -> Self {
        Self {
            name: name.into(),
            budget,
            inner: Mutex::new(Inner { in_flight: 0 }),
            drained: Condvar::new(),
        }
    }

    /// Quota name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured byte budget.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Bytes currently charged against the budget.
    pub fn in_flight(&self) -> u64 {
        self.inner.lock().unwrap().in_flight
    }

    /// Block while `in_flight + bytes > budget`, then charge `bytes`.
    pub fn add_usage(&self, bytes: u64) {
        let mut guard = self.inner.lock().unwrap();
        while guard.in_flight + bytes > self.budget {
            guard = self.drained.wait(guard).unwrap();
        }
        guard.in_flight += bytes;
    }

    /// Credit `bytes` back and wake any producer waiting for room.
    ///
    /// Fatal (per spec §4.3, "indicates accounting corruption") if
    /// `bytes > in_flight`; this is surfaced as
    /// [`ThemisError::QuotaUnderflow`] rather than panicking directly so
    /// tests can observe the violation.
    pub fn remove_usage(&self, bytes: u64) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if bytes > guard.in_flight {
            return Err(ThemisError::QuotaUnderflow {
                name: self.name.clone(),
                in_flight: guard.in_flight,
                bytes,
            });
        }
        guard.in_flight -= bytes;
        drop(guard);
        self.drained.notify_all();
        Ok(())
    }

    /// Assert the invariant `in_flight == 0` that must hold at
    /// destruction (spec §8, invariant 3). Call this explicitly before
    /// dropping a quota whose lifetime the caller controls; `Drop` itself
    /// cannot return a `Result`, so this is the inspectable half of that
    /// check and `Drop` below escalates to an abort as a last resort.
    pub fn assert_drained(&self) -> Result<()> {
        let in_flight = self.in_flight();
        if in_flight != 0 {
            return Err(ThemisError::QuotaNotDrained {
                name: self.name.clone(),
                in_flight,
            });
        }
        Ok(())
    }
}

impl Drop for MemoryQuota {
    fn drop(&mut self) {
        let in_flight = self.inner.get_mut().unwrap().in_flight;
        if in_flight != 0 {
            tracing::error!(
                quota = %self.name,
                in_flight,
                "memory quota destroyed while bytes were still in flight"
            );
            ThemisError::QuotaNotDrained {
                name: self.name.clone(),
                in_flight,
            }
            .abort();
        }
    }
}

#[cfg(test)]
#[path = "quota.test.rs"]
mod tests;
