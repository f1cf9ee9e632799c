//! Work units: the opaque, polymorphic value moved between stages.
//!
//! The original core dispatches on work units by virtual method and RTTI
//! (`dynamic_cast`) inside batch workers. Per the redesign flags this is
//! re-expressed as a trait object with a single required capability
//! (`current_size_in_bytes`) plus `std::any::Any` so a batch worker that
//! genuinely needs to recover the concrete type can downcast and fail
//! loudly on a mismatch, instead of silently misinterpreting memory.

use std::any::Any;
use std::fmt;

/// Anything that can flow through a [`crate::queue::WorkQueue`].
///
/// `current_size_in_bytes` is the one capability the runtime itself
/// depends on (for quota and allocator accounting); everything else about
/// the concrete type is the stage implementation's business.
pub trait WorkUnit: Any + Send + fmt::Debug {
    /// Size of this unit for byte-accounting purposes (quotas, the
    /// allocator's `availability`, caching-allocator buffer sizing).
    fn current_size_in_bytes(&self) -> u64;

    /// Upcast to `&dyn Any` so batch workers may `downcast_ref` when they
    /// need the concrete type. Implementations should simply return
    /// `self`.
    fn as_any(&self) -> &dyn Any;
}

/// A boxed, type-erased work unit.
pub type BoxedWorkUnit = Box<dyn WorkUnit>;

impl WorkUnit for BoxedWorkUnit {
    fn current_size_in_bytes(&self) -> u64 {
        (**self).current_size_in_bytes()
    }

    fn as_any(&self) -> &dyn Any {
        (**self).as_any()
    }
}

/// What travels on a [`crate::queue::WorkQueue`]: either a live unit, or
/// the distinguished end-of-stream marker.
///
/// Spec: "A distinguished *end-of-stream* marker (conceptually a null
/// work unit) is the only permitted sentinel on the queue." Representing
/// it as an enum variant rather than `Option<BoxedWorkUnit>` keeps the
/// queue's public API honest about the fact that `None` is never a
/// transport value in its own right.
#[derive(Debug)]
pub enum WorkItem<T> {
    /// A live work unit.
    Unit(T),
    /// No further work units will arrive on this edge.
    EndOfStream,
}

impl<T> WorkItem<T> {
    /// `true` for the end-of-stream marker.
    pub fn is_eos(&self) -> bool {
        matches!(self, WorkItem::EndOfStream)
    }

    /// Take the unit out, if this is not end-of-stream.
    pub fn into_unit(self) -> Option<T> {
        match self {
            WorkItem::Unit(u) => Some(u),
            WorkItem::EndOfStream => None,
        }
    }
}

/// Convenience implementation used throughout the test suite: a plain
/// byte-sized unit carrying an arbitrary payload and an optional partition
/// key (consulted by the partitioned queueing policy).
#[derive(Debug, Clone)]
pub struct SizedUnit<P> {
    /// Accounting size in bytes.
    pub size: u64,
    /// Partition attribute consulted by `PartitionedPolicy`.
    pub partition_key: u64,
    /// Arbitrary payload.
    pub payload: P,
}

impl<P> SizedUnit<P> {
    /// Construct a unit with no partitioning (hashes to bucket 0 under a
    /// partitioned policy if never overridden).
    pub fn new(size: u64, payload: P) -> Self {
        Self {
            size,
            partition_key: 0,
            payload,
        }
    }

    /// Construct a unit carrying an explicit partition key.
    pub fn with_partition(size: u64, partition_key: u64, payload: P) -> Self {
        Self {
            size,
            partition_key,
            payload,
        }
    }
}

impl<P: fmt::Debug + Send + 'static> WorkUnit for SizedUnit<P> {
    fn current_size_in_bytes(&self) -> u64 {
        self.size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eos_carries_no_unit() {
        let item: WorkItem<SizedUnit<i32>> = WorkItem::EndOfStream;
        assert!(item.is_eos());
        assert!(item.into_unit().is_none());
    }

    #[test]
    fn unit_reports_its_size() {
        let unit = SizedUnit::new(42, "payload");
        assert_eq!(unit.current_size_in_bytes(), 42);
        let item = WorkItem::Unit(unit);
        assert!(!item.is_eos());
        let recovered = item.into_unit().unwrap();
        assert_eq!(recovered.payload, "payload");
    }
}
