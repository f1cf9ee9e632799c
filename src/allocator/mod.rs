//! Priority-aware memory allocator: the runtime's single most contended
//! shared resource (spec §4.4).

pub mod deadlock;
pub mod memory_allocator;
pub mod priority;
pub mod request;

pub use deadlock::{AbortingDeadlockResolver, DeadlockResolver, DiskBackedResolver, MemoryRegion};
pub use memory_allocator::MemoryAllocator;
pub use priority::{AllocatorPolicy, DefaultAllocatorPolicy};
pub use request::{AllocationRequest, CallerId, CallerRecord, RequestId};
