//! Crate-wide error type.
//!
//! The runtime distinguishes two severities (spec section "Error Handling
//! Design"): invariant violations and corruption (`FatalInvariant`), and
//! OS-level failures the component cannot mask (`RuntimeFailure`). Neither
//! is meant to be "handled" by a caller in the usual sense — the core has
//! no recovery path for either — but returning a typed `Result` keeps the
//! failure observable in tests instead of unwinding immediately. Production
//! call sites inside the runtime call [`ThemisError::abort`] at the
//! boundary where the original aborts the process.

use thiserror::Error;

/// Errors raised by the pipeline runtime core.
#[derive(Debug, Error)]
pub enum ThemisError {
    /// `WorkQueue::enqueue` called after `close()`.
    #[error("enqueue on closed queue {queue}")]
    ClosedQueue {
        /// Name of the queue (stage/worker id), for diagnostics.
        queue: String,
    },

    /// `MemoryQuota::remove_usage` asked to credit more than is in flight.
    #[error("quota {name} over-credited: in_flight={in_flight} bytes={bytes}")]
    QuotaUnderflow {
        /// Quota name.
        name: String,
        /// Bytes currently in flight.
        in_flight: u64,
        /// Bytes the caller tried to remove.
        bytes: u64,
    },

    /// `MemoryQuota` destroyed with `in_flight != 0`.
    #[error("quota {name} destroyed with in_flight={in_flight} != 0")]
    QuotaNotDrained {
        /// Quota name.
        name: String,
        /// Bytes still in flight.
        in_flight: u64,
    },

    /// `Tracker::add_downstream_named` called twice with the same name.
    #[error("duplicate downstream name {name:?} on tracker {tracker}")]
    DuplicateDownstreamName {
        /// Owning tracker's stage name.
        tracker: String,
        /// The colliding name.
        name: String,
    },

    /// `Worker::emit` (or `emit_named`) referenced a downstream name the
    /// tracker never registered.
    #[error("emit to unknown downstream {name:?} from tracker {tracker}")]
    UnknownDownstream {
        /// Owning tracker's stage name.
        tracker: String,
        /// The unknown name.
        name: String,
    },

    /// `Tracker::add_work` called after the queueing policy was closed.
    #[error("add_work on closed tracker {tracker}")]
    TrackerClosed {
        /// The tracker's stage name.
        tracker: String,
    },

    /// `MemoryAllocator::allocate` request larger than `capacity`.
    #[error("allocation request of {requested} bytes exceeds capacity {capacity}")]
    RequestExceedsCapacity {
        /// Bytes requested.
        requested: u64,
        /// Allocator's total capacity.
        capacity: u64,
    },

    /// `MemoryAllocator::deallocate` given a pointer with no metadata.
    #[error("deallocate of unknown allocation id {id}")]
    UnknownAllocation {
        /// Opaque allocation id.
        id: u64,
    },

    /// The priority policy asked to remove a request that was not the
    /// head of its group's high-priority FIFO.
    #[error("policy removed request out of order for group {group}")]
    OutOfOrderRemoval {
        /// Stage group name.
        group: String,
    },

    /// A `WakePolicy` match fell through to a variant the implementer
    /// forgot to wire up. Kept as a named error instead of `unreachable!()`
    /// so the abort path still goes through the diagnostic machinery.
    #[error("unreachable wake policy variant: {0}")]
    UnreachableWakePolicy(String),

    /// Disk-backed deadlock resolver hit an OS failure (create, fallocate,
    /// mmap, munmap, unlink).
    #[error("disk resolver I/O failure: {0}")]
    ResolverIo(#[from] std::io::Error),

    /// Configuration failed to parse or a required key was missing.
    #[error("configuration error: {0}")]
    Config(String),

    /// The DAG supplied to a `TrackerSet` contains a cycle.
    #[error("tracker DAG is not acyclic (cycle through {stage})")]
    CyclicDag {
        /// A stage name on the discovered cycle.
        stage: String,
    },

    /// `WorkerFactory::construct` asked for an `(application, worker_type,
    /// implementation)` triple nothing was ever registered under.
    #[error("no worker implementation registered for {application}/{worker_type}/{implementation}")]
    UnknownWorkerImplementation {
        /// Application/phase name.
        application: String,
        /// Worker type (stage) name.
        worker_type: String,
        /// Requested implementation key.
        implementation: String,
    },
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, ThemisError>;

impl ThemisError {
    /// Log the diagnostic and abort the process.
    ///
    /// Every error this crate defines is, per the design, a correctness
    /// violation of the runtime's own invariants rather than a condition a
    /// caller can usefully recover from. Library internals call this at the
    /// point where the original C++ core calls `abort()`; tests instead
    /// inspect the `Result` directly and never reach this path.
    pub fn abort(self) -> ! {
        tracing::error!(error = %self, "themis-core: fatal invariant violation, aborting");
        std::process::abort()
    }
}
