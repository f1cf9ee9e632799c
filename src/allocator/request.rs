//! Allocation request and caller bookkeeping (spec §3, §4.4.1).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar};

/// Opaque identity for a registered caller (typically a worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(pub u64);

/// Opaque identity for one in-flight allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

fn next_id(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

static REQUEST_IDS: AtomicU64 = AtomicU64::new(1);
static CALLER_IDS: AtomicU64 = AtomicU64::new(1);
static TIMESTAMPS: AtomicU64 = AtomicU64::new(1);

/// A logical clock for request timestamps. The original uses wall-clock
/// time; a monotonic counter gives the same total order deterministically
/// and is what the priority policy's FIFO-within-group and
/// oldest-timestamp-wins rules actually depend on (spec never requires
/// wall-clock granularity, only a stable arrival order).
pub fn next_timestamp() -> u64 {
    next_id(&TIMESTAMPS)
}

/// `{ caller_id, requested_size, timestamp, fail_if_not_immediate, [out]
/// pointer, [out] resolved_by_deadlock_escape }` from spec §3.
#[derive(Debug)]
pub struct AllocationRequest {
    /// Unique id for this request.
    pub id: RequestId,
    /// Which registered caller issued this request.
    pub caller_id: CallerId,
    /// Stage group this request belongs to (caller's group name).
    pub group: String,
    /// Candidate sizes. Current policy (spec §4.4.1, open question):
    /// serviced with the largest size in the list.
    pub sizes: Vec<u64>,
    /// Assigned at construction; never rewritten.
    pub timestamp: u64,
    /// If true, caller wants an immediate failure rather than blocking
    /// when the request cannot be scheduled right away. Not yet wired to
    /// a non-blocking allocate path (see `DESIGN.md`), but threaded
    /// through so policies can see it.
    pub fail_if_not_immediate: bool,
}

impl AllocationRequest {
    /// Construct a new request. Assigns a fresh id and timestamp.
    pub fn new(caller_id: CallerId, group: impl Into<String>, sizes: Vec<u64>) -> Self {
        assert!(!sizes.is_empty(), "allocation request needs >= 1 size");
        Self {
            id: RequestId(next_id(&REQUEST_IDS)),
            caller_id,
            group: group.into(),
            sizes,
            timestamp: next_timestamp(),
            fail_if_not_immediate: false,
        }
    }

    /// Mark this request as wanting immediate failure instead of
    /// blocking.
    pub fn fail_if_not_immediate(mut self, value: bool) -> Self {
        self.fail_if_not_immediate = value;
        self
    }

    /// The size this request must actually be serviced with: the largest
    /// candidate size (spec §4.4.3 edge policy).
    pub fn size(&self) -> u64 {
        *self.sizes.iter().max().expect("non-empty by construction")
    }
}

/// Per-registrant bookkeeping: `{ group_name, member_id_within_group,
/// owning_worker reference, private condition variable }` from spec §3.
///
/// One [`std::sync::Condvar`] per caller is preserved literally per the
/// design notes: parking every caller on a shared condvar would collapse
/// the fairness properties the priority policy depends on (every waiter
/// gets a spurious wakeup check instead of a targeted one).
pub struct CallerRecord {
    /// This caller's id.
    pub id: CallerId,
    /// Group this caller belongs to (stage name, truncated at the first
    /// `:` — see `MemoryAllocator::register_caller`).
    pub group: String,
    /// Index of this caller within its group, assigned in registration
    /// order.
    pub member_id: usize,
    /// Signalled when a request belonging to this caller becomes
    /// schedulable, or is resolved by the deadlock resolver.
    pub condvar: Condvar,
    /// Shared with the owning worker: `true` while it is waiting for work
    /// from its tracker rather than blocked on memory. Consulted by the
    /// allocator's deadlock checker (spec §4.4.4).
    pub idle: Arc<AtomicBool>,
}

impl CallerRecord {
    /// Register a new caller with no idle-flag wired in yet (tests that
    /// never exercise deadlock detection).
    pub fn new(group: impl Into<String>, member_id: usize) -> Self {
        Self::new_with_idle(group, member_id, Arc::new(AtomicBool::new(false)))
    }

    /// Register a new caller, sharing `idle` with its owning worker.
    pub fn new_with_idle(group: impl Into<String>, member_id: usize, idle: Arc<AtomicBool>) -> Self {
        Self {
            id: CallerId(next_id(&CALLER_IDS)),
            group: group.into(),
            member_id,
            condvar: Condvar::new(),
            idle,
        }
    }
}

/// Fold a worker's raw stage name into its allocator group: everything
/// before the first `:` (spec §4.4.1 — "folds per-job demux sub-workers
/// into the parent stage's group").
pub fn group_name_for_stage(stage_name: &str) -> &str {
    match stage_name.find(':') {
        Some(idx) => &stage_name[..idx],
        None => stage_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_name_strips_colon_suffix() {
        assert_eq!(group_name_for_stage("mapper:3"), "mapper");
        assert_eq!(group_name_for_stage("mapper"), "mapper");
        assert_eq!(group_name_for_stage("mapper:3:extra"), "mapper");
    }

    #[test]
    fn size_is_the_largest_candidate() {
        let req = AllocationRequest::new(CallerId(1), "g", vec![10, 40, 20]);
        assert_eq!(req.size(), 40);
    }

    #[test]
    fn timestamps_are_assigned_once_and_increase() {
        let a = AllocationRequest::new(CallerId(1), "g", vec![1]);
        let b = AllocationRequest::new(CallerId(1), "g", vec![1]);
        assert!(b.timestamp > a.timestamp);
    }
}
