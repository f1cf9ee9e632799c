//! Benchmark-only memory manager (spec §4.5): a simpler allocator than
//! [`crate::allocator::memory_allocator::MemoryAllocator`], used by the
//! `mallocbench` workload to exercise different wake policies in
//! isolation from the priority/deadlock machinery. Reuses
//! [`crate::allocator::deadlock::MemoryRegion`]'s heap-backed constructor
//! rather than inventing a parallel region type.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::allocator::deadlock::MemoryRegion;
use crate::error::{Result, ThemisError};
use crate::util::monotonic_tag;

/// `{ worker_id, size, timestamp }` from spec §4.5. `arrival_nanos` is
/// measured against the owning [`MemoryManager`]'s private epoch, not
/// wall-clock time, so wake-policy unit tests can supply arbitrary
/// deterministic values without needing a real clock.
#[derive(Debug, Clone, Copy)]
pub struct BlockedRequest {
    pub worker_id: u64,
    pub size: u64,
    pub arrival_nanos: u64,
    seq: u64,
}

/// A selectable policy for choosing which blocked request to serve when
/// memory becomes available (spec §4.5). Every method is given an
/// explicit `now_nanos` rather than reading a clock itself, so the three
/// concrete policies below are deterministically testable.
pub trait WakePolicy: Send + Sync {
    /// Register a newly blocked request.
    fn enqueue(&self, req: BlockedRequest);

    /// Re-check whether `req` specifically may proceed given `remaining`
    /// bytes free, removing it from internal bookkeeping if so. Called by
    /// the blocked thread itself on every wake, per spec ("must re-check
    /// the canService predicate on every wake; spurious wakes are
    /// explicitly allowed").
    fn try_admit(&self, req: &BlockedRequest, remaining: u64, now_nanos: u64) -> bool;

    /// Read-only: which worker (if any) should currently be woken, without
    /// mutating queue membership. `get`/`put` call this to target their
    /// end-of-call wake attempt.
    fn peek_candidate(&self, remaining: u64, now_nanos: u64) -> Option<u64>;

    /// Feed back how long an admitted request waited, in nanoseconds.
    /// Only the MLFQ policy uses this (for its running average); ASAP and
    /// FIFO ignore it.
    fn record_wait(&self, _wait_nanos: u64) {}

    /// Number of requests currently blocked. Diagnostic/test use only.
    fn pending_len(&self) -> usize;
}

/// Scan the pending queue in arrival order, serve the first whose size
/// fits. Starvation of large requests is possible and intentional (spec
/// §4.5): this is the high-throughput baseline.
#[derive(Default)]
pub struct AsapPolicy {
    queue: Mutex<VecDeque<BlockedRequest>>,
}

impl AsapPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn first_fit(queue: &VecDeque<BlockedRequest>, remaining: u64) -> Option<usize> {
        queue.iter().position(|r| r.size <= remaining)
    }
}

impl WakePolicy for AsapPolicy {
    fn enqueue(&self, req: BlockedRequest) {
        self.queue.lock().unwrap().push_back(req);
    }

    fn try_admit(&self, req: &BlockedRequest, remaining: u64, _now_nanos: u64) -> bool {
        let mut queue = self.queue.lock().unwrap();
        match Self::first_fit(&queue, remaining) {
            Some(pos) if queue[pos].seq == req.seq => {
                queue.remove(pos);
                true
            }
            _ => false,
        }
    }

    fn peek_candidate(&self, remaining: u64, _now_nanos: u64) -> Option<u64> {
        let queue = self.queue.lock().unwrap();
        Self::first_fit(&queue, remaining).map(|pos| queue[pos].worker_id)
    }

    fn pending_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// Only the head of the queue may be served, and only once it fits. Strict
/// in-order; a sequence of satisfied requests under FIFO is always a
/// prefix of the sequence of submitted requests (spec §8 invariant 6).
#[derive(Default)]
pub struct FifoPolicy {
    queue: Mutex<VecDeque<BlockedRequest>>,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WakePolicy for FifoPolicy {
    fn enqueue(&self, req: BlockedRequest) {
        self.queue.lock().unwrap().push_back(req);
    }

    fn try_admit(&self, req: &BlockedRequest, remaining: u64, _now_nanos: u64) -> bool {
        let mut queue = self.queue.lock().unwrap();
        match queue.front() {
            Some(front) if front.seq == req.seq && front.size <= remaining => {
                queue.pop_front();
                true
            }
            _ => false,
        }
    }

    fn peek_candidate(&self, remaining: u64, _now_nanos: u64) -> Option<u64> {
        let queue = self.queue.lock().unwrap();
        match queue.front() {
            Some(front) if front.size <= remaining => Some(front.worker_id),
            _ => None,
        }
    }

    fn pending_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

struct MlfqState {
    low: VecDeque<BlockedRequest>,
    high: VecDeque<BlockedRequest>,
    running_avg_nanos: u64,
    completed: u64,
}

/// Two queues, low and high. New arrivals enter low; on each wake attempt
/// any request at the head of low whose wait has exceeded the running
/// average block time is promoted to the tail of high. High is served
/// FIFO (strictly, head-only) before low is served ASAP (spec §4.5).
pub struct MlfqAsapPolicy {
    state: Mutex<MlfqState>,
}

impl MlfqAsapPolicy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MlfqState {
                low: VecDeque::new(),
                high: VecDeque::new(),
                running_avg_nanos: 0,
                completed: 0,
            }),
        }
    }

    fn promote(state: &mut MlfqState, now_nanos: u64) {
        while let Some(front) = state.low.front() {
            if now_nanos.saturating_sub(front.arrival_nanos) > state.running_avg_nanos {
                let promoted = state.low.pop_front().expect("front just matched");
                state.high.push_back(promoted);
            } else {
                break;
            }
        }
    }

    /// Identify (without removing) the current winner. High has strict
    /// priority over low: while any request sits in high, only its head
    /// may be served (FIFO), even if something in low would otherwise
    /// fit — this is what gives promotion teeth. Low is scanned ASAP only
    /// once high is empty.
    fn winner(state: &MlfqState, remaining: u64) -> Option<u64> {
        if let Some(front) = state.high.front() {
            return if front.size <= remaining {
                Some(front.seq)
            } else {
                None
            };
        }
        state
            .low
            .iter()
            .find(|r| r.size <= remaining)
            .map(|r| r.seq)
    }
}

impl Default for MlfqAsapPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl WakePolicy for MlfqAsapPolicy {
    fn enqueue(&self, req: BlockedRequest) {
        self.state.lock().unwrap().low.push_back(req);
    }

    fn try_admit(&self, req: &BlockedRequest, remaining: u64, now_nanos: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        Self::promote(&mut state, now_nanos);
        match Self::winner(&state, remaining) {
            Some(seq) if seq == req.seq => {
                if state.high.front().map(|r| r.seq) == Some(seq) {
                    state.high.pop_front();
                } else {
                    let pos = state.low.iter().position(|r| r.seq == seq).expect("winner came from low");
                    state.low.remove(pos);
                }
                true
            }
            _ => false,
        }
    }

    fn peek_candidate(&self, remaining: u64, now_nanos: u64) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        Self::promote(&mut state, now_nanos);
        let seq = Self::winner(&state, remaining)?;
        state
            .high
            .iter()
            .chain(state.low.iter())
            .find(|r| r.seq == seq)
            .map(|r| r.worker_id)
    }

    fn record_wait(&self, wait_nanos: u64) {
        let mut state = self.state.lock().unwrap();
        state.completed += 1;
        let avg = state.running_avg_nanos;
        let count = state.completed;
        state.running_avg_nanos = if wait_nanos >= avg {
            avg + (wait_nanos - avg) / count
        } else {
            avg - (avg - wait_nanos) / count
        };
    }

    fn pending_len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.low.len() + state.high.len()
    }
}

struct AllocationMeta {
    size: u64,
}

struct State {
    remaining: u64,
    metadata: HashMap<u64, AllocationMeta>,
    next_alloc_id: u64,
}

/// The benchmark-only allocator (spec §4.5): `get`/`put` pair, no
/// priority graph, no deadlock resolver — a request that cannot be
/// serviced simply waits until enough memory is freed.
pub struct MemoryManager {
    capacity: u64,
    epoch: Instant,
    policy: Box<dyn WakePolicy>,
    state: Mutex<State>,
    worker_condvars: Mutex<HashMap<u64, Arc<Condvar>>>,
}

impl MemoryManager {
    /// Create a manager with the given byte `capacity` and wake `policy`.
    pub fn new(capacity: u64, policy: Box<dyn WakePolicy>) -> Self {
        Self {
            capacity,
            epoch: Instant::now(),
            policy,
            state: Mutex::new(State {
                remaining: capacity,
                metadata: HashMap::new(),
                next_alloc_id: 1,
            }),
            worker_condvars: Mutex::new(HashMap::new()),
        }
    }

    /// Total byte budget.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes not currently allocated.
    pub fn remaining(&self) -> u64 {
        self.state.lock().unwrap().remaining
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn condvar_for(&self, worker_id: u64) -> Arc<Condvar> {
        self.worker_condvars
            .lock()
            .unwrap()
            .entry(worker_id)
            .or_insert_with(|| Arc::new(Condvar::new()))
            .clone()
    }

    fn commit(&self, state: &mut State, size: u64) -> MemoryRegion {
        state.remaining -= size;
        let id = state.next_alloc_id;
        state.next_alloc_id += 1;
        state.metadata.insert(id, AllocationMeta { size });
        MemoryRegion::heap(id, size)
    }

    /// Request `size` bytes on behalf of `worker_id`. Blocks on that
    /// worker's condition variable while insufficient memory is free
    /// (spec §4.5).
    pub fn get(&self, worker_id: u64, size: u64) -> Result<MemoryRegion> {
        if size > self.capacity {
            return Err(ThemisError::RequestExceedsCapacity {
                requested: size,
                capacity: self.capacity,
            });
        }

        let mut state = self.state.lock().unwrap();
        if state.remaining >= size {
            let region = self.commit(&mut state, size);
            drop(state);
            self.try_wake_one();
            return Ok(region);
        }

        let req = BlockedRequest {
            worker_id,
            size,
            arrival_nanos: self.now_nanos(),
            seq: monotonic_tag(),
        };
        self.policy.enqueue(req);
        let cv = self.condvar_for(worker_id);

        loop {
            state = cv.wait(state).unwrap();
            let now = self.now_nanos();
            if self.policy.try_admit(&req, state.remaining, now) {
                self.policy.record_wait(now.saturating_sub(req.arrival_nanos));
                let region = self.commit(&mut state, size);
                drop(state);
                self.try_wake_one();
                return Ok(region);
            }
        }
    }

    /// Release a region previously returned by [`Self::get`].
    pub fn put(&self, region: MemoryRegion) {
        let mut state = self.state.lock().unwrap();
        state.metadata.remove(&region.id());
        state.remaining += region.size();
        drop(state);
        self.try_wake_one();
    }

    fn try_wake_one(&self) {
        let state = self.state.lock().unwrap();
        let remaining = state.remaining;
        let now = self.now_nanos();
        drop(state);
        if let Some(worker_id) = self.policy.peek_candidate(remaining, now) {
            if let Some(cv) = self.worker_condvars.lock().unwrap().get(&worker_id) {
                cv.notify_one();
            }
        }
    }
}

#[cfg(test)]
#[path = "memory_manager.test.rs"]
mod tests;
