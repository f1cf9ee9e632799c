//! Central priority-aware memory allocator (spec §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::allocator::deadlock::{DeadlockResolver, MemoryRegion};
use crate::allocator::priority::AllocatorPolicy;
use crate::allocator::request::{AllocationRequest, CallerId, CallerRecord, RequestId, group_name_for_stage};
use crate::error::{Result, ThemisError};

fn try_heap_alloc(size: u64) -> std::result::Result<Vec<u8>, ()> {
    let mut v: Vec<u8> = Vec::new();
    if v.try_reserve_exact(size as usize).is_err() {
        return Err(());
    }
    v.resize(size as usize, 0);
    Ok(v)
}

struct RequestSlot {
    request: Arc<AllocationRequest>,
    resolved_region: Option<MemoryRegion>,
}

struct AllocationMetadata {
    size: u64,
    caller_id: CallerId,
    group: String,
    resolved_on_deadlock: bool,
    allocated_at: Instant,
}

struct AllocatorState {
    availability: u64,
    pending: HashMap<RequestId, RequestSlot>,
    metadata: HashMap<u64, AllocationMetadata>,
    per_worker_bytes: HashMap<CallerId, u64>,
    next_alloc_id: u64,
}

struct DeadlockCheckerHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// The central byte budget shared across all stages (spec §4.4.2).
pub struct MemoryAllocator {
    capacity: u64,
    fragmentation_sleep: Duration,
    policy: Arc<dyn AllocatorPolicy>,
    resolver: Mutex<Option<Arc<dyn DeadlockResolver>>>,
    state: Mutex<AllocatorState>,
    callers: Mutex<HashMap<CallerId, Arc<CallerRecord>>>,
    next_member_id: Mutex<HashMap<String, usize>>,
    checker: Mutex<Option<DeadlockCheckerHandle>>,
}

impl MemoryAllocator {
    /// Create an allocator with the given byte `capacity`. No resolver is
    /// installed yet: a deadlock detected before
    /// [`Self::spawn_deadlock_checker`] — or before a resolver is
    /// attached with [`Self::install_resolver`] — is reported but not
    /// resolved (spec §4.7).
    pub fn new(capacity: u64, fragmentation_sleep: Duration, policy: Arc<dyn AllocatorPolicy>) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            fragmentation_sleep,
            policy,
            resolver: Mutex::new(None),
            state: Mutex::new(AllocatorState {
                availability: capacity,
                pending: HashMap::new(),
                metadata: HashMap::new(),
                per_worker_bytes: HashMap::new(),
                next_alloc_id: 1,
            }),
            callers: Mutex::new(HashMap::new()),
            next_member_id: Mutex::new(HashMap::new()),
            checker: Mutex::new(None),
        })
    }

    /// Total byte budget.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes not currently allocated from the heap-backed budget.
    pub fn availability(&self) -> u64 {
        self.state.lock().unwrap().availability
    }

    /// Install the deadlock-escape resolver. Typically
    /// [`crate::allocator::deadlock::DiskBackedResolver`] in production,
    /// left unset (or [`crate::allocator::deadlock::AbortingDeadlockResolver`])
    /// in configurations that never expect to hit a real deadlock.
    pub fn install_resolver(&self, resolver: Arc<dyn DeadlockResolver>) {
        *self.resolver.lock().unwrap() = Some(resolver);
    }

    /// Register a worker as a caller. The group name is the stage name
    /// truncated at the first `:` (spec §4.4.1). `idle` is the worker's
    /// shared idle flag, consulted by the deadlock checker.
    pub fn register_caller(&self, stage_name: &str, idle: Arc<AtomicBool>) -> CallerId {
        let group = group_name_for_stage(stage_name).to_string();
        let member_id = {
            let mut next = self.next_member_id.lock().unwrap();
            let counter = next.entry(group.clone()).or_insert(0);
            let id = *counter;
            *counter += 1;
            id
        };
        let record = Arc::new(CallerRecord::new_with_idle(group, member_id, idle));
        let id = record.id;
        self.callers.lock().unwrap().insert(id, record);
        id
    }

    /// Block until the request is granted, returning the allocated
    /// region. See spec §4.4.2 for the full algorithm.
    #[tracing::instrument(skip(self, request), fields(caller = ?request.caller_id, size = request.size()))]
    pub fn allocate(&self, request: AllocationRequest) -> Result<MemoryRegion> {
        if request.size() > self.capacity {
            return Err(ThemisError::RequestExceedsCapacity {
                requested: request.size(),
                capacity: self.capacity,
            });
        }

        let caller = {
            let callers = self.callers.lock().unwrap();
            callers
                .get(&request.caller_id)
                .cloned()
                .expect("allocate called with an unregistered caller_id")
        };

        let req = Arc::new(request);
        let mut state = self.state.lock().unwrap();
        self.policy.add_request(req.clone());
        state.pending.insert(
            req.id,
            RequestSlot {
                request: req.clone(),
                resolved_region: None,
            },
        );

        let region = loop {
            loop {
                let ready = {
                    let slot = state.pending.get(&req.id).expect("slot present while waiting");
                    slot.resolved_region.is_some() || self.policy.can_schedule_request(state.availability, &req)
                };
                if ready {
                    break;
                }
                state = caller.condvar.wait(state).unwrap();
            }

            if let Some(region) = state.pending.get_mut(&req.id).unwrap().resolved_region.take() {
                break region;
            }

            match try_heap_alloc(req.size()) {
                Ok(bytes) => {
                    let id = state.next_alloc_id;
                    state.next_alloc_id += 1;
                    break MemoryRegion::heap_from_bytes(id, bytes);
                }
                Err(()) => {
                    drop(state);
                    std::thread::sleep(self.fragmentation_sleep);
                    state = self.state.lock().unwrap();
                    // Fall through to the wait loop again so a
                    // higher-priority arrival can overtake us before we
                    // retry the real allocation.
                }
            }
        };

        if !region.resolved_on_deadlock() {
            state.availability -= region.size();
        }
        state.metadata.insert(
            region.id(),
            AllocationMetadata {
                size: region.size(),
                caller_id: req.caller_id,
                group: req.group.clone(),
                resolved_on_deadlock: region.resolved_on_deadlock(),
                allocated_at: Instant::now(),
            },
        );
        *state.per_worker_bytes.entry(req.caller_id).or_insert(0) += region.size();
        state.pending.remove(&req.id);
        self.policy.remove_request(&req)?;
        self.wake_next(&mut state);

        tracing::debug!(
            id = region.id(),
            size = region.size(),
            caller = req.caller_id.0,
            resolved_on_deadlock = region.resolved_on_deadlock(),
            "allocation granted"
        );

        Ok(region)
    }

    /// Release a region previously returned by [`Self::allocate`].
    #[tracing::instrument(skip(self, region), fields(id = ?region.id(), size = region.size()))]
    pub fn deallocate(&self, region: MemoryRegion) -> Result<()> {
        let id = region.id();
        let meta = {
            let mut state = self.state.lock().unwrap();
            let meta = state
                .metadata
                .remove(&id)
                .ok_or(ThemisError::UnknownAllocation { id })?;
            if let Some(bytes) = state.per_worker_bytes.get_mut(&meta.caller_id) {
                *bytes = bytes.saturating_sub(meta.size);
            }
            if !meta.resolved_on_deadlock {
                state.availability += meta.size;
            }
            meta
        };

        let use_time = meta.allocated_at.elapsed();
        tracing::debug!(id, group = %meta.group, ?use_time, "allocation released");

        if meta.resolved_on_deadlock {
            let resolver = self
                .resolver
                .lock()
                .unwrap()
                .clone()
                .expect("resolved-on-deadlock allocation implies a resolver is installed");
            resolver.release(region)?;
        }

        let mut state = self.state.lock().unwrap();
        self.wake_next(&mut state);
        Ok(())
    }

    fn wake_next(&self, state: &mut AllocatorState) {
        if let Some(next) = self.policy.next_schedulable_request(state.availability) {
            if let Some(caller) = self.callers.lock().unwrap().get(&next.caller_id) {
                caller.condvar.notify_one();
            }
        }
    }

    /// Run one deadlock-detection pass (spec §4.4.4). Returns whether a
    /// deadlock was declared (regardless of whether it could be
    /// resolved).
    pub fn detect_and_resolve_deadlocks(&self) -> Result<bool> {
        let best_candidate = {
            let state = self.state.lock().unwrap();
            let callers = self.callers.lock().unwrap();
            let mut progress_possible = false;
            for caller in callers.values() {
                if caller.idle.load(Ordering::Acquire) {
                    continue;
                }
                let outstanding: Vec<&RequestSlot> = state
                    .pending
                    .values()
                    .filter(|s| s.request.caller_id == caller.id)
                    .collect();
                if outstanding.is_empty() {
                    progress_possible = true;
                    continue;
                }
                if outstanding.iter().any(|slot| {
                    slot.resolved_region.is_some()
                        || self.policy.can_schedule_request(state.availability, &slot.request)
                }) {
                    progress_possible = true;
                }
            }
            if progress_possible {
                None
            } else {
                Some(self.policy.best_request_for_deadlock_resolution())
            }
        };

        let Some(maybe_request) = best_candidate else {
            return Ok(false);
        };
        let Some(request) = maybe_request else {
            // Declared, but nothing is actually pending to resolve
            // (degenerate: every worker idle with nothing queued).
            return Ok(true);
        };

        {
            let state = self.state.lock().unwrap();
            if let Some(slot) = state.pending.get(&request.id) {
                if slot.resolved_region.is_some() {
                    // Already granted by a previous pass, just awaiting
                    // pickup by its caller; resolving it again would leak
                    // the first region. Nothing further to do this pass.
                    return Ok(true);
                }
            }
        }

        let resolver = self.resolver.lock().unwrap().clone();
        let Some(resolver) = resolver else {
            tracing::error!(group = %request.group, "deadlock detected with no resolver spawned");
            return Ok(true);
        };

        let alloc_id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_alloc_id;
            state.next_alloc_id += 1;
            id
        };

        tracing::warn!(group = %request.group, size = request.size(), "deadlock detected, invoking resolver");
        let region = resolver.resolve(alloc_id, request.size())?;

        {
            let mut state = self.state.lock().unwrap();
            match state.pending.get_mut(&request.id) {
                Some(slot) if slot.resolved_region.is_none() => {
                    slot.resolved_region = Some(region);
                }
                _ => {
                    // The request was picked up (or already resolved by a
                    // racing pass) between the check above and here; don't
                    // overwrite an existing grant, and don't orphan this
                    // freshly-resolved region.
                    drop(state);
                    resolver.release(region)?;
                }
            }
        }

        if let Some(caller) = self.callers.lock().unwrap().get(&request.caller_id) {
            caller.condvar.notify_one();
        }

        Ok(true)
    }

    /// Start a background thread that calls
    /// [`Self::detect_and_resolve_deadlocks`] about once a second.
    pub fn spawn_deadlock_checker(self: &Arc<Self>) {
        let mut checker = self.checker.lock().unwrap();
        if checker.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let allocator = self.clone();
        let handle = std::thread::Builder::new()
            .name("themis-deadlock-checker".to_string())
            .spawn(move || {
                while !stop_clone.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_secs(1));
                    if stop_clone.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = allocator.detect_and_resolve_deadlocks() {
                        tracing::error!(%err, "deadlock checker pass failed");
                    }
                }
            })
            .expect("failed to spawn deadlock checker thread");
        *checker = Some(DeadlockCheckerHandle { stop, handle });
    }

    /// Stop the background deadlock checker, if running.
    pub fn stop_deadlock_checker(&self) {
        if let Some(checker) = self.checker.lock().unwrap().take() {
            checker.stop.store(true, Ordering::Release);
            let _ = checker.handle.join();
        }
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        if let Some(checker) = self.checker.get_mut().unwrap().take() {
            checker.stop.store(true, Ordering::Release);
            let _ = checker.handle.join();
        }
    }
}

#[cfg(test)]
#[path = "memory_allocator.test.rs"]
mod tests;
