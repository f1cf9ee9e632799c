//! Per-stage tracker: owns workers and the queueing policy, routes
//! incoming work, propagates end-of-stream, and waits for completion
//! (spec §4.6.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Result, ThemisError};
use crate::metrics::MetricsSink;
use crate::policy::QueueingPolicy;
use crate::queue::WorkQueue;
use crate::quota::MemoryQuota;
use crate::work::{WorkItem, WorkUnit};
use crate::worker::{Worker, WorkerCtx, WorkerState};

/// A single-use completion latch: blocks until [`Barrier::mark_done`] has
/// been called exactly once. Kept standalone rather than folded into
/// `Tracker`, mirroring the original's separate `WorkerBarrier` type
/// (spec.md's "completion barrier" tracker field; see `DESIGN.md`).
struct Barrier {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Barrier {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn mark_done(&self) {
        let mut guard = self.done.lock().unwrap();
        *guard = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut guard = self.done.lock().unwrap();
        while !*guard {
            guard = self.cv.wait(guard).unwrap();
        }
    }
}

/// Records one stage's wall-clock runtime from spawn to final worker
/// completion (spec §2: "records a per-stage runtime"). Supplements the
/// original's `CumulativeTimer`/`Timer` (see `DESIGN.md`).
#[derive(Default)]
struct StageTimer {
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

impl StageTimer {
    fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn stop(&mut self) -> Option<Duration> {
        if let Some(start) = self.started {
            let elapsed = start.elapsed();
            self.elapsed = Some(elapsed);
            Some(elapsed)
        } else {
            None
        }
    }
}

struct Downstream<T: WorkUnit> {
    tracker: Arc<Tracker<T>>,
}

/// The per-stage coordinator (spec §3, §4.6.2): owns the workers and the
/// queueing policy, routes `add_work`, propagates end-of-stream once
/// every upstream has signalled it, and exposes a completion barrier.
pub struct Tracker<T: WorkUnit> {
    stage_name: String,
    num_workers: usize,
    is_source: bool,
    policy: Box<dyn QueueingPolicy<T>>,
    upstream_count: AtomicUsize,
    upstream_completed: AtomicUsize,
    downstream: RwLock<Vec<Downstream<T>>>,
    downstream_names: RwLock<HashMap<String, usize>>,
    closed: AtomicBool,
    workers_completed: AtomicUsize,
    spawned: AtomicBool,
    barrier: Barrier,
    handles: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<dyn MetricsSink>,
    timer: Mutex<StageTimer>,
    producer_quota: Option<Arc<MemoryQuota>>,
    consumer_quota: Option<Arc<MemoryQuota>>,
    workers: Mutex<Vec<Option<Box<dyn Worker<T>>>>>,
    idle_flags: Vec<Arc<AtomicBool>>,
}

impl<T: WorkUnit + 'static> Tracker<T> {
    /// Construct a tracker with no producer/consumer quota.
    pub fn new(
        stage_name: impl Into<String>,
        is_source: bool,
        policy: Box<dyn QueueingPolicy<T>>,
        workers: Vec<Box<dyn Worker<T>>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Self::new_with_quotas(stage_name, is_source, policy, workers, metrics, None, None)
    }

    /// Construct a quota-enforcing tracker: `producer_quota` is charged in
    /// [`Self::add_work`], `consumer_quota` is credited as work leaves via
    /// [`Self::get_new_work`] (spec §4.3).
    #[allow(clippy::too_many_arguments)]
    pub fn new_with_quotas(
        stage_name: impl Into<String>,
        is_source: bool,
        policy: Box<dyn QueueingPolicy<T>>,
        workers: Vec<Box<dyn Worker<T>>>,
        metrics: Arc<dyn MetricsSink>,
        producer_quota: Option<Arc<MemoryQuota>>,
        consumer_quota: Option<Arc<MemoryQuota>>,
    ) -> Arc<Self> {
        let num_workers = workers.len();
        let idle_flags = (0..num_workers)
            .map(|_| Arc::new(AtomicBool::new(false)))
            .collect();
        Arc::new(Self {
            stage_name: stage_name.into(),
            num_workers,
            is_source,
            policy,
            upstream_count: AtomicUsize::new(0),
            upstream_completed: AtomicUsize::new(0),
            downstream: RwLock::new(Vec::new()),
            downstream_names: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            workers_completed: AtomicUsize::new(0),
            spawned: AtomicBool::new(false),
            barrier: Barrier::new(),
            handles: Mutex::new(Vec::new()),
            metrics,
            timer: Mutex::new(StageTimer::default()),
            producer_quota,
            consumer_quota,
            workers: Mutex::new(workers.into_iter().map(Some).collect()),
            idle_flags,
        })
    }

    /// This tracker's stage name.
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Number of workers this tracker spawns.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// `true` if this tracker receives end-of-stream at spawn time
    /// instead of from an upstream tracker.
    pub fn is_source(&self) -> bool {
        self.is_source
    }

    /// Number of upstream trackers wired to this one (via the upstream's
    /// [`Self::add_downstream`]). A non-source tracker with zero
    /// upstreams is never reached by anyone's transitive spawn and must
    /// be spawned directly (spec §8: "completes immediately with no
    /// emitted work").
    pub fn upstream_count(&self) -> usize {
        self.upstream_count.load(Ordering::Acquire)
    }

    /// Idle flags for every worker, in worker-id order. The allocator's
    /// deadlock checker and tests read these.
    pub fn idle_flags(&self) -> &[Arc<AtomicBool>] {
        &self.idle_flags
    }

    /// Every downstream tracker, in registration order.
    pub fn downstream_trackers(&self) -> Vec<Arc<Tracker<T>>> {
        self.downstream
            .read()
            .unwrap()
            .iter()
            .map(|d| d.tracker.clone())
            .collect()
    }

    /// Register `self` as having one more upstream tracker. Called by
    /// [`Self::add_downstream`] on the downstream side of an edge; not
    /// normally called directly.
    pub fn add_source(&self) {
        self.upstream_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Wire `downstream` as a destination of this tracker's emitted work,
    /// optionally under a routable `name` (spec §4.6.2). Aborts with
    /// [`ThemisError::DuplicateDownstreamName`] on a repeated name.
    pub fn add_downstream(&self, downstream: Arc<Tracker<T>>, name: Option<&str>) -> Result<()> {
        let mut list = self.downstream.write().unwrap();
        if let Some(name) = name {
            let mut names = self.downstream_names.write().unwrap();
            if names.contains_key(name) {
                return Err(ThemisError::DuplicateDownstreamName {
                    tracker: self.stage_name.clone(),
                    name: name.to_string(),
                });
            }
            names.insert(name.to_string(), list.len());
        }
        downstream.add_source();
        list.push(Downstream { tracker: downstream });
        Ok(())
    }

    fn close_policy(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(stage = %self.stage_name, "closing queueing policy");
            self.policy.teardown();
        }
    }

    /// Route incoming work: end-of-stream increments the upstream
    /// completion count (closing the policy once every upstream has
    /// signalled, or immediately if this is a source); a live unit is
    /// charged against the producer quota, if any, then handed to the
    /// queueing policy (spec §4.6.2).
    pub fn add_work(&self, item: WorkItem<T>) -> Result<()> {
        match item {
            WorkItem::EndOfStream => {
                let completed = self.upstream_completed.fetch_add(1, Ordering::AcqRel) + 1;
                let upstream_count = self.upstream_count.load(Ordering::Acquire);
                if self.is_source || completed >= upstream_count {
                    self.close_policy();
                }
                Ok(())
            }
            WorkItem::Unit(unit) => {
                if self.closed.load(Ordering::Acquire) {
                    return Err(ThemisError::TrackerClosed {
                        tracker: self.stage_name.clone(),
                    });
                }
                if let Some(quota) = &self.producer_quota {
                    quota.add_usage(unit.current_size_in_bytes());
                }
                self.policy.enqueue(unit)
            }
        }
    }

    /// Block for the next unit destined for `queue_id`, crediting the
    /// consumer quota (if any) as the unit leaves the tracker.
    pub(crate) fn get_new_work(&self, queue_id: usize) -> WorkItem<T> {
        let item = self.policy.dequeue(queue_id);
        self.credit_consumer(&item);
        item
    }

    /// Non-blocking variant of [`Self::get_new_work`].
    pub(crate) fn try_get_new_work(&self, queue_id: usize) -> Option<T> {
        let item = self.policy.try_dequeue(queue_id);
        if let Some(unit) = &item {
            if let Some(quota) = &self.consumer_quota {
                quota
                    .remove_usage(unit.current_size_in_bytes())
                    .unwrap_or_else(|e| e.abort());
            }
        }
        item
    }

    /// Move everything queued for `queue_id` into `into`, crediting the
    /// consumer quota for the total bytes moved.
    pub(crate) fn bulk_get_new_work(&self, queue_id: usize, into: &WorkQueue<T>) {
        let before = into.bytes_held();
        self.policy.bulk_dequeue(queue_id, into);
        if let Some(quota) = &self.consumer_quota {
            let moved = into.bytes_held().saturating_sub(before);
            if moved > 0 {
                quota.remove_usage(moved).unwrap_or_else(|e| e.abort());
            }
        }
    }

    fn credit_consumer(&self, item: &WorkItem<T>) {
        if let WorkItem::Unit(unit) = item {
            if let Some(quota) = &self.consumer_quota {
                quota
                    .remove_usage(unit.current_size_in_bytes())
                    .unwrap_or_else(|e| e.abort());
            }
        }
    }

    /// Emit to the default (first-registered) downstream.
    pub(crate) fn emit(&self, unit: T) -> Result<()> {
        let downstream = self.downstream.read().unwrap();
        let target = downstream
            .first()
            .ok_or_else(|| ThemisError::UnknownDownstream {
                tracker: self.stage_name.clone(),
                name: "<default>".to_string(),
            })?;
        target.tracker.add_work(WorkItem::Unit(unit))
    }

    /// Emit to a named downstream; fatal if the name was never
    /// registered.
    pub(crate) fn emit_named(&self, name: &str, unit: T) -> Result<()> {
        let idx = {
            let names = self.downstream_names.read().unwrap();
            *names
                .get(name)
                .ok_or_else(|| ThemisError::UnknownDownstream {
                    tracker: self.stage_name.clone(),
                    name: name.to_string(),
                })?
        };
        let downstream = self.downstream.read().unwrap();
        downstream[idx].tracker.add_work(WorkItem::Unit(unit))
    }

    /// Start every worker thread. Idempotent (spec §8 boundary
    /// behavior). If this is a source tracker, immediately posts
    /// end-of-stream to itself once workers are running, so it drains
    /// after its seed work is processed. Recursively spawns any
    /// not-yet-spawned downstream.
    #[tracing::instrument(skip(self), fields(stage = %self.stage_name))]
    pub fn spawn(self: &Arc<Self>) {
        if self.spawned.swap(true, Ordering::AcqRel) {
            return;
        }

        self.timer.lock().unwrap().start();
        tracing::info!(stage = %self.stage_name, workers = self.num_workers, "spawning tracker");

        let mut workers_guard = self.workers.lock().unwrap();
        for id in 0..self.num_workers {
            let mut worker = workers_guard[id]
                .take()
                .expect("tracker spawn is idempotent; worker already taken");
            let tracker = Arc::clone(self);
            let idle = self.idle_flags[id].clone();
            let idle_on_complete = idle.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{id}", self.stage_name))
                .spawn(move || {
                    let ctx = WorkerCtx::new(id, tracker.clone(), idle);
                    ctx.set_state(WorkerState::Init);
                    if let Err(err) = worker.init(&ctx) {
                        err.abort();
                    }
                    ctx.set_state(WorkerState::Running);
                    if let Err(err) = worker.run(&ctx) {
                        err.abort();
                    }
                    ctx.set_state(WorkerState::TearingDown);
                    if let Err(err) = worker.teardown(&ctx) {
                        err.abort();
                    }
                    ctx.set_state(WorkerState::Completed);
                    // A completed worker can make no further progress; it
                    // is idle for deadlock-detection purposes from here on
                    // (spec §4.6.1).
                    idle_on_complete.store(true, Ordering::Release);
                    tracker.notify_worker_completed(id);
                })
                .expect("failed to spawn worker thread");
            self.handles.lock().unwrap().push(handle);
        }
        drop(workers_guard);

        // A source posts its own eos so it drains after its seed work.
        // A non-source with zero wired upstreams will never receive one
        // from anybody else, so it self-closes the same way (spec §8:
        // "completes immediately with no emitted work").
        if self.is_source || self.upstream_count() == 0 {
            self.add_work(WorkItem::EndOfStream)
                .unwrap_or_else(|e| e.abort());
        }

        // A stage with zero workers (degenerate, but legal — e.g. a pure
        // fan-out tracker with no processing of its own) has no thread to
        // ever call `notify_worker_completed`; complete it immediately so
        // its barrier and downstream eos propagation aren't stuck waiting
        // on work that will never arrive.
        if self.num_workers == 0 {
            self.complete();
        }

        for downstream in self.downstream.read().unwrap().iter() {
            downstream.tracker.spawn();
        }
    }

    /// Called by a worker thread once it has completed teardown. When
    /// every worker of this tracker has completed, posts end-of-stream to
    /// every downstream (exactly once each), stops the stage timer, and
    /// releases the completion barrier (spec §4.6.2).
    #[tracing::instrument(skip(self), fields(stage = %self.stage_name, worker_id = _worker_id))]
    pub(crate) fn notify_worker_completed(&self, _worker_id: usize) {
        let completed = self.workers_completed.fetch_add(1, Ordering::AcqRel) + 1;
        if completed == self.num_workers {
            self.complete();
        }
    }

    fn complete(&self) {
        tracing::info!(stage = %self.stage_name, "all workers completed, propagating end-of-stream");
        for downstream in self.downstream.read().unwrap().iter() {
            downstream
                .tracker
                .add_work(WorkItem::EndOfStream)
                .unwrap_or_else(|e| e.abort());
        }
        if let Some(elapsed) = self.timer.lock().unwrap().stop() {
            self.metrics
                .record(&format!("{}.runtime_seconds", self.stage_name), elapsed.as_secs_f64());
        }
        self.barrier.mark_done();
    }

    /// Block until this tracker's completion barrier has fired.
    pub fn wait_for_workers_to_finish(&self) {
        self.barrier.wait();
    }

    /// Join every worker thread. Only legal after
    /// [`Self::wait_for_workers_to_finish`] (spec §4.6.2).
    pub fn destroy_workers(&self) {
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
#[path = "tracker.test.rs"]
mod tests;
