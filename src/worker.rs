//! Worker lifecycle (spec §4.6.1): per-worker state machine, the
//! [`WorkerCtx`] a stage implementation uses to talk to its tracker, and
//! the single-unit/batch adapters that turn a plain processing impl into
//! something a [`crate::tracker::Tracker`] can spawn.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::Result;
use crate::queue::WorkQueue;
use crate::tracker::Tracker;
use crate::work::{WorkItem, WorkUnit};

/// Per-worker lifecycle state: `Created -> Init -> Running -> TearingDown
/// -> Completed` (spec §4.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Init,
    Running,
    TearingDown,
    Completed,
}

/// What a stage implementation provides. The loop itself — single-unit or
/// batch — lives in [`SingleUnitAdapter`]/[`BatchAdapter`]; a `Worker` is
/// whatever those adapters wrap, or a from-scratch implementation for a
/// stage with an unusual loop shape (e.g. one that spawns further work, as
/// in scenario D).
pub trait Worker<T: WorkUnit>: Send {
    /// Runs once before `run`. Default is a no-op.
    fn init(&mut self, _ctx: &WorkerCtx<T>) -> Result<()> {
        Ok(())
    }

    /// The worker's main loop. Expected to return once it has observed
    /// end-of-stream from its tracker.
    fn run(&mut self, ctx: &WorkerCtx<T>) -> Result<()>;

    /// Runs once after `run` returns. Default is a no-op.
    fn teardown(&mut self, _ctx: &WorkerCtx<T>) -> Result<()> {
        Ok(())
    }
}

/// The context a [`Worker`] implementation uses to dequeue, emit, and
/// report idleness to its owning tracker (spec §3: "{ id, parent_tracker,
/// downstream_trackers_ordered, idle_flag, workers_completed_count }").
pub struct WorkerCtx<T: WorkUnit> {
    id: usize,
    tracker: Arc<Tracker<T>>,
    idle: Arc<AtomicBool>,
    state: Mutex<WorkerState>,
    first_wait_accounted: AtomicBool,
    pipeline_saturation_wait_nanos: AtomicU64,
    steady_state_wait_nanos: AtomicU64,
}

impl<T: WorkUnit> WorkerCtx<T> {
    pub(crate) fn new(id: usize, tracker: Arc<Tracker<T>>, idle: Arc<AtomicBool>) -> Self {
        Self {
            id,
            tracker,
            idle,
            state: Mutex::new(WorkerState::Created),
            first_wait_accounted: AtomicBool::new(false),
            pipeline_saturation_wait_nanos: AtomicU64::new(0),
            steady_state_wait_nanos: AtomicU64::new(0),
        }
    }

    /// This worker's index within its stage.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Stage name of the owning tracker (allocator group, diagnostics).
    pub fn stage_name(&self) -> &str {
        self.tracker.stage_name()
    }

    /// The idle flag the deadlock detector consults (spec §4.4.4): `true`
    /// while this worker awaits external work or a saturated downstream
    /// queue, never while it's blocked on the allocator.
    pub fn idle_flag(&self) -> Arc<AtomicBool> {
        self.idle.clone()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap() = state;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    /// Nanoseconds spent in this worker's very first blocking wait.
    /// Spec §4.6.1: "accounted separately as *pipeline saturation
    /// wait*... does not count against steady-state waiting time".
    pub fn pipeline_saturation_wait_nanos(&self) -> u64 {
        self.pipeline_saturation_wait_nanos.load(Ordering::Relaxed)
    }

    /// Nanoseconds spent blocked on every wait after the first.
    pub fn steady_state_wait_nanos(&self) -> u64 {
        self.steady_state_wait_nanos.load(Ordering::Relaxed)
    }

    fn record_wait(&self, elapsed_nanos: u64) {
        if !self.first_wait_accounted.swap(true, Ordering::AcqRel) {
            self.pipeline_saturation_wait_nanos
                .fetch_add(elapsed_nanos, Ordering::Relaxed);
        } else {
            self.steady_state_wait_nanos
                .fetch_add(elapsed_nanos, Ordering::Relaxed);
        }
    }

    /// Block for the next unit of work destined for this worker. Sets the
    /// idle flag for the duration of the wait.
    pub fn dequeue(&self) -> WorkItem<T> {
        self.idle.store(true, Ordering::Release);
        let start = Instant::now();
        let item = self.tracker.get_new_work(self.id);
        self.record_wait(start.elapsed().as_nanos() as u64);
        self.idle.store(false, Ordering::Release);
        item
    }

    /// Non-blocking variant of [`Self::dequeue`]. Never touches the idle
    /// flag, since it never blocks.
    pub fn try_dequeue(&self) -> Option<T> {
        self.tracker.try_get_new_work(self.id)
    }

    /// Move everything currently queued for this worker into `into`, used
    /// by [`BatchAdapter`] to refill its private batch queue.
    pub fn bulk_dequeue(&self, into: &WorkQueue<T>) {
        self.tracker.bulk_get_new_work(self.id, into);
    }

    /// Emit a unit to the tracker's default (first-registered)
    /// downstream.
    pub fn emit(&self, unit: T) -> Result<()> {
        self.tracker.emit(unit)
    }

    /// Emit a unit to a named downstream. Fatal if the tracker never
    /// registered a downstream under that name (spec §4.6.1).
    pub fn emit_named(&self, name: &str, unit: T) -> Result<()> {
        self.tracker.emit_named(name, unit)
    }
}

/// Processes one unit at a time; the loop itself lives in
/// [`SingleUnitAdapter`].
pub trait SingleUnitProcessor<T: WorkUnit>: Send {
    /// Handle one unit, emitting zero or more downstream units through
    /// `ctx`.
    fn process(&mut self, ctx: &WorkerCtx<T>, unit: T) -> Result<()>;
}

/// Turns a [`SingleUnitProcessor`] into a [`Worker`]: `dequeue -> (if eos
/// then stop else process(unit))`, repeated (spec §4.6.1).
pub struct SingleUnitAdapter<P> {
    inner: P,
}

impl<P> SingleUnitAdapter<P> {
    /// Wrap `inner` as the per-unit body of a worker's loop.
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<T: WorkUnit, P: SingleUnitProcessor<T>> Worker<T> for SingleUnitAdapter<P> {
    fn run(&mut self, ctx: &WorkerCtx<T>) -> Result<()> {
        loop {
            match ctx.dequeue() {
                WorkItem::EndOfStream => return Ok(()),
                WorkItem::Unit(unit) => self.inner.process(ctx, unit)?,
            }
        }
    }
}

/// Processes a whole batch at once; the refill loop lives in
/// [`BatchAdapter`].
pub trait BatchProcessor<T: WorkUnit>: Send {
    /// Handle one batch (possibly emptied into `batch` by
    /// [`BatchAdapter`]'s refill loop).
    fn run_batch(&mut self, ctx: &WorkerCtx<T>, batch: &WorkQueue<T>) -> Result<()>;

    /// Optional byte cap on the private batch queue; `None` means "drain
    /// whatever is immediately available, however much that is."
    fn batch_byte_cap(&self) -> Option<u64> {
        None
    }
}

/// Turns a [`BatchProcessor`] into a [`Worker`]: repeatedly refills a
/// private queue (blocking for at least one unit, then topping up
/// non-blockingly up to an optional byte cap) and hands the batch to
/// `run_batch` (spec §4.6.1). End-of-stream is detected on the next
/// iteration's blocking refill.
pub struct BatchAdapter<P> {
    inner: P,
}

impl<P> BatchAdapter<P> {
    /// Wrap `inner` as the per-batch body of a worker's loop.
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<T: WorkUnit, P: BatchProcessor<T>> Worker<T> for BatchAdapter<P> {
    fn run(&mut self, ctx: &WorkerCtx<T>) -> Result<()> {
        loop {
            let batch = WorkQueue::new(format!("{}:batch{}", ctx.stage_name(), ctx.id()));
            match ctx.dequeue() {
                WorkItem::EndOfStream => return Ok(()),
                WorkItem::Unit(unit) => batch.enqueue(unit)?,
            }

            let cap = self.inner.batch_byte_cap();
            loop {
                if let Some(cap) = cap {
                    if batch.bytes_held() >= cap {
                        break;
                    }
                }
                match ctx.try_dequeue() {
                    Some(unit) => batch.enqueue(unit)?,
                    None => break,
                }
            }

            self.inner.run_batch(ctx, &batch)?;
        }
    }
}

#[cfg(test)]
#[path = "worker.test.rs"]
mod tests;
