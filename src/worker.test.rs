use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crate::metrics::NoopMetricsSink;
use crate::policy::SharedPolicy;
use crate::tracker::Tracker;
use crate::work::{SizedUnit, WorkItem};

use super::*;

type Unit = SizedUnit<u32>;

fn noop_metrics() -> Arc<dyn crate::metrics::MetricsSink> {
    Arc::new(NoopMetricsSink)
}

struct Echo;

impl SingleUnitProcessor<Unit> for Echo {
    fn process(&mut self, ctx: &WorkerCtx<Unit>, unit: Unit) -> Result<()> {
        ctx.emit(unit)
    }
}

struct Sink {
    seen: Arc<Mutex<Vec<u32>>>,
}

impl SingleUnitProcessor<Unit> for Sink {
    fn process(&mut self, _ctx: &WorkerCtx<Unit>, unit: Unit) -> Result<()> {
        self.seen.lock().unwrap().push(unit.payload);
        Ok(())
    }
}

#[test]
fn single_unit_adapter_forwards_units_and_stops_on_eos() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let upstream = Tracker::new(
        "up",
        true,
        Box::new(SharedPolicy::new("up")),
        vec![Box::new(SingleUnitAdapter::new(Echo))],
        noop_metrics(),
    );
    let downstream: Arc<Tracker<Unit>> = Tracker::new(
        "down",
        false,
        Box::new(SharedPolicy::new("down")),
        vec![Box::new(SingleUnitAdapter::new(Sink { seen: seen.clone() }))],
        noop_metrics(),
    );
    upstream.add_downstream(downstream.clone(), None).unwrap();

    upstream.add_work(WorkItem::Unit(Unit::new(8, 1))).unwrap();
    upstream.spawn();

    upstream.wait_for_workers_to_finish();
    upstream.destroy_workers();
    downstream.wait_for_workers_to_finish();
    downstream.destroy_workers();

    assert_eq!(*seen.lock().unwrap(), vec![1]);
}

struct CountingBatch {
    seen: Arc<Mutex<Vec<usize>>>,
}

impl BatchProcessor<Unit> for CountingBatch {
    fn run_batch(&mut self, _ctx: &WorkerCtx<Unit>, batch: &WorkQueue<Unit>) -> Result<()> {
        self.seen.lock().unwrap().push(batch.size());
        Ok(())
    }
}

#[test]
fn batch_adapter_drains_available_units_per_batch() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let tracker = Tracker::new(
        "batch-stage",
        true,
        Box::new(SharedPolicy::new("batch-stage")),
        vec![Box::new(BatchAdapter::new(CountingBatch { seen: seen.clone() }))],
        noop_metrics(),
    );

    for i in 0..5u32 {
        tracker.add_work(WorkItem::Unit(Unit::new(1, i))).unwrap();
    }
    tracker.spawn();
    tracker.wait_for_workers_to_finish();
    tracker.destroy_workers();

    let batches = seen.lock().unwrap();
    let total: usize = batches.iter().sum();
    assert_eq!(total, 5);
}

#[test]
fn first_wait_is_accounted_as_pipeline_saturation() {
    let tracker: Arc<Tracker<Unit>> = Tracker::new(
        "wait-stage",
        false,
        Box::new(SharedPolicy::new("wait-stage")),
        Vec::new(),
        noop_metrics(),
    );
    let idle = Arc::new(AtomicBool::new(false));
    let ctx: WorkerCtx<Unit> = WorkerCtx::new(0, tracker.clone(), idle);
    tracker.add_work(WorkItem::EndOfStream).unwrap();
    let item = ctx.dequeue();
    assert!(item.is_eos());
    assert_eq!(ctx.steady_state_wait_nanos(), 0);
}
