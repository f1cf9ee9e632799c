use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::metrics::RecordingMetricsSink;
use crate::policy::{PartitionedPolicy, SharedPolicy};
use crate::quota::MemoryQuota;
use crate::work::SizedUnit;
use crate::worker::{SingleUnitAdapter, SingleUnitProcessor, Worker, WorkerCtx};

use super::*;

type Unit = SizedUnit<u32>;

struct Collect {
    seen: Arc<Mutex<Vec<u32>>>,
}

impl SingleUnitProcessor<Unit> for Collect {
    fn process(&mut self, _ctx: &WorkerCtx<Unit>, unit: Unit) -> Result<()> {
        self.seen.lock().unwrap().push(unit.payload);
        Ok(())
    }
}

fn collector(seen: Arc<Mutex<Vec<u32>>>) -> Vec<Box<dyn Worker<Unit>>> {
    vec![Box::new(SingleUnitAdapter::new(Collect { seen }))]
}

#[test]
fn end_to_end_propagates_units_and_end_of_stream() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let metrics = RecordingMetricsSink::new();
    let upstream: Arc<Tracker<Unit>> = Tracker::new(
        "source",
        true,
        Box::new(SharedPolicy::new("source")),
        vec![Box::new(SingleUnitAdapter::new(Passthrough))],
        metrics.clone(),
    );
    let downstream = Tracker::new(
        "sink",
        false,
        Box::new(SharedPolicy::new("sink")),
        collector(seen.clone()),
        metrics.clone(),
    );
    upstream.add_downstream(downstream.clone(), None).unwrap();

    for i in 0..3u32 {
        upstream.add_work(WorkItem::Unit(Unit::new(4, i))).unwrap();
    }
    upstream.spawn();

    upstream.wait_for_workers_to_finish();
    upstream.destroy_workers();
    downstream.wait_for_workers_to_finish();
    downstream.destroy_workers();

    let mut got = seen.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, vec![0, 1, 2]);

    let samples = metrics.samples();
    assert!(samples.iter().any(|(name, _)| name == "source.runtime_seconds"));
    assert!(samples.iter().any(|(name, _)| name == "sink.runtime_seconds"));
}

struct Passthrough;

impl SingleUnitProcessor<Unit> for Passthrough {
    fn process(&mut self, ctx: &WorkerCtx<Unit>, unit: Unit) -> Result<()> {
        ctx.emit(unit)
    }
}

#[test]
fn multiple_upstreams_must_all_signal_before_eos_propagates() {
    let downstream: Arc<Tracker<Unit>> = Tracker::new(
        "merge",
        false,
        Box::new(SharedPolicy::new("merge")),
        Vec::new(),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    let up_a: Arc<Tracker<Unit>> = Tracker::new(
        "a",
        true,
        Box::new(SharedPolicy::new("a")),
        Vec::new(),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    let up_b: Arc<Tracker<Unit>> = Tracker::new(
        "b",
        true,
        Box::new(SharedPolicy::new("b")),
        Vec::new(),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    up_a.add_downstream(downstream.clone(), None).unwrap();
    up_b.add_downstream(downstream.clone(), None).unwrap();

    up_a.add_work(WorkItem::EndOfStream).unwrap();
    assert!(!downstream.closed.load(Ordering::Acquire));
    up_b.add_work(WorkItem::EndOfStream).unwrap();
    assert!(downstream.closed.load(Ordering::Acquire));
}

#[test]
fn named_downstream_routes_to_the_right_tracker() {
    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));
    let down_a = Tracker::new(
        "down-a",
        false,
        Box::new(SharedPolicy::new("down-a")),
        collector(seen_a.clone()),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    let down_b = Tracker::new(
        "down-b",
        false,
        Box::new(SharedPolicy::new("down-b")),
        collector(seen_b.clone()),
        Arc::new(crate::metrics::NoopMetricsSink),
    );

    struct Router;
    impl SingleUnitProcessor<Unit> for Router {
        fn process(&mut self, ctx: &WorkerCtx<Unit>, unit: Unit) -> Result<()> {
            if unit.payload % 2 == 0 {
                ctx.emit_named("even", unit)
            } else {
                ctx.emit_named("odd", unit)
            }
        }
    }

    let router: Arc<Tracker<Unit>> = Tracker::new(
        "router",
        true,
        Box::new(SharedPolicy::new("router")),
        vec![Box::new(SingleUnitAdapter::new(Router))],
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    router.add_downstream(down_a.clone(), Some("even")).unwrap();
    router.add_downstream(down_b.clone(), Some("odd")).unwrap();

    for i in 0..4u32 {
        router.add_work(WorkItem::Unit(Unit::new(1, i))).unwrap();
    }
    router.spawn();
    router.wait_for_workers_to_finish();
    router.destroy_workers();
    down_a.wait_for_workers_to_finish();
    down_a.destroy_workers();
    down_b.wait_for_workers_to_finish();
    down_b.destroy_workers();

    let mut a = seen_a.lock().unwrap().clone();
    a.sort();
    let mut b = seen_b.lock().unwrap().clone();
    b.sort();
    assert_eq!(a, vec![0, 2]);
    assert_eq!(b, vec![1, 3]);
}

#[test]
fn duplicate_downstream_name_is_an_error() {
    let tracker: Arc<Tracker<Unit>> = Tracker::new(
        "t",
        false,
        Box::new(SharedPolicy::new("t")),
        Vec::new(),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    let d1: Arc<Tracker<Unit>> = Tracker::new(
        "d1",
        false,
        Box::new(SharedPolicy::new("d1")),
        Vec::new(),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    let d2: Arc<Tracker<Unit>> = Tracker::new(
        "d2",
        false,
        Box::new(SharedPolicy::new("d2")),
        Vec::new(),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    tracker.add_downstream(d1, Some("out")).unwrap();
    let err = tracker.add_downstream(d2, Some("out")).unwrap_err();
    assert!(matches!(err, ThemisError::DuplicateDownstreamName { .. }));
}

#[test]
fn emit_to_unregistered_name_is_an_error() {
    struct BadEmit;
    impl SingleUnitProcessor<Unit> for BadEmit {
        fn process(&mut self, ctx: &WorkerCtx<Unit>, unit: Unit) -> Result<()> {
            ctx.emit_named("nope", unit)
        }
    }
    let tracker: Arc<Tracker<Unit>> = Tracker::new(
        "t",
        true,
        Box::new(SharedPolicy::new("t")),
        Vec::new(),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    let idle = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let ctx: WorkerCtx<Unit> = WorkerCtx::new(0, tracker.clone(), idle);
    let err = ctx.emit_named("nope", Unit::new(1, 0)).unwrap_err();
    assert!(matches!(err, ThemisError::UnknownDownstream { .. }));
}

#[test]
fn quota_enforcing_tracker_charges_and_credits() {
    let producer = Arc::new(MemoryQuota::new("producer", 16));
    let consumer = Arc::new(MemoryQuota::new("consumer", 16));
    let tracker: Arc<Tracker<Unit>> = Tracker::new_with_quotas(
        "quota-stage",
        false,
        Box::new(SharedPolicy::new("quota-stage")),
        Vec::new(),
        Arc::new(crate::metrics::NoopMetricsSink),
        Some(producer.clone()),
        Some(consumer.clone()),
    );

    tracker.add_work(WorkItem::Unit(Unit::new(10, 1))).unwrap();
    assert_eq!(producer.in_flight(), 10);

    let idle = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let ctx: WorkerCtx<Unit> = WorkerCtx::new(0, tracker.clone(), idle);
    let item = ctx.dequeue();
    assert!(matches!(item, WorkItem::Unit(_)));
    assert_eq!(consumer.in_flight(), 0);

    // This test wires independent producer/consumer quotas to exercise
    // charge and credit in isolation; a real pipeline shares one
    // `MemoryQuota` between an upstream's producer side and a
    // downstream's consumer side, so the downstream's own dequeue is
    // what drains it. Drain the producer side by hand here so the test
    // doesn't leave bytes in flight at destruction (spec §4.3: fatal).
    producer.remove_usage(10).unwrap();
}

#[test]
fn emitter_countdown_sink_scenario_d() {
    const COUNTDOWN_NUMBER: u32 = 3;

    struct Emit;
    impl SingleUnitProcessor<Unit> for Emit {
        fn process(&mut self, ctx: &WorkerCtx<Unit>, unit: Unit) -> Result<()> {
            ctx.emit(unit)
        }
    }

    // The first emitter only posts its own end-of-stream downstream once
    // Countdown has finished wiring up the second emitter as an
    // additional upstream; otherwise Countdown could see
    // `upstream_completed == upstream_count` (1 == 1) and close before
    // the second emitter is even registered.
    struct GatedEmit {
        rewired: Arc<(Mutex<bool>, std::sync::Condvar)>,
    }
    impl Worker<Unit> for GatedEmit {
        fn run(&mut self, ctx: &WorkerCtx<Unit>) -> Result<()> {
            loop {
                match ctx.dequeue() {
                    WorkItem::EndOfStream => return Ok(()),
                    WorkItem::Unit(unit) => ctx.emit(unit)?,
                }
            }
        }

        fn teardown(&mut self, _ctx: &WorkerCtx<Unit>) -> Result<()> {
            let (lock, cv) = &*self.rewired;
            let mut done = lock.lock().unwrap();
            while !*done {
                done = cv.wait(done).unwrap();
            }
            Ok(())
        }
    }

    struct Countdown {
        threshold: u32,
        count: u32,
        self_ref: Arc<Mutex<Option<Arc<Tracker<Unit>>>>>,
        rewired: Arc<(Mutex<bool>, std::sync::Condvar)>,
    }
    impl Worker<Unit> for Countdown {
        fn run(&mut self, ctx: &WorkerCtx<Unit>) -> Result<()> {
            loop {
                match ctx.dequeue() {
                    WorkItem::EndOfStream => return Ok(()),
                    WorkItem::Unit(_unit) => {
                        self.count += 1;
                        if self.count == self.threshold {
                            let myself = self
                                .self_ref
                                .lock()
                                .unwrap()
                                .clone()
                                .expect("countdown tracker registered before spawn");
                            let second: Arc<Tracker<Unit>> = Tracker::new(
                                "emitter-2",
                                true,
                                Box::new(SharedPolicy::new("emitter-2")),
                                vec![Box::new(SingleUnitAdapter::new(Emit))],
                                Arc::new(crate::metrics::NoopMetricsSink),
                            );
                            second.add_downstream(myself, None).unwrap();
                            for i in 0..3u32 {
                                second
                                    .add_work(WorkItem::Unit(Unit::new(1, self.threshold + i)))
                                    .unwrap();
                            }
                            second.spawn();

                            let (lock, cv) = &*self.rewired;
                            *lock.lock().unwrap() = true;
                            cv.notify_all();
                        }
                    }
                }
            }
        }

        fn teardown(&mut self, ctx: &WorkerCtx<Unit>) -> Result<()> {
            ctx.emit(Unit::new(1, self.count))
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Tracker::new(
        "sink",
        false,
        Box::new(SharedPolicy::new("sink")),
        collector(seen.clone()),
        Arc::new(crate::metrics::NoopMetricsSink),
    );

    let countdown_self: Arc<Mutex<Option<Arc<Tracker<Unit>>>>> = Arc::new(Mutex::new(None));
    let rewired = Arc::new((Mutex::new(false), std::sync::Condvar::new()));

    let countdown: Arc<Tracker<Unit>> = Tracker::new(
        "countdown",
        false,
        Box::new(SharedPolicy::new("countdown")),
        vec![Box::new(Countdown {
            threshold: COUNTDOWN_NUMBER,
            count: 0,
            self_ref: countdown_self.clone(),
            rewired: rewired.clone(),
        })],
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    *countdown_self.lock().unwrap() = Some(countdown.clone());
    countdown.add_downstream(sink.clone(), None).unwrap();

    let emitter: Arc<Tracker<Unit>> = Tracker::new(
        "emitter",
        true,
        Box::new(SharedPolicy::new("emitter")),
        vec![Box::new(GatedEmit {
            rewired: rewired.clone(),
        })],
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    emitter.add_downstream(countdown.clone(), None).unwrap();

    for i in 0..3u32 {
        emitter.add_work(WorkItem::Unit(Unit::new(1, i))).unwrap();
    }
    emitter.spawn();

    emitter.wait_for_workers_to_finish();
    emitter.destroy_workers();
    countdown.wait_for_workers_to_finish();
    countdown.destroy_workers();
    sink.wait_for_workers_to_finish();
    sink.destroy_workers();

    assert_eq!(seen.lock().unwrap().clone(), vec![6]);
}

#[test]
fn multi_destination_named_routing_scenario_f() {
    let red = Arc::new(Mutex::new(Vec::new()));
    let blue = Arc::new(Mutex::new(Vec::new()));
    let green = Arc::new(Mutex::new(Vec::new()));
    let default = Arc::new(Mutex::new(Vec::new()));

    type Word = SizedUnit<&'static str>;

    fn word_collector(seen: Arc<Mutex<Vec<&'static str>>>) -> Vec<Box<dyn Worker<Word>>> {
        struct Collect {
            seen: Arc<Mutex<Vec<&'static str>>>,
        }
        impl SingleUnitProcessor<Word> for Collect {
            fn process(&mut self, _ctx: &WorkerCtx<Word>, unit: Word) -> Result<()> {
                self.seen.lock().unwrap().push(unit.payload);
                Ok(())
            }
        }
        vec![Box::new(SingleUnitAdapter::new(Collect { seen }))]
    }

    let down_red = Tracker::new(
        "down-red",
        false,
        Box::new(SharedPolicy::new("down-red")),
        word_collector(red.clone()),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    let down_blue = Tracker::new(
        "down-blue",
        false,
        Box::new(SharedPolicy::new("down-blue")),
        word_collector(blue.clone()),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    let down_green = Tracker::new(
        "down-green",
        false,
        Box::new(SharedPolicy::new("down-green")),
        word_collector(green.clone()),
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    let down_default = Tracker::new(
        "down-default",
        false,
        Box::new(SharedPolicy::new("down-default")),
        word_collector(default.clone()),
        Arc::new(crate::metrics::NoopMetricsSink),
    );

    struct Router;
    impl SingleUnitProcessor<Word> for Router {
        fn process(&mut self, ctx: &WorkerCtx<Word>, unit: Word) -> Result<()> {
            match unit.payload {
                "red" | "blue" | "green" => ctx.emit_named(unit.payload, unit),
                _ => ctx.emit(unit),
            }
        }
    }

    let router: Arc<Tracker<Word>> = Tracker::new(
        "router",
        true,
        Box::new(SharedPolicy::new("router")),
        vec![Box::new(SingleUnitAdapter::new(Router))],
        Arc::new(crate::metrics::NoopMetricsSink),
    );
    // Default destination registered first (no name), so `ctx.emit`
    // reaches it as the first-registered downstream.
    router.add_downstream(down_default.clone(), None).unwrap();
    router.add_downstream(down_red.clone(), Some("red")).unwrap();
    router.add_downstream(down_blue.clone(), Some("blue")).unwrap();
    router.add_downstream(down_green.clone(), Some("green")).unwrap();

    let input = [
        "green", "red", "blam", "red", "blue", "ham", "green", "spam", "blue", "green",
    ];
    for word in input.iter() {
        router
            .add_work(WorkItem::Unit(Word::new(1, *word)))
            .unwrap();
    }
    router.spawn();
    router.wait_for_workers_to_finish();
    router.destroy_workers();
    down_red.wait_for_workers_to_finish();
    down_red.destroy_workers();
    down_blue.wait_for_workers_to_finish();
    down_blue.destroy_workers();
    down_green.wait_for_workers_to_finish();
    down_green.destroy_workers();
    down_default.wait_for_workers_to_finish();
    down_default.destroy_workers();

    assert_eq!(red.lock().unwrap().clone(), vec!["red", "red"]);
    assert_eq!(blue.lock().unwrap().clone(), vec!["blue", "blue"]);
    assert_eq!(green.lock().unwrap().clone(), vec!["green", "green", "green"]);
    assert_eq!(default.lock().unwrap().clone(), vec!["blam", "ham", "spam"]);
}

#[test]
fn partitioned_policy_routes_by_hash_and_spawn_is_idempotent() {
    let counts = Arc::new(Mutex::new(vec![0usize; 2]));
    struct Counting {
        id: usize,
        counts: Arc<Mutex<Vec<usize>>>,
    }
    impl SingleUnitProcessor<Unit> for Counting {
        fn process(&mut self, _ctx: &WorkerCtx<Unit>, _unit: Unit) -> Result<()> {
            self.counts.lock().unwrap()[self.id] += 1;
            Ok(())
        }
    }

    let workers: Vec<Box<dyn Worker<Unit>>> = (0..2)
        .map(|id| {
            Box::new(SingleUnitAdapter::new(Counting {
                id,
                counts: counts.clone(),
            })) as Box<dyn Worker<Unit>>
        })
        .collect();

    let tracker: Arc<Tracker<Unit>> = Tracker::new(
        "partitioned",
        true,
        Box::new(PartitionedPolicy::new("partitioned", 2, |u: &Unit| {
            u.partition_key
        })),
        workers,
        Arc::new(crate::metrics::NoopMetricsSink),
    );

    for i in 0..6u32 {
        tracker
            .add_work(WorkItem::Unit(Unit::with_partition(1, i % 2, i)))
            .unwrap();
    }
    tracker.spawn();
    tracker.spawn(); // idempotent
    tracker.wait_for_workers_to_finish();
    tracker.destroy_workers();

    let counts = counts.lock().unwrap();
    assert_eq!(counts[0], 3);
    assert_eq!(counts[1], 3);
}
