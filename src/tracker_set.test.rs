use std::sync::Arc;

use crate::metrics::NoopMetricsSink;
use crate::policy::SharedPolicy;
use crate::work::SizedUnit;
use crate::worker::Worker;

use super::*;

type Unit = SizedUnit<u32>;

fn tracker(name: &str, is_source: bool) -> Arc<Tracker<Unit>> {
    Tracker::new(
        name,
        is_source,
        Box::new(SharedPolicy::new(name)),
        Vec::<Box<dyn Worker<Unit>>>::new(),
        Arc::new(NoopMetricsSink),
    )
}

#[test]
fn acyclic_linear_chain_passes_the_assertion() {
    let a = tracker("a", true);
    let b = tracker("b", false);
    let c = tracker("c", false);
    a.add_downstream(b.clone(), None).unwrap();
    b.add_downstream(c.clone(), None).unwrap();

    let mut set = TrackerSet::new();
    set.register(a);
    set.register(b);
    set.register(c);

    assert!(set.assert_acyclic().is_ok());
}

#[test]
fn a_cycle_is_rejected() {
    let a = tracker("a", true);
    let b = tracker("b", false);
    a.add_downstream(b.clone(), None).unwrap();
    b.add_downstream(a.clone(), None).unwrap();

    let mut set = TrackerSet::new();
    set.register(a);
    set.register(b);

    let err = set.assert_acyclic().unwrap_err();
    assert!(matches!(err, ThemisError::CyclicDag { .. }));
}

#[test]
fn spawn_only_starts_source_trackers_directly() {
    let source = tracker("source", true);
    let downstream = tracker("downstream", false);
    source.add_downstream(downstream.clone(), None).unwrap();

    let mut set = TrackerSet::new();
    set.register(source.clone());
    set.register(downstream.clone());

    set.spawn();
    set.wait_for_workers_to_finish();
    set.destroy_workers();

    // Both should have completed: source posts eos to itself at spawn,
    // which (with zero workers) immediately propagates to downstream.
    assert!(source.downstream_trackers().len() == 1);
}

#[test]
fn a_disconnected_non_source_tracker_completes_with_no_emitted_work() {
    let orphan = tracker("orphan", false);

    let mut set = TrackerSet::new();
    set.register(orphan.clone());

    set.spawn();
    set.wait_for_workers_to_finish();
    set.destroy_workers();

    assert!(orphan.downstream_trackers().is_empty());
}
