use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::*;
use crate::work::SizedUnit;

type U = SizedUnit<u32>;

#[test]
fn enqueue_dequeue_preserves_fifo_order() {
    let q: WorkQueue<U> = WorkQueue::new("q");
    q.enqueue(SizedUnit::new(1, 10)).unwrap();
    q.enqueue(SizedUnit::new(2, 20)).unwrap();
    q.enqueue(SizedUnit::new(3, 30)).unwrap();

    assert_eq!(q.dequeue().into_unit().unwrap().payload, 10);
    assert_eq!(q.dequeue().into_unit().unwrap().payload, 20);
    assert_eq!(q.dequeue().into_unit().unwrap().payload, 30);
}

#[test]
fn dequeue_blocks_until_closed_then_returns_eos_repeatedly() {
    let q: Arc<WorkQueue<U>> = Arc::new(WorkQueue::new("q"));
    let q2 = q.clone();
    let handle = thread::spawn(move || q2.dequeue());

    thread::sleep(Duration::from_millis(20));
    q.close();

    let item = handle.join().unwrap();
    assert!(item.is_eos());
    // A second reader must also observe EOS without anything being queued.
    assert!(q.dequeue().is_eos());
    assert!(q.dequeue().is_eos());
}

#[test]
fn enqueue_after_close_is_rejected() {
    let q: WorkQueue<U> = WorkQueue::new("q");
    q.close();
    let err = q.enqueue(SizedUnit::new(1, 0)).unwrap_err();
    assert!(matches!(err, ThemisError::ClosedQueue { .. }));
}

#[test]
fn closing_twice_is_a_no_op() {
    let q: WorkQueue<U> = WorkQueue::new("q");
    q.close();
    q.close(); // must not panic, must not un-close
    assert!(q.is_closed());
}

#[test]
fn byte_counter_tracks_held_units() {
    let q: WorkQueue<U> = WorkQueue::new("q");
    assert_eq!(q.bytes_held(), 0);
    q.enqueue(SizedUnit::new(10, 0)).unwrap();
    q.enqueue(SizedUnit::new(20, 0)).unwrap();
    assert_eq!(q.bytes_held(), 30);
    q.dequeue();
    assert_eq!(q.bytes_held(), 20);
}

#[test]
fn try_dequeue_never_blocks() {
    let q: WorkQueue<U> = WorkQueue::new("q");
    assert!(q.try_dequeue().is_none());
    q.enqueue(SizedUnit::new(1, 7)).unwrap();
    assert_eq!(q.try_dequeue().unwrap().payload, 7);
    assert!(q.try_dequeue().is_none());
}

#[test]
fn steal_up_to_moves_n_preserving_order() {
    let src: WorkQueue<U> = WorkQueue::new("src");
    let dst: WorkQueue<U> = WorkQueue::new("dst");
    for i in 0..5 {
        src.enqueue(SizedUnit::new(1, i)).unwrap();
    }
    WorkQueue::steal_up_to(&src, 3, &dst);
    assert_eq!(src.size(), 2);
    assert_eq!(dst.size(), 3);
    assert_eq!(dst.dequeue().into_unit().unwrap().payload, 0);
    assert_eq!(dst.dequeue().into_unit().unwrap().payload, 1);
    assert_eq!(dst.dequeue().into_unit().unwrap().payload, 2);
}

#[test]
fn steal_up_to_caps_at_source_size() {
    let src: WorkQueue<U> = WorkQueue::new("src");
    let dst: WorkQueue<U> = WorkQueue::new("dst");
    src.enqueue(SizedUnit::new(1, 99)).unwrap();
    WorkQueue::steal_up_to(&src, 100, &dst);
    assert_eq!(src.size(), 0);
    assert_eq!(dst.size(), 1);
}

#[test]
fn zero_sized_steal_is_a_no_op() {
    let src: WorkQueue<U> = WorkQueue::new("src");
    let dst: WorkQueue<U> = WorkQueue::new("dst");
    src.enqueue(SizedUnit::new(1, 0)).unwrap();
    WorkQueue::steal_up_to(&src, 0, &dst);
    assert_eq!(src.size(), 1);
    assert_eq!(dst.size(), 0);
}

#[test]
fn concurrent_steal_in_both_directions_does_not_deadlock() {
    let a: Arc<WorkQueue<U>> = Arc::new(WorkQueue::new("a"));
    let b: Arc<WorkQueue<U>> = Arc::new(WorkQueue::new("b"));
    for i in 0..50 {
        a.enqueue(SizedUnit::new(1, i)).unwrap();
        b.enqueue(SizedUnit::new(1, i)).unwrap();
    }

    let (a1, b1) = (a.clone(), b.clone());
    let t1 = thread::spawn(move || {
        for _ in 0..25 {
            WorkQueue::steal_up_to(&a1, 1, &b1);
        }
    });
    let (a2, b2) = (a.clone(), b.clone());
    let t2 = thread::spawn(move || {
        for _ in 0..25 {
            WorkQueue::steal_up_to(&b2, 1, &a2);
        }
    });
    t1.join().unwrap();
    t2.join().unwrap();
    assert_eq!(a.size() + b.size(), 100);
}
