use std::sync::Arc;
use std::thread;

use super::*;
use crate::queue::WorkQueue;
use crate::work::SizedUnit;

type U = SizedUnit<u32>;

#[test]
fn shared_policy_every_id_aliases_the_same_queue() {
    let policy: SharedPolicy<U> = SharedPolicy::new("stage");
    policy.enqueue(SizedUnit::new(1, 1)).unwrap();
    policy.enqueue(SizedUnit::new(1, 2)).unwrap();
    assert_eq!(policy.dequeue(0).into_unit().unwrap().payload, 1);
    assert_eq!(policy.dequeue(7).into_unit().unwrap().payload, 2);
}

#[test]
fn shared_policy_supports_work_stealing_via_bulk_dequeue() {
    let policy: SharedPolicy<U> = SharedPolicy::new("stage");
    for i in 0..3 {
        policy.enqueue(SizedUnit::new(1, i)).unwrap();
    }
    let drain: WorkQueue<U> = WorkQueue::new("drain");
    policy.bulk_dequeue(0, &drain);
    assert_eq!(drain.size(), 3);
}

#[test]
fn partitioned_policy_routes_by_hash_attribute() {
    let policy: PartitionedPolicy<U> = PartitionedPolicy::new("stage", 2, |u| u.partition_key);
    policy
        .enqueue(SizedUnit::with_partition(1, 0, "a"))
        .unwrap();
    policy
        .enqueue(SizedUnit::with_partition(1, 1, "b"))
        .unwrap();
    policy
        .enqueue(SizedUnit::with_partition(1, 2, "c"))
        .unwrap();

    // key 0 and key 2 both land on bucket 0 (2 % 2 == 0); key 1 on bucket 1.
    assert_eq!(policy.try_dequeue(0).unwrap().payload, "a");
    assert_eq!(policy.try_dequeue(0).unwrap().payload, "c");
    assert_eq!(policy.try_dequeue(1).unwrap().payload, "b");
}

#[test]
fn partitioned_policy_preserves_order_within_a_bucket() {
    let policy: PartitionedPolicy<U> = PartitionedPolicy::new("stage", 1, |_| 0);
    for i in 0..10 {
        policy.enqueue(SizedUnit::new(1, i)).unwrap();
    }
    for i in 0..10 {
        assert_eq!(policy.dequeue(0).into_unit().unwrap().payload, i);
    }
}

#[test]
fn teardown_closes_every_sub_queue() {
    let policy: PartitionedPolicy<U> = PartitionedPolicy::new("stage", 3, |u| u.partition_key);
    policy.teardown();
    for id in 0..3 {
        assert!(policy.dequeue(id).is_eos());
    }
}

#[test]
fn factory_builds_the_configured_kind() {
    let shared = build_policy::<U>("s", QueueingPolicyKind::Shared, 4, |u| u.partition_key);
    assert_eq!(shared.num_queues(), 1);
    let partitioned = build_policy::<U>("p", QueueingPolicyKind::Partitioned, 4, |u| u.partition_key);
    assert_eq!(partitioned.num_queues(), 4);
}

#[test]
fn concurrent_workers_draw_from_a_shared_policy_without_duplication() {
    let policy = Arc::new(SharedPolicy::<U>::new("stage"));
    for i in 0..100 {
        policy.enqueue(SizedUnit::new(1, i)).unwrap();
    }
    policy.teardown();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let p = policy.clone();
        handles.push(thread::spawn(move || {
            let mut count = 0u32;
            loop {
                match p.dequeue(0) {
                    WorkItem::Unit(_) => count += 1,
                    WorkItem::EndOfStream => break,
                }
            }
            count
        }));
    }
    let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 100);
}
