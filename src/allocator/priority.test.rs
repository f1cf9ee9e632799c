use super::*;
use crate::allocator::request::CallerId;

fn req(policy: &DefaultAllocatorPolicy, group: &str, size: u64) -> Arc<AllocationRequest> {
    let r = Arc::new(AllocationRequest::new(CallerId(1), group, vec![size]));
    policy.add_request(r.clone());
    r
}

#[test]
fn leaf_stage_with_no_downstream_is_high_priority_when_non_empty() {
    // Chain A -> B -> C; C has no downstream so a lone request there is
    // immediately high priority.
    let policy = DefaultAllocatorPolicy::from_dag(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
    let r = req(&policy, "c", 10);
    assert!(policy.can_schedule_request(100, &r));
}

#[test]
fn upstream_group_is_not_high_priority_while_downstream_has_pending_work() {
    let policy = DefaultAllocatorPolicy::from_dag(&["a", "b"], &[("a", "b")]);
    let ra = req(&policy, "a", 10);
    let rb = req(&policy, "b", 10);
    // b has no downstream, so it becomes high priority; a is upstream of
    // a high-priority group and must not be schedulable yet.
    assert!(policy.can_schedule_request(100, &rb));
    assert!(!policy.can_schedule_request(100, &ra));
}

#[test]
fn scenario_b_chain_grants_downstream_before_upstream() {
    // Chain A -> B -> C, capacity 300. A requests 200, B requests 100, C
    // requests 100 (spec §8 scenario B): C should be servable first, then
    // B, then A.
    let policy = DefaultAllocatorPolicy::from_dag(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
    let ra = req(&policy, "a", 200);
    let rb = req(&policy, "b", 100);
    let rc = req(&policy, "c", 100);

    assert!(policy.can_schedule_request(300, &rc));
    assert!(!policy.can_schedule_request(300, &rb));
    assert!(!policy.can_schedule_request(300, &ra));

    policy.remove_request(&rc).unwrap();
    assert!(policy.can_schedule_request(300, &rb));
    assert!(!policy.can_schedule_request(300, &ra));

    policy.remove_request(&rb).unwrap();
    assert!(policy.can_schedule_request(300, &ra));
}

#[test]
fn within_a_group_requests_are_served_fifo_by_timestamp() {
    let policy = DefaultAllocatorPolicy::from_dag(&["x"], &[]);
    let r1 = req(&policy, "x", 10);
    let r2 = req(&policy, "x", 10);
    let next = policy.next_schedulable_request(100).unwrap();
    assert!(Arc::ptr_eq(&next, &r1));
    policy.remove_request(&r1).unwrap();
    let next = policy.next_schedulable_request(100).unwrap();
    assert!(Arc::ptr_eq(&next, &r2));
}

#[test]
fn removing_a_request_that_is_not_the_head_is_rejected() {
    let policy = DefaultAllocatorPolicy::from_dag(&["x"], &[]);
    let r1 = req(&policy, "x", 10);
    let r2 = req(&policy, "x", 10);
    let err = policy.remove_request(&r2).unwrap_err();
    assert!(matches!(err, ThemisError::OutOfOrderRemoval { .. }));
    policy.remove_request(&r1).unwrap(); // still legal
}

#[test]
fn next_schedulable_respects_available_bytes() {
    let policy = DefaultAllocatorPolicy::from_dag(&["x"], &[]);
    let r = req(&policy, "x", 50);
    assert!(policy.next_schedulable_request(49).is_none());
    assert!(policy.next_schedulable_request(50).unwrap().id.0 == r.id.0);
}

#[test]
fn best_request_for_deadlock_resolution_ignores_size() {
    let policy = DefaultAllocatorPolicy::from_dag(&["x"], &[]);
    let r = req(&policy, "x", 10_000_000);
    let best = policy.best_request_for_deadlock_resolution().unwrap();
    assert!(Arc::ptr_eq(&best, &r));
}

#[test]
fn diamond_dag_promotes_shallowest_candidate_after_drain() {
    // a -> b -> d, a -> c -> d (diamond). d is the sink.
    let policy =
        DefaultAllocatorPolicy::from_dag(&["a", "b", "c", "d"], &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
    let rd = req(&policy, "d", 10);
    let rb = req(&policy, "b", 10);
    let rc = req(&policy, "c", 10);
    let ra = req(&policy, "a", 10);

    // only d (the sink) starts high priority.
    assert!(policy.can_schedule_request(100, &rd));
    assert!(!policy.can_schedule_request(100, &rb));
    assert!(!policy.can_schedule_request(100, &rc));
    assert!(!policy.can_schedule_request(100, &ra));

    policy.remove_request(&rd).unwrap();
    // both b and c are immediate upstreams of d and neither has a
    // high-priority descendant anymore; both become high priority.
    assert!(policy.can_schedule_request(100, &rb) || policy.can_schedule_request(100, &rc));
    assert!(!policy.can_schedule_request(100, &ra));
}
