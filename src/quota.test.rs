use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::*;

#[test]
fn add_usage_within_budget_does_not_block() {
    let q = MemoryQuota::new("q", 100);
    q.add_usage(60);
    assert_eq!(q.in_flight(), 60);
    q.remove_usage(60).unwrap();
}

#[test]
fn add_usage_blocks_until_room_is_freed() {
    let q = Arc::new(MemoryQuota::new("q", 100));
    q.add_usage(80);

    let q2 = q.clone();
    let handle = thread::spawn(move || {
        q2.add_usage(50); // needs 30 bytes freed first
    });

    thread::sleep(Duration::from_millis(20));
    assert!(!handle.is_finished());

    q.remove_usage(40).unwrap();
    handle.join().unwrap();
    assert_eq!(q.in_flight(), 90);
    q.remove_usage(90).unwrap();
}

#[test]
fn remove_usage_past_in_flight_is_an_error() {
    let q = MemoryQuota::new("q", 100);
    q.add_usage(10);
    let err = q.remove_usage(20).unwrap_err();
    assert!(matches!(err, ThemisError::QuotaUnderflow { .. }));
    q.remove_usage(10).unwrap();
}

#[test]
fn assert_drained_reflects_in_flight_state() {
    let q = MemoryQuota::new("q", 100);
    assert!(q.assert_drained().is_ok());
    q.add_usage(5);
    assert!(q.assert_drained().is_err());
    q.remove_usage(5).unwrap();
    assert!(q.assert_drained().is_ok());
}

#[test]
fn exactly_at_budget_is_legal() {
    let q = MemoryQuota::new("q", 50);
    q.add_usage(50);
    assert_eq!(q.in_flight(), 50);
    q.remove_usage(50).unwrap();
}
