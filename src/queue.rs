//! Bounded, blocking, single-producer-multi-consumer FIFO of work units.
//!
//! Mirrors `core/ThreadSafeQueue.h`'s role in the original core: one mutex
//! plus one condition variable per queue (locking discipline, spec §5),
//! sticky `closed` flag, and a byte counter kept in step with the
//! contents so quota-enforcing trackers can read it without re-summing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::{Result, ThemisError};
use crate::work::WorkItem;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A FIFO of work units of type `T`, with end-of-stream closure semantics.
///
/// `T` is typically `Box<dyn WorkUnit>`; tests frequently use a concrete
/// `SizedUnit<P>` directly since a bare struct is also `WorkUnit`.
pub struct WorkQueue<T> {
    /// Stable identity used to order lock acquisition in `steal_up_to` —
    /// the original compares raw pointers; this compares a per-queue
    /// sequence number assigned at construction, which is just as total an
    /// order and doesn't depend on allocator addresses.
    id: u64,
    name: String,
    inner: Mutex<Inner<T>>,
    not_empty_or_closed: Condvar,
    bytes_held: AtomicU64,
}

fn next_queue_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl<T: crate::work::WorkUnit> WorkQueue<T> {
    /// Create an empty, open queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: next_queue_id(),
            name: name.into(),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty_or_closed: Condvar::new(),
            bytes_held: AtomicU64::new(0),
        }
    }

    /// Diagnostic name (generally the stage/worker id this queue serves).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sum of `current_size_in_bytes()` over all units currently held.
    pub fn bytes_held(&self) -> u64 {
        self.bytes_held.load(Ordering::Acquire)
    }

    /// Number of units currently queued (does not include EOS, which is
    /// never stored — see `dequeue`).
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// `true` once `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Push a unit. Fails with [`ThemisError::ClosedQueue`] if the queue
    /// has already been closed.
    pub fn enqueue(&self, unit: T) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return Err(ThemisError::ClosedQueue {
                queue: self.name.clone(),
            });
        }
        self.bytes_held
            .fetch_add(unit.current_size_in_bytes(), Ordering::AcqRel);
        guard.items.push_back(unit);
        drop(guard);
        self.not_empty_or_closed.notify_one();
        Ok(())
    }

    /// Block until a unit is available or the queue is drained and
    /// closed. In the latter case returns `WorkItem::EndOfStream` without
    /// mutating the queue, so every concurrent reader observes it.
    pub fn dequeue(&self) -> WorkItem<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(unit) = guard.items.pop_front() {
                self.bytes_held
                    .fetch_sub(unit.current_size_in_bytes(), Ordering::AcqRel);
                return WorkItem::Unit(unit);
            }
            if guard.closed {
                return WorkItem::EndOfStream;
            }
            guard = self.not_empty_or_closed.wait(guard).unwrap();
        }
    }

    /// Non-blocking dequeue: `Some(unit)` if one was immediately
    /// available, `None` otherwise (including the drained-and-closed
    /// case — callers distinguish that via `is_closed`/`size`).
    pub fn try_dequeue(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        let unit = guard.items.pop_front();
        if let Some(ref u) = unit {
            self.bytes_held
                .fetch_sub(u.current_size_in_bytes(), Ordering::AcqRel);
        }
        unit
    }

    /// Mark the queue closed. Idempotent: closing an already-closed queue
    /// is a no-op (spec §8 boundary behavior).
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return;
        }
        guard.closed = true;
        drop(guard);
        self.not_empty_or_closed.notify_all();
    }

    /// Move up to `n` units (all of them, if `n` exceeds the current
    /// size) from `src` to `dst`, preserving FIFO order, atomically with
    /// respect to either queue's own push/pop. Zero-sized steal is a
    /// no-op (spec §8 boundary behavior).
    ///
    /// Both queues' locks are acquired in a fixed global order (by `id`)
    /// regardless of which is `src` and which is `dst`, so two concurrent
    /// steals between the same pair of queues in opposite directions
    /// cannot deadlock.
    pub fn steal_up_to(src: &Self, n: usize, dst: &Self) {
        if n == 0 {
            return;
        }

        // SAFETY-free, just order by id: lower id locks first.
        let (first, second) = if src.id < dst.id { (src, dst) } else { (dst, src) };
        let first_guard = first.inner.lock().unwrap();
        let second_guard = second.inner.lock().unwrap();

        // After establishing the fixed lock order, figure out which guard
        // is actually src's and which is dst's.
        let (mut src_guard, mut dst_guard) = if std::ptr::eq(first, src) {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        };

        let moved = n.min(src_guard.items.len());
        for _ in 0..moved {
            let unit = src_guard.items.pop_front().expect("bounded by moved");
            let size = unit.current_size_in_bytes();
            src.bytes_held.fetch_sub(size, Ordering::AcqRel);
            dst.bytes_held.fetch_add(size, Ordering::AcqRel);
            dst_guard.items.push_back(unit);
        }

        drop(src_guard);
        drop(dst_guard);
        if moved > 0 {
            dst.not_empty_or_closed.notify_all();
        }
    }
}

#[cfg(test)]
#[path = "queue.test.rs"]
mod tests;
