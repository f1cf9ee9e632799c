//! Queueing policy: the strategy that routes work units to per-worker
//! sub-queues. The only two concrete policies the original core ships
//! (`SHARED`/work-stealing and `PARTITIONED`/hash-routed) are kept; a
//! factory builds either from a [`crate::config::QueueingPolicyKind`] plus,
//! for the partitioned case, a partition-key function supplied by the
//! caller in place of the original's "chunk map" collaborator.

use crate::error::Result;
use crate::queue::WorkQueue;
use crate::work::WorkItem;

/// The strategy that maps work units to per-worker sub-queues.
///
/// Implementations are the *only* legitimate routing authority inside a
/// tracker (spec §4.2): a tracker never reaches into a sub-queue directly.
pub trait QueueingPolicy<T>: Send + Sync {
    /// Route `unit` to whichever sub-queue the policy selects.
    fn enqueue(&self, unit: T) -> Result<()>;

    /// Block for a unit destined for `queue_id` (a worker index within
    /// the stage).
    fn dequeue(&self, queue_id: usize) -> WorkItem<T>;

    /// Non-blocking variant of [`Self::dequeue`].
    fn try_dequeue(&self, queue_id: usize) -> Option<T>;

    /// Move whatever is currently queued for `queue_id` into `into`, all
    /// at once (used by batch workers refilling their private queue).
    fn bulk_dequeue(&self, queue_id: usize, into: &WorkQueue<T>)
    where
        T: crate::work::WorkUnit;

    /// Close every sub-queue. Called by the owning tracker once every
    /// upstream tracker has signalled end-of-stream.
    fn teardown(&self);

    /// Number of sub-queues (i.e. the number of distinct `queue_id`
    /// values this policy recognizes).
    fn num_queues(&self) -> usize;
}

/// One global queue; any worker may draw from it (work stealing). Every
/// `queue_id` is an alias for the same underlying queue.
pub struct SharedPolicy<T> {
    queue: WorkQueue<T>,
}

impl<T> SharedPolicy<T> {
    /// Create a shared policy serving `num_workers` workers from one
    /// queue.
    pub fn new(stage_name: &str) -> Self {
        Self {
            queue: WorkQueue::new(format!("{stage_name}:shared")),
        }
    }
}

impl<T: crate::work::WorkUnit> QueueingPolicy<T> for SharedPolicy<T> {
    fn enqueue(&self, unit: T) -> Result<()> {
        self.queue.enqueue(unit)
    }

    fn dequeue(&self, _queue_id: usize) -> WorkItem<T> {
        self.queue.dequeue()
    }

    fn try_dequeue(&self, _queue_id: usize) -> Option<T> {
        self.queue.try_dequeue()
    }

    fn bulk_dequeue(&self, _queue_id: usize, into: &WorkQueue<T>) {
        WorkQueue::steal_up_to(&self.queue, usize::MAX, into);
    }

    fn teardown(&self) {
        self.queue.close();
    }

    fn num_queues(&self) -> usize {
        1
    }
}

/// One sub-queue per worker. The producer supplies (indirectly, via
/// `partition_fn`) a hash attribute; `enqueue` writes to the sub-queue
/// selected by `hash(attribute) mod n`.
pub struct PartitionedPolicy<T> {
    queues: Vec<WorkQueue<T>>,
    partition_fn: Box<dyn Fn(&T) -> u64 + Send + Sync>,
}

impl<T> PartitionedPolicy<T> {
    /// Create a policy with `num_workers` sub-queues. `partition_fn`
    /// extracts the hash attribute (e.g. a partition id carried in the
    /// work unit) used to pick a sub-queue on enqueue.
    pub fn new(
        stage_name: &str,
        num_workers: usize,
        partition_fn: impl Fn(&T) -> u64 + Send + Sync + 'static,
    ) -> Self {
        assert!(num_workers > 0, "partitioned policy needs >= 1 worker");
        let queues = (0..num_workers)
            .map(|i| WorkQueue::new(format!("{stage_name}:part{i}")))
            .collect();
        Self {
            queues,
            partition_fn: Box::new(partition_fn),
        }
    }
}

impl<T: crate::work::WorkUnit> QueueingPolicy<T> for PartitionedPolicy<T> {
    fn enqueue(&self, unit: T) -> Result<()> {
        let bucket = ((self.partition_fn)(&unit) as usize) % self.queues.len();
        self.queues[bucket].enqueue(unit)
    }

    fn dequeue(&self, queue_id: usize) -> WorkItem<T> {
        self.queues[queue_id].dequeue()
    }

    fn try_dequeue(&self, queue_id: usize) -> Option<T> {
        self.queues[queue_id].try_dequeue()
    }

    fn bulk_dequeue(&self, queue_id: usize, into: &WorkQueue<T>) {
        WorkQueue::steal_up_to(&self.queues[queue_id], usize::MAX, into);
    }

    fn teardown(&self) {
        for q in &self.queues {
            q.close();
        }
    }

    fn num_queues(&self) -> usize {
        self.queues.len()
    }
}

/// Which concrete policy a `(phase, stage)` pair selects, mirroring the
/// `WORK_QUEUEING_POLICY.<phase>.<stage>` configuration key (spec §6).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueingPolicyKind {
    /// One global queue; workers steal from it.
    #[default]
    Shared,
    /// One queue per worker, selected by a hash attribute.
    Partitioned,
}

/// Build a policy from configuration. The `partition_fn` is only
/// consulted for `QueueingPolicyKind::Partitioned`; in the original this
/// role is partly played by an external "chunk map" collaborator that
/// constrains which queue an ordering-sensitive work unit must land on —
/// here that collaborator is just whatever closure the caller passes.
pub fn build_policy<T: crate::work::WorkUnit + 'static>(
    stage_name: &str,
    kind: QueueingPolicyKind,
    num_workers: usize,
    partition_fn: impl Fn(&T) -> u64 + Send + Sync + 'static,
) -> Box<dyn QueueingPolicy<T>> {
    match kind {
        QueueingPolicyKind::Shared => Box::new(SharedPolicy::new(stage_name)),
        QueueingPolicyKind::Partitioned => {
            Box::new(PartitionedPolicy::new(stage_name, num_workers, partition_fn))
        }
    }
}

#[cfg(test)]
#[path = "policy.test.rs"]
mod tests;
