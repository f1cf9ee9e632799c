//! Allocation-request ordering policy (spec §4.4.1, §4.4.3).
//!
//! The default policy mirrors the original's priority-queue-per-stage-group
//! scheme: walk the tracker DAG once at construction time into one node per
//! stage group, wire immediate-downstream edges, derive transitive
//! downstream/upstream sets by DFS. `TrackerSet`/`DefaultAllocatorPolicy`
//! both model "stage wiring" as an arena of `petgraph` node indices rather
//! than the original's raw, aliasing pointers (redesign flag in spec §9).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::allocator::request::AllocationRequest;
use crate::error::{Result, ThemisError};

/// Orders pending allocation requests across stage groups.
///
/// Implementations must be internally synchronized: `allocate`/
/// `deallocate` call into the policy while holding the allocator's own
/// mutex, so policy methods must not themselves try to acquire any lock
/// the allocator might be holding elsewhere (locking discipline, spec §5).
pub trait AllocatorPolicy: Send + Sync {
    /// Record that `request` is now pending, under its `group`.
    fn add_request(&self, request: Arc<AllocationRequest>);

    /// Remove `request`. The policy must reject removal of anything other
    /// than the current head of a high-priority group's FIFO — callers
    /// are forbidden from removing out of order (spec §4.4.3).
    fn remove_request(&self, request: &Arc<AllocationRequest>) -> Result<()>;

    /// `true` iff `request` is the globally highest-priority pending
    /// request and its size fits in `availability`.
    fn can_schedule_request(&self, availability: u64, request: &Arc<AllocationRequest>) -> bool;

    /// The highest-priority pending request whose size fits in
    /// `availability`, if any.
    fn next_schedulable_request(&self, availability: u64) -> Option<Arc<AllocationRequest>>;

    /// The request the policy would schedule first given infinite
    /// memory — used by the deadlock resolver, which ignores size.
    fn best_request_for_deadlock_resolution(&self) -> Option<Arc<AllocationRequest>>;
}

struct StaticNode {
    #[allow(dead_code)] // kept for diagnostics / DESIGN.md traceability
    name: String,
    upstream: Vec<NodeIndex>,
    transitive_downstream: HashSet<NodeIndex>,
    transitive_upstream: HashSet<NodeIndex>,
}

struct DynamicNode {
    pending: VecDeque<Arc<AllocationRequest>>,
    high_priority: bool,
}

/// A priority-queue node per stage group, wired from the tracker DAG.
///
/// "A stage's pending-request FIFO is *high priority* iff it is non-empty
/// and no downstream stage is high priority. Among all high-priority
/// FIFOs, requests are served by oldest timestamp." (spec §4.4.3)
pub struct DefaultAllocatorPolicy {
    index_of: HashMap<String, NodeIndex>,
    static_nodes: Vec<StaticNode>,
    dynamic: Mutex<Vec<DynamicNode>>,
    highest: Mutex<Option<Arc<AllocationRequest>>>,
}

impl DefaultAllocatorPolicy {
    /// Build the priority graph from the stage DAG: `groups` lists every
    /// stage group name, `edges` lists `(upstream_group, downstream_group)`
    /// pairs mirroring the tracker DAG's immediate edges.
    pub fn from_dag(groups: &[&str], edges: &[(&str, &str)]) -> Self {
        let mut graph: DiGraph<(), ()> = DiGraph::new();
        let mut index_of = HashMap::new();
        for g in groups {
            let idx = graph.add_node(());
            index_of.insert((*g).to_string(), idx);
        }
        for (up, down) in edges {
            let u = *index_of
                .get(*up)
                .unwrap_or_else(|| panic!("unknown upstream group {up}"));
            let d = *index_of
                .get(*down)
                .unwrap_or_else(|| panic!("unknown downstream group {down}"));
            graph.add_edge(u, d, ());
        }

        let mut transitive_downstream: HashMap<NodeIndex, HashSet<NodeIndex>> = HashMap::new();
        for idx in graph.node_indices() {
            let mut dfs = Dfs::new(&graph, idx);
            dfs.next(&graph); // Dfs visits the start node first; skip it.
            let mut set = HashSet::new();
            while let Some(n) = dfs.next(&graph) {
                set.insert(n);
            }
            transitive_downstream.insert(idx, set);
        }

        let mut transitive_upstream: HashMap<NodeIndex, HashSet<NodeIndex>> =
            graph.node_indices().map(|idx| (idx, HashSet::new())).collect();
        for (&n, downs) in &transitive_downstream {
            for &d in downs {
                transitive_upstream.get_mut(&d).unwrap().insert(n);
            }
        }

        let static_nodes = groups
            .iter()
            .map(|g| {
                let idx = index_of[*g];
                StaticNode {
                    name: (*g).to_string(),
                    upstream: graph
                        .neighbors_directed(idx, petgraph::Direction::Incoming)
                        .collect(),
                    transitive_downstream: transitive_downstream.remove(&idx).unwrap_or_default(),
                    transitive_upstream: transitive_upstream.remove(&idx).unwrap_or_default(),
                }
            })
            .collect();

        let dynamic = (0..groups.len())
            .map(|_| DynamicNode {
                pending: VecDeque::new(),
                high_priority: false,
            })
            .collect();

        Self {
            index_of,
            static_nodes,
            dynamic: Mutex::new(dynamic),
            highest: Mutex::new(None),
        }
    }

    fn node_index(&self, group: &str) -> NodeIndex {
        *self
            .index_of
            .get(group)
            .unwrap_or_else(|| panic!("allocator request references unknown group {group}"))
    }

    fn recompute_highest(&self) {
        let dynamic = self.dynamic.lock().unwrap();
        let mut best: Option<Arc<AllocationRequest>> = None;
        for node in dynamic.iter() {
            if !node.high_priority {
                continue;
            }
            if let Some(head) = node.pending.front() {
                let replace = match &best {
                    None => true,
                    Some(b) => head.timestamp < b.timestamp,
                };
                if replace {
                    best = Some(head.clone());
                }
            }
        }
        *self.highest.lock().unwrap() = best;
    }

    fn has_high_priority_descendant(&self, idx: NodeIndex, dynamic: &[DynamicNode]) -> bool {
        self.static_nodes[idx.index()]
            .transitive_downstream
            .iter()
            .any(|&d| dynamic[d.index()].high_priority)
    }

    /// After a group's FIFO drains, walk its immediate-upstream nodes
    /// breadth-first, promoting the shallowest non-empty candidates that
    /// have no high-priority descendant. Only empty nodes are transparent
    /// to the walk: an empty node has nothing queued of its own, so the
    /// search looks past it to whatever feeds it. A non-empty node is
    /// always a boundary, promoted or not, because it already holds
    /// pending work that shadows anything further upstream of it.
    fn promote_after_drain(&self, drained: NodeIndex, dynamic: &mut [DynamicNode]) {
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut frontier: VecDeque<NodeIndex> =
            self.static_nodes[drained.index()].upstream.iter().copied().collect();

        while let Some(n) = frontier.pop_front() {
            if !visited.insert(n) {
                continue;
            }
            if dynamic[n.index()].pending.is_empty() {
                frontier.extend(self.static_nodes[n.index()].upstream.iter().copied());
                continue;
            }
            if dynamic[n.index()].high_priority {
                continue;
            }
            if !self.has_high_priority_descendant(n, dynamic) {
                dynamic[n.index()].high_priority = true;
            }
        }
    }
}

impl AllocatorPolicy for DefaultAllocatorPolicy {
    fn add_request(&self, request: Arc<AllocationRequest>) {
        let idx = self.node_index(&request.group);
        {
            let mut dynamic = self.dynamic.lock().unwrap();
            let was_empty = dynamic[idx.index()].pending.is_empty();
            dynamic[idx.index()].pending.push_back(request);
            if was_empty && !self.has_high_priority_descendant(idx, &dynamic) {
                dynamic[idx.index()].high_priority = true;
                for &u in &self.static_nodes[idx.index()].transitive_upstream {
                    dynamic[u.index()].high_priority = false;
                }
            }
        }
        self.recompute_highest();
    }

    fn remove_request(&self, request: &Arc<AllocationRequest>) -> Result<()> {
        let idx = self.node_index(&request.group);
        {
            let mut dynamic = self.dynamic.lock().unwrap();
            {
                let node = &mut dynamic[idx.index()];
                if !node.high_priority {
                    return Err(ThemisError::OutOfOrderRemoval {
                        group: request.group.clone(),
                    });
                }
                match node.pending.front() {
                    Some(front) if Arc::ptr_eq(front, request) => {
                        node.pending.pop_front();
                    }
                    _ => {
                        return Err(ThemisError::OutOfOrderRemoval {
                            group: request.group.clone(),
                        });
                    }
                }
                if node.pending.is_empty() {
                    node.high_priority = false;
                }
            }
            if dynamic[idx.index()].pending.is_empty() {
                self.promote_after_drain(idx, &mut dynamic);
            }
        }
        self.recompute_highest();
        Ok(())
    }

    fn can_schedule_request(&self, availability: u64, request: &Arc<AllocationRequest>) -> bool {
        let highest = self.highest.lock().unwrap();
        match highest.as_ref() {
            Some(h) => Arc::ptr_eq(h, request) && availability >= request.size(),
            None => false,
        }
    }

    fn next_schedulable_request(&self, availability: u64) -> Option<Arc<AllocationRequest>> {
        let highest = self.highest.lock().unwrap().clone();
        highest.filter(|h| h.size() <= availability)
    }

    fn best_request_for_deadlock_resolution(&self) -> Option<Arc<AllocationRequest>> {
        self.highest.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[path = "priority.test.rs"]
mod tests;
