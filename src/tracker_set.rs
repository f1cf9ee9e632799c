//! Tracker set (spec §4.6.3): holds every tracker in one pipeline's DAG,
//! tracks which are sources, and fans `spawn`/`wait_for_workers_to_finish`/
//! `destroy_workers` out across all of them. Cycle detection reuses
//! `petgraph`, exactly as the priority policy's stage graph does (spec
//! §9 redesign flag: arena + handle DAG instead of raw pointers).

use std::collections::HashMap;

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Result, ThemisError};
use crate::tracker::Tracker;
use crate::work::WorkUnit;

/// Every tracker belonging to one pipeline's DAG.
pub struct TrackerSet<T: WorkUnit> {
    trackers: HashMap<String, std::sync::Arc<Tracker<T>>>,
}

impl<T: WorkUnit + 'static> TrackerSet<T> {
    /// An empty set.
    pub fn new() -> Self {
        Self {
            trackers: HashMap::new(),
        }
    }

    /// Add a tracker to the set, keyed by its stage name. Panics on a
    /// duplicate stage name — a programmer error in pipeline assembly,
    /// not a runtime condition spec.md classifies as fatal-but-testable.
    pub fn register(&mut self, tracker: std::sync::Arc<Tracker<T>>) {
        let name = tracker.stage_name().to_string();
        assert!(
            self.trackers.insert(name.clone(), tracker).is_none(),
            "duplicate tracker stage name {name} in TrackerSet"
        );
    }

    /// Every tracker in the set, in no particular order.
    pub fn trackers(&self) -> impl Iterator<Item = &std::sync::Arc<Tracker<T>>> {
        self.trackers.values()
    }

    /// Assert the registered trackers form a rooted DAG (spec §4.6.3:
    /// "the implementer is free to assert this on construction"). Walks
    /// every tracker's `downstream_trackers()` to build the edge list,
    /// then checks for a nontrivial strongly-connected component (a
    /// cycle) via Kosaraju's algorithm.
    pub fn assert_acyclic(&self) -> Result<()> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index_of: HashMap<String, NodeIndex> = HashMap::new();
        for name in self.trackers.keys() {
            let idx = graph.add_node(name.clone());
            index_of.insert(name.clone(), idx);
        }
        for (name, tracker) in &self.trackers {
            let from = index_of[name];
            for downstream in tracker.downstream_trackers() {
                if let Some(&to) = index_of.get(downstream.stage_name()) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        for component in kosaraju_scc(&graph) {
            if component.len() > 1 {
                let stage = graph[component[0]].clone();
                return Err(ThemisError::CyclicDag { stage });
            }
            // A single-node component with a self-loop is also a cycle.
            let idx = component[0];
            if graph.find_edge(idx, idx).is_some() {
                return Err(ThemisError::CyclicDag {
                    stage: graph[idx].clone(),
                });
            }
        }
        Ok(())
    }

    /// Spawn the source trackers; non-sources are brought up
    /// transitively as their upstream spawns (spec §4.6.3). A non-source
    /// tracker with zero wired upstreams would otherwise never be
    /// reached by that transitive spawn, so it is spawned directly too —
    /// it completes immediately with no emitted work (spec §8).
    pub fn spawn(&self) {
        for tracker in self.trackers.values() {
            if tracker.is_source() || tracker.upstream_count() == 0 {
                tracker.spawn();
            }
        }
    }

    /// Join every tracker's completion barrier.
    pub fn wait_for_workers_to_finish(&self) {
        for tracker in self.trackers.values() {
            tracker.wait_for_workers_to_finish();
        }
    }

    /// Join every tracker's worker threads. Only safe after
    /// [`Self::wait_for_workers_to_finish`] has returned.
    pub fn destroy_workers(&self) {
        for tracker in self.trackers.values() {
            tracker.destroy_workers();
        }
    }
}

impl<T: WorkUnit + 'static> Default for TrackerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tracker_set.test.rs"]
mod tests;
