//! Precedence graph for dependent collections
//!
//! Holds the directed acyclic precedence relation between the children of
//! a dependent collection. Cycles are a configuration error rejected at
//! construction, never discovered during scheduling.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::GridflowError;
use crate::types::JobId;

/// Directed acyclic graph over child task ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecedenceGraph {
    /// Child ids in declaration order
    order: Vec<JobId>,
    /// id -> ids that must wait for it
    successors: BTreeMap<JobId, Vec<JobId>>,
    /// id -> ids it waits for
    predecessors: BTreeMap<JobId, Vec<JobId>>,
}

impl PrecedenceGraph {
    /// Build and validate a graph. `edges` are (predecessor, dependent)
    /// pairs; every endpoint must be in `nodes`, self edges and cycles are
    /// rejected.
    pub fn new(
        nodes: Vec<JobId>,
        edges: &[(JobId, JobId)],
    ) -> Result<Self, GridflowError> {
        let node_set: BTreeSet<&JobId> = nodes.iter().collect();
        let mut successors: BTreeMap<JobId, Vec<JobId>> = BTreeMap::new();
        let mut predecessors: BTreeMap<JobId, Vec<JobId>> = BTreeMap::new();
        for id in &nodes {
            successors.insert(id.clone(), Vec::new());
            predecessors.insert(id.clone(), Vec::new());
        }

        for (before, after) in edges {
            if before == after {
                return Err(GridflowError::SelfDependency {
                    id: before.to_string(),
                });
            }
            for endpoint in [before, after] {
                if !node_set.contains(endpoint) {
                    return Err(GridflowError::UnknownGraphNode {
                        id: endpoint.to_string(),
                    });
                }
            }
            successors.get_mut(before).expect("checked").push(after.clone());
            predecessors.get_mut(after).expect("checked").push(before.clone());
        }

        let graph = Self {
            order: nodes,
            successors,
            predecessors,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Kahn's algorithm; any node left unprocessed sits on a cycle.
    fn check_acyclic(&self) -> Result<(), GridflowError> {
        let mut in_degree: BTreeMap<&JobId, usize> = self
            .order
            .iter()
            .map(|id| (id, self.predecessors[id].len()))
            .collect();
        let mut queue: VecDeque<&JobId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut processed = 0usize;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            for next in &self.successors[id] {
                let d = in_degree.get_mut(next).expect("known node");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }

        if processed == self.order.len() {
            Ok(())
        } else {
            let culprit = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(id, _)| id.to_string())
                .unwrap_or_default();
            Err(GridflowError::DependencyCycle { id: culprit })
        }
    }

    /// Child ids in declaration order.
    pub fn nodes(&self) -> &[JobId] {
        &self.order
    }

    /// Ids `id` waits for.
    pub fn predecessors_of(&self, id: &JobId) -> &[JobId] {
        self.predecessors.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// All ids reachable from `id` along precedence edges (the transitive
    /// dependents), breadth-first.
    pub fn transitive_dependents(&self, id: &JobId) -> Vec<JobId> {
        let mut visited: BTreeSet<&JobId> = BTreeSet::new();
        let mut queue: VecDeque<&JobId> = VecDeque::new();
        queue.push_back(id);

        let mut result = Vec::new();
        while let Some(current) = queue.pop_front() {
            if let Some(next) = self.successors.get(current) {
                for dep in next {
                    if visited.insert(dep) {
                        result.push(dep.clone());
                        queue.push_back(dep);
                    }
                }
            }
        }
        result
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    fn ids(names: &[&str]) -> Vec<JobId> {
        names.iter().map(|n| id(n)).collect()
    }

    #[test]
    fn diamond_builds() {
        let g = PrecedenceGraph::new(
            ids(&["a", "b", "c", "d"]),
            &[
                (id("a"), id("b")),
                (id("a"), id("c")),
                (id("b"), id("d")),
                (id("c"), id("d")),
            ],
        )
        .unwrap();

        assert!(g.predecessors_of(&id("a")).is_empty());
        assert_eq!(g.predecessors_of(&id("d")).len(), 2);
    }

    #[test]
    fn cycle_rejected_at_construction() {
        let err = PrecedenceGraph::new(
            ids(&["a", "b", "c"]),
            &[(id("a"), id("b")), (id("b"), id("c")), (id("c"), id("a"))],
        );
        assert!(matches!(err, Err(GridflowError::DependencyCycle { .. })));
    }

    #[test]
    fn self_edge_rejected() {
        let err = PrecedenceGraph::new(ids(&["a"]), &[(id("a"), id("a"))]);
        assert!(matches!(err, Err(GridflowError::SelfDependency { .. })));
    }

    #[test]
    fn unknown_endpoint_rejected() {
        let err = PrecedenceGraph::new(ids(&["a"]), &[(id("a"), id("ghost"))]);
        assert!(matches!(err, Err(GridflowError::UnknownGraphNode { .. })));
    }

    #[test]
    fn transitive_dependents_cover_descendants_only() {
        let g = PrecedenceGraph::new(
            ids(&["a", "b", "c", "d", "e"]),
            &[
                (id("a"), id("b")),
                (id("b"), id("c")),
                (id("b"), id("d")),
                // e is unrelated
            ],
        )
        .unwrap();

        let mut deps = g.transitive_dependents(&id("a"));
        deps.sort();
        assert_eq!(deps, ids(&["b", "c", "d"]));
        assert!(g.transitive_dependents(&id("e")).is_empty());
        assert!(g.transitive_dependents(&id("c")).is_empty());
    }
}
