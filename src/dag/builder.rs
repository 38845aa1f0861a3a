//! DAG builder for constructing dependency graphs from phases.
//!
//! The builder takes a list of phases with their dependencies and constructs
//! a directed graph that the decomposer partitions into waves.

use crate::errors::PlanError;
use crate::phase::Phase;
use std::collections::{BTreeMap, HashSet};

/// Index into the phase list.
pub type PhaseIndex = usize;

/// A directed graph of phases. Cycles are detected later, during wave extraction.
#[derive(Debug)]
pub struct PhaseGraph {
    /// Phases indexed by their position
    phases: Vec<Phase>,
    /// Map from phase id to index
    index_map: BTreeMap<String, PhaseIndex>,
    /// Forward edges: index -> phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// Reverse edges: index -> phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    /// Get the number of phases in the graph.
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Get a phase by its index.
    pub fn get_phase(&self, index: PhaseIndex) -> Option<&Phase> {
        self.phases.get(index)
    }

    /// Phase indices ordered by phase id.
    pub fn indices_by_id(&self) -> impl Iterator<Item = PhaseIndex> + '_ {
        self.index_map.values().copied()
    }

    /// Consume the graph, returning its phases.
    pub fn into_phases(self) -> Vec<Phase> {
        self.phases
    }

    /// Get phases that depend on the given phase (forward edges).
    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Get phases that the given phase depends on (reverse edges).
    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Check if all dependencies of a phase are satisfied.
    pub fn dependencies_satisfied(&self, index: PhaseIndex, completed: &HashSet<PhaseIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }
}

/// Builder for constructing phase graphs.
pub struct DagBuilder {
    phases: Vec<Phase>,
}

impl DagBuilder {
    /// Create a new builder with the given phases.
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// Build the phase graph.
    ///
    /// Phase ids must be unique and every dependency must name a declared phase.
    pub fn build(self) -> Result<PhaseGraph, PlanError> {
        let mut index_map = BTreeMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if index_map.insert(phase.id.clone(), i).is_some() {
                return Err(PlanError::DuplicatePhase(phase.id.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];

        for (to_idx, phase) in self.phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| PlanError::UnknownDependency {
                            phase: phase.id.clone(),
                            dependency: dep.clone(),
                        })?;

                // Repeated dependency declarations collapse to one edge
                if reverse_edges[to_idx].contains(&from_idx) {
                    continue;
                }
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        Ok(PhaseGraph {
            phases: self.phases,
            index_map,
            forward_edges,
            reverse_edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(id: &str, deps: Vec<&str>) -> Phase {
        Phase::new(
            id,
            &format!("Phase {}", id),
            deps.into_iter().map(String::from).collect(),
        )
    }

    #[test]
    fn test_build_simple_graph() {
        let phases = vec![
            phase("01", vec![]),
            phase("02", vec!["01"]),
            phase("03", vec!["01"]),
            phase("04", vec!["02", "03"]),
        ];

        let graph = DagBuilder::new(phases).build().unwrap();

        assert_eq!(graph.len(), 4);
        assert!(graph.dependencies(0).is_empty());
        assert_eq!(graph.dependencies(3), &[1, 2]);
        let dependents = graph.dependents(0);
        assert!(dependents.contains(&1));
        assert!(dependents.contains(&2));
    }

    #[test]
    fn test_missing_dependency() {
        let phases = vec![phase("01", vec!["nonexistent"])];

        let err = DagBuilder::new(phases).build().unwrap_err();
        assert_eq!(
            err,
            PlanError::UnknownDependency {
                phase: "01".into(),
                dependency: "nonexistent".into(),
            }
        );
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_duplicate_phase_id() {
        let phases = vec![phase("01", vec![]), phase("01", vec![])];

        let err = DagBuilder::new(phases).build().unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_repeated_dependency_is_one_edge() {
        let phases = vec![phase("01", vec![]), phase("02", vec!["01", "01"])];
        let graph = DagBuilder::new(phases).build().unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependents(0), &[1]);
    }

    #[test]
    fn test_empty_graph() {
        let graph = DagBuilder::new(vec![]).build().unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_indices_by_id_are_sorted() {
        let phases = vec![phase("b", vec![]), phase("a", vec![]), phase("c", vec![])];
        let graph = DagBuilder::new(phases).build().unwrap();
        let ids: Vec<&str> = graph
            .indices_by_id()
            .map(|i| graph.get_phase(i).unwrap().id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dependencies_satisfied() {
        let phases = vec![
            phase("01", vec![]),
            phase("02", vec!["01"]),
            phase("03", vec!["01", "02"]),
        ];

        let graph = DagBuilder::new(phases).build().unwrap();
        let mut completed = HashSet::new();

        assert!(graph.dependencies_satisfied(0, &completed));
        assert!(!graph.dependencies_satisfied(1, &completed));

        completed.insert(0);
        assert!(graph.dependencies_satisfied(1, &completed));
        assert!(!graph.dependencies_satisfied(2, &completed));

        completed.insert(1);
        assert!(graph.dependencies_satisfied(2, &completed));
    }
}
