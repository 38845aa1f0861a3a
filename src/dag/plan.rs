//! Wave plans: frontier extraction over the phase graph.
//!
//! Wave `k` holds every unassigned phase whose dependencies all sit in waves
//! `0..k`. Phases inside a wave are ordered by id so plans are deterministic.

use crate::dag::builder::{DagBuilder, PhaseGraph, PhaseIndex};
use crate::errors::PlanError;
use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;

/// A group of mutually independent phases forming one synchronization barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    /// 0-based, strictly increasing
    pub index: usize,
    /// Member phase ids, sorted
    pub phases: Vec<String>,
}

/// An ordered sequence of waves plus the phase definitions they reference.
#[derive(Debug, Clone)]
pub struct WavePlan {
    waves: Vec<Wave>,
    phases: BTreeMap<String, Phase>,
    wave_of: BTreeMap<String, usize>,
}

impl WavePlan {
    /// Decompose phases into waves.
    ///
    /// Fails with `PlanError::Cycle` if the dependency graph has a cycle, and
    /// with `PlanError::ArtifactConflict` if two phases of one wave declare the
    /// same written artifact.
    pub fn from_phases(phases: &[Phase]) -> Result<Self, PlanError> {
        let graph = DagBuilder::new(phases.to_vec()).build()?;
        let assignment = extract_waves(&graph)?;

        let mut waves = Vec::with_capacity(assignment.len());
        let mut wave_of = BTreeMap::new();
        for (index, members) in assignment.into_iter().enumerate() {
            let ids: Vec<String> = members
                .into_iter()
                .filter_map(|i| graph.get_phase(i).map(|p| p.id.clone()))
                .collect();
            for id in &ids {
                wave_of.insert(id.clone(), index);
            }
            waves.push(Wave { index, phases: ids });
        }

        let phases: BTreeMap<String, Phase> = graph
            .into_phases()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let plan = Self {
            waves,
            phases,
            wave_of,
        };
        plan.check_artifact_conflicts()?;

        tracing::debug!(
            phases = plan.phases.len(),
            waves = plan.waves.len(),
            "decomposed plan"
        );
        Ok(plan)
    }

    pub fn waves(&self) -> &[Wave] {
        &self.waves
    }

    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.get(id)
    }

    /// Index of the wave a phase was assigned to.
    pub fn wave_of(&self, id: &str) -> Option<usize> {
        self.wave_of.get(id).copied()
    }

    /// All phase definitions, ordered by id.
    pub fn phases(&self) -> impl Iterator<Item = &Phase> {
        self.phases.values()
    }

    fn check_artifact_conflicts(&self) -> Result<(), PlanError> {
        for wave in &self.waves {
            let mut writers: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for id in &wave.phases {
                let Some(phase) = self.phases.get(id) else {
                    continue;
                };
                let unique: BTreeSet<String> =
                    phase.writes.iter().map(|w| normalize_artifact(w)).collect();
                for artifact in unique {
                    writers.entry(artifact).or_default().push(id.clone());
                }
            }
            if let Some((artifact, phases)) = writers.into_iter().find(|(_, p)| p.len() > 1) {
                return Err(PlanError::ArtifactConflict {
                    wave: wave.index,
                    artifact,
                    phases,
                });
            }
        }
        Ok(())
    }

    /// Render the plan as a Markdown roadmap grouped under wave headers.
    ///
    /// Phases in `completed` are rendered as checked items.
    pub fn to_roadmap(&self, goal: &str, completed: &BTreeSet<String>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Roadmap: {}", goal);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} phases in {} waves.",
            self.phases.len(),
            self.waves.len()
        );

        for wave in &self.waves {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Wave {}", wave.index);
            let _ = writeln!(out);
            for id in &wave.phases {
                let Some(phase) = self.phases.get(id) else {
                    continue;
                };
                let mark = if completed.contains(id) { "x" } else { " " };
                let name = if phase.name.is_empty() {
                    id.as_str()
                } else {
                    phase.name.as_str()
                };
                let _ = write!(out, "- [{}] {}: {}", mark, id, name);
                if !phase.depends_on.is_empty() {
                    let _ = write!(out, " (depends on {})", phase.depends_on.join(", "));
                }
                if !phase.resource_class.is_default() {
                    let _ = write!(out, " [{}]", phase.resource_class);
                }
                let _ = writeln!(out);
            }
        }
        out
    }
}

fn normalize_artifact(path: &str) -> String {
    path.trim().trim_start_matches("./").to_string()
}

/// Repeated frontier extraction. Returns phase indices grouped by wave.
fn extract_waves(graph: &PhaseGraph) -> Result<Vec<Vec<PhaseIndex>>, PlanError> {
    let mut assigned: HashSet<PhaseIndex> = HashSet::new();
    let mut waves = Vec::new();

    while assigned.len() < graph.len() {
        // Ordered by id, so each frontier is already sorted
        let frontier: Vec<PhaseIndex> = graph
            .indices_by_id()
            .filter(|i| !assigned.contains(i))
            .filter(|&i| graph.dependencies_satisfied(i, &assigned))
            .collect();

        if frontier.is_empty() {
            return Err(PlanError::Cycle {
                phases: cycle_members(graph, &assigned),
            });
        }

        assigned.extend(frontier.iter().copied());
        waves.push(frontier);
    }

    Ok(waves)
}

/// Unassigned phases that sit on or between cycles.
///
/// Phases merely downstream of a cycle are peeled off: they have no unassigned
/// dependents, so they cannot be part of one.
fn cycle_members(graph: &PhaseGraph, assigned: &HashSet<PhaseIndex>) -> Vec<String> {
    let mut remaining: BTreeSet<PhaseIndex> = graph
        .indices_by_id()
        .filter(|i| !assigned.contains(i))
        .collect();

    loop {
        let sinks: Vec<PhaseIndex> = remaining
            .iter()
            .copied()
            .filter(|&i| !graph.dependents(i).iter().any(|d| remaining.contains(d)))
            .collect();
        if sinks.is_empty() {
            break;
        }
        for i in sinks {
            remaining.remove(&i);
        }
    }

    let mut ids: Vec<String> = remaining
        .into_iter()
        .filter_map(|i| graph.get_phase(i).map(|p| p.id.clone()))
        .collect();
    ids.sort();
    ids
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

    fn ids(wave: &Wave) -> Vec<&str> {
        wave.phases.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_wave_computation_diamond() {
        let phases = vec![
            phase("04", vec!["02", "03"]),
            phase("03", vec!["01"]),
            phase("02", vec!["01"]),
            phase("01", vec![]),
        ];

        let plan = WavePlan::from_phases(&phases).unwrap();

        assert_eq!(plan.len(), 3);
        assert_eq!(ids(&plan.waves()[0]), vec!["01"]);
        assert_eq!(ids(&plan.waves()[1]), vec!["02", "03"]);
        assert_eq!(ids(&plan.waves()[2]), vec!["04"]);
        assert_eq!(plan.wave_of("03"), Some(1));
    }

    #[test]
    fn test_independent_phases_share_first_wave() {
        let phases = vec![phase("B", vec![]), phase("A", vec![]), phase("C", vec!["A", "B"])];
        let plan = WavePlan::from_phases(&phases).unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(ids(&plan.waves()[0]), vec!["A", "B"]);
        assert_eq!(ids(&plan.waves()[1]), vec!["C"]);
    }

    #[test]
    fn test_dependencies_always_in_earlier_waves() {
        // A layered graph with skip edges
        let phases = vec![
            phase("a", vec![]),
            phase("b", vec!["a"]),
            phase("c", vec![]),
            phase("d", vec!["b", "c"]),
            phase("e", vec!["a"]),
            phase("f", vec!["e", "d"]),
            phase("g", vec!["c"]),
        ];
        let plan = WavePlan::from_phases(&phases).unwrap();

        for p in plan.phases() {
            let own = plan.wave_of(&p.id).unwrap();
            for dep in &p.depends_on {
                assert!(plan.wave_of(dep).unwrap() < own, "{} -> {}", p.id, dep);
            }
        }
        for (i, wave) in plan.waves().iter().enumerate() {
            assert_eq!(wave.index, i);
            let mut sorted = wave.phases.clone();
            sorted.sort();
            assert_eq!(sorted, wave.phases);
        }
    }

    #[test]
    fn test_cycle_names_members_only() {
        // 01 -> 02 -> 03 -> 01, and 04 merely depends on the cycle
        let phases = vec![
            phase("00", vec![]),
            phase("01", vec!["03"]),
            phase("02", vec!["01"]),
            phase("03", vec!["02", "00"]),
            phase("04", vec!["03"]),
        ];

        let err = WavePlan::from_phases(&phases).unwrap_err();
        assert_eq!(
            err,
            PlanError::Cycle {
                phases: vec!["01".into(), "02".into(), "03".into()],
            }
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = WavePlan::from_phases(&[phase("x", vec!["x"])]).unwrap_err();
        assert!(matches!(err, PlanError::Cycle { phases } if phases == vec!["x".to_string()]));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let err = WavePlan::from_phases(&[phase("01", vec!["missing"])]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
    }

    #[test]
    fn test_artifact_conflict_in_same_wave() {
        let phases = vec![
            phase("a", vec![]).with_writes(vec!["src/lib.rs".into()]),
            phase("b", vec![]).with_writes(vec!["./src/lib.rs".into()]),
        ];
        let err = WavePlan::from_phases(&phases).unwrap_err();
        assert_eq!(
            err,
            PlanError::ArtifactConflict {
                wave: 0,
                artifact: "src/lib.rs".into(),
                phases: vec!["a".into(), "b".into()],
            }
        );
    }

    #[test]
    fn test_same_artifact_across_waves_is_allowed() {
        let phases = vec![
            phase("a", vec![]).with_writes(vec!["src/lib.rs".into()]),
            phase("b", vec!["a"]).with_writes(vec!["src/lib.rs".into()]),
        ];
        assert!(WavePlan::from_phases(&phases).is_ok());
    }

    #[test]
    fn test_empty_plan_has_no_waves() {
        let plan = WavePlan::from_phases(&[]).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.phase_count(), 0);
    }

    #[test]
    fn test_roadmap_groups_by_wave() {
        let phases = vec![
            phase("A", vec![]),
            phase("B", vec![]).with_resource_class("heavy"),
            phase("C", vec!["A", "B"]),
        ];
        let plan = WavePlan::from_phases(&phases).unwrap();
        let completed: BTreeSet<String> = ["A".to_string()].into_iter().collect();
        let roadmap = plan.to_roadmap("demo", &completed);

        assert!(roadmap.starts_with("# Roadmap: demo"));
        assert!(roadmap.contains("## Wave 0"));
        assert!(roadmap.contains("## Wave 1"));
        assert!(roadmap.contains("- [x] A: Phase A"));
        assert!(roadmap.contains("- [ ] B: Phase B [heavy]"));
        assert!(roadmap.contains("- [ ] C: Phase C (depends on A, B)"));
        let wave0 = roadmap.find("## Wave 0").unwrap();
        let wave1 = roadmap.find("## Wave 1").unwrap();
        assert!(roadmap.find("- [ ] C").unwrap() > wave1);
        assert!(roadmap.find("- [x] A").unwrap() > wave0);
    }
}
