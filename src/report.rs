//! Terminal job report.
//!
//! Built from the final snapshot, so the same report can be produced by the
//! run that finished the job and by a later `status` against its ledger.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::dag::WavePlan;
use crate::errors::OrchestratorError;
use crate::phase::PhaseStatus;
use crate::state::Snapshot;
use crate::verify::VerificationResult;

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Every wave committed with every phase succeeded
    Succeeded,
    /// At least one phase exhausted its retry budget
    Escalated,
    /// Stopped by the operator before finishing
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Escalated => write!(f, "escalated"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A phase the operator has to look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalatedPhase {
    pub phase: String,
    pub wave: Option<usize>,
    pub attempts: u32,
    pub last_error: String,
}

/// One line of the per-phase breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: String,
    pub wave: usize,
    pub status: PhaseStatus,
    pub attempts: u32,
}

/// Everything an operator needs to resume or intervene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job_id: Option<Uuid>,
    pub goal: String,
    pub outcome: JobOutcome,
    pub total_waves: usize,
    /// Last wave that committed with every phase succeeded
    pub last_committed_wave: Option<usize>,
    pub escalated: Vec<EscalatedPhase>,
    pub phases: Vec<PhaseReport>,
    pub failed_checks: Vec<VerificationResult>,
}

/// Phases that exhausted their budget, in plan order (by wave, then id).
pub fn escalated_phases(plan: &WavePlan, snapshot: &Snapshot) -> Vec<EscalatedPhase> {
    let mut escalated: Vec<EscalatedPhase> = snapshot
        .escalated()
        .into_iter()
        .map(|(id, state)| EscalatedPhase {
            phase: id.to_string(),
            wave: plan.wave_of(id),
            attempts: state.attempt_count(),
            last_error: state.last_error.clone().unwrap_or_default(),
        })
        .collect();
    escalated.sort_by(|a, b| (a.wave, &a.phase).cmp(&(b.wave, &b.phase)));
    escalated
}

/// Per-phase status, wave by wave.
pub fn phase_reports(plan: &WavePlan, snapshot: &Snapshot) -> Vec<PhaseReport> {
    plan.waves()
        .iter()
        .flat_map(|wave| wave.phases.iter().map(move |id| (wave.index, id)))
        .map(|(wave, id)| {
            let state = snapshot.phase(id);
            PhaseReport {
                phase: id.clone(),
                wave,
                status: state.map(|s| s.status).unwrap_or_default(),
                attempts: state.map(|s| s.attempt_count()).unwrap_or(0),
            }
        })
        .collect()
}

/// Checks whose latest result for their wave is a failure.
pub fn failed_checks(snapshot: &Snapshot) -> Vec<VerificationResult> {
    let mut latest: BTreeMap<(usize, &str), &VerificationResult> = BTreeMap::new();
    for result in &snapshot.verifications {
        latest.insert((result.wave, result.check.as_str()), result);
    }
    latest
        .into_values()
        .filter(|r| !r.passed)
        .cloned()
        .collect()
}

impl JobReport {
    pub fn from_snapshot(goal: &str, plan: &WavePlan, snapshot: &Snapshot, outcome: JobOutcome) -> Self {
        Self {
            job_id: snapshot.job_id,
            goal: goal.to_string(),
            outcome,
            total_waves: plan.len(),
            last_committed_wave: snapshot.last_committed_wave(),
            escalated: escalated_phases(plan, snapshot),
            phases: phase_reports(plan, snapshot),
            failed_checks: failed_checks(snapshot),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Turn an unsuccessful outcome into the matching error.
    pub fn into_result(self) -> Result<JobReport, OrchestratorError> {
        match self.outcome {
            JobOutcome::Succeeded => Ok(self),
            JobOutcome::Escalated => Err(OrchestratorError::RetryExhausted {
                phases: self.escalated.into_iter().map(|e| e.phase).collect(),
            }),
            JobOutcome::Cancelled => Err(OrchestratorError::Cancelled),
        }
    }

    /// Plain-text rendering for terminals and logs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Job {}: {}\n", self.goal, self.outcome));
        if let Some(id) = self.job_id {
            out.push_str(&format!("  id: {}\n", id));
        }
        let committed = match self.last_committed_wave {
            Some(w) => w.to_string(),
            None => "none".to_string(),
        };
        out.push_str(&format!(
            "  last committed wave: {} of {}\n",
            committed, self.total_waves
        ));

        if !self.escalated.is_empty() {
            out.push_str("  escalated phases:\n");
            for e in &self.escalated {
                out.push_str(&format!(
                    "    - {} ({} attempts): {}\n",
                    e.phase, e.attempts, e.last_error
                ));
            }
        }

        if !self.failed_checks.is_empty() {
            out.push_str("  failing checks:\n");
            for c in &self.failed_checks {
                out.push_str(&format!("    - wave {} {}\n", c.wave, c.check));
            }
        }
        out
    }
}
