//! The materialized view of the ledger.
//!
//! `Snapshot::apply` is the only way a snapshot changes, and it is a pure
//! function of the record sequence. Every rule that makes a record invalid
//! lives here, so appending and replaying reject exactly the same logs.

use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::record::{RecordKind, RecordedOutcome, StateRecord};
use crate::errors::{ExecutionError, StateCorruptionError};
use crate::executor::TaskOutput;
use crate::phase::PhaseStatus;
use crate::report::JobOutcome;
use crate::verify::VerificationResult;

/// One attempt as the ledger remembers it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptSummary {
    pub attempt: u32,
    pub wave: usize,
    pub input_digest: String,
    /// `None` while the attempt is in flight
    pub outcome: Option<RecordedOutcome>,
}

impl AttemptSummary {
    /// Whether the attempt was stopped by job cancellation rather than failing.
    pub fn was_cancelled(&self) -> bool {
        matches!(
            &self.outcome,
            Some(RecordedOutcome::Failed { kind, .. }) if kind == ExecutionError::Cancelled.kind()
        )
    }
}

/// Per-phase progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    pub attempts: Vec<AttemptSummary>,
    pub last_error: Option<String>,
    /// Output of the latest successful attempt
    pub output: Option<TaskOutput>,
    /// Attempts made before the most recent operator reset
    pub budget_base: u32,
}

impl PhaseState {
    fn pending() -> Self {
        Self {
            status: PhaseStatus::Pending,
            attempts: Vec::new(),
            last_error: None,
            output: None,
            budget_base: 0,
        }
    }

    /// Number of attempts recorded so far, across resets.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Attempts charged against the current retry budget. Cancelled
    /// attempts are free.
    pub fn budget_used(&self) -> u32 {
        self.attempts
            .iter()
            .skip(self.budget_base as usize)
            .filter(|a| !a.was_cancelled())
            .count() as u32
    }

    /// The attempt that was started but never finished, if any.
    pub fn open_attempt(&self) -> Option<&AttemptSummary> {
        self.attempts.last().filter(|a| a.outcome.is_none())
    }

    /// The wave this phase last ran in.
    pub fn wave(&self) -> Option<usize> {
        self.attempts.last().map(|a| a.wave)
    }
}

/// A wave whose members all reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommittedWave {
    pub wave: usize,
    pub escalated: Vec<String>,
}

/// Current state of a job, folded from its ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub job_id: Option<Uuid>,
    pub plan_hash: Option<String>,
    pub phases: BTreeMap<String, PhaseState>,
    pub committed: Vec<CommittedWave>,
    pub verifications: Vec<VerificationResult>,
    /// Number of `JobStarted` records seen
    pub runs: u32,
    pub outcome: Option<JobOutcome>,
    pub last_seq: u64,
}

impl Snapshot {
    /// An empty snapshot in which every declared phase is pending.
    pub fn new<I, S>(declared: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            job_id: None,
            plan_hash: None,
            phases: declared
                .into_iter()
                .map(|id| (id.into(), PhaseState::pending()))
                .collect(),
            committed: Vec::new(),
            verifications: Vec::new(),
            runs: 0,
            outcome: None,
            last_seq: 0,
        }
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseState> {
        self.phases.get(id)
    }

    pub fn status(&self, id: &str) -> Option<PhaseStatus> {
        self.phases.get(id).map(|p| p.status)
    }

    /// Index of the last wave that committed with no escalations.
    pub fn last_committed_wave(&self) -> Option<usize> {
        self.committed
            .iter()
            .take_while(|c| c.escalated.is_empty())
            .last()
            .map(|c| c.wave)
    }

    /// Whether wave `index` committed cleanly.
    pub fn is_wave_committed(&self, index: usize) -> bool {
        self.committed
            .get(index)
            .is_some_and(|c| c.escalated.is_empty())
    }

    /// Escalated phases, ordered by id.
    pub fn escalated(&self) -> Vec<(&str, &PhaseState)> {
        self.phases
            .iter()
            .filter(|(_, p)| p.status == PhaseStatus::Escalated)
            .map(|(id, p)| (id.as_str(), p))
            .collect()
    }

    /// Phase ids whose attempt was started but never finished.
    pub fn dangling_attempts(&self) -> Vec<(String, u32)> {
        self.phases
            .iter()
            .filter_map(|(id, p)| p.open_attempt().map(|a| (id.clone(), a.attempt)))
            .collect()
    }

    /// Fold one record into the snapshot.
    ///
    /// On error the snapshot may be partially updated; callers that need
    /// atomicity apply to a clone.
    pub fn apply(&mut self, record: &StateRecord) -> Result<(), StateCorruptionError> {
        let expected = self.last_seq + 1;
        if record.seq != expected {
            return Err(StateCorruptionError::OutOfSequence {
                expected,
                found: record.seq,
            });
        }
        let seq = record.seq;

        if let Some(phase) = record.kind.phase()
            && !self.phases.contains_key(phase)
        {
            return Err(StateCorruptionError::UnknownPhase {
                seq,
                phase: phase.to_string(),
            });
        }

        match &record.kind {
            RecordKind::JobStarted {
                job_id, plan_hash, ..
            } => {
                if let Some(existing) = &self.plan_hash
                    && existing != plan_hash
                {
                    return Err(inconsistent(
                        seq,
                        format!("plan hash changed from {} to {}", existing, plan_hash),
                    ));
                }
                if let Some(existing) = self.job_id
                    && existing != *job_id
                {
                    return Err(inconsistent(
                        seq,
                        format!("job id changed from {} to {}", existing, job_id),
                    ));
                }
                self.job_id = Some(*job_id);
                self.plan_hash = Some(plan_hash.clone());
                self.runs += 1;
                self.outcome = None;
            }

            RecordKind::AttemptStarted {
                phase,
                attempt,
                wave,
                input_digest,
            } => {
                let wave_committed = self.is_wave_committed(*wave);
                let state = self.phase_mut(phase);
                if let Some(open) = state.open_attempt() {
                    return Err(inconsistent(
                        seq,
                        format!("'{}' attempt {} is still open", phase, open.attempt),
                    ));
                }
                let next = state.attempt_count() + 1;
                if *attempt != next {
                    return Err(inconsistent(
                        seq,
                        format!("'{}' expected attempt {}, found {}", phase, next, attempt),
                    ));
                }
                match state.status {
                    PhaseStatus::Escalated => {
                        return Err(inconsistent(
                            seq,
                            format!("'{}' is escalated and was not reset", phase),
                        ));
                    }
                    // Re-attempts of a succeeded phase come from failed
                    // verification, which only happens before the wave commits.
                    PhaseStatus::Succeeded if wave_committed => {
                        return Err(inconsistent(
                            seq,
                            format!("'{}' already succeeded in committed wave {}", phase, wave),
                        ));
                    }
                    _ => {}
                }
                state.attempts.push(AttemptSummary {
                    attempt: *attempt,
                    wave: *wave,
                    input_digest: input_digest.clone(),
                    outcome: None,
                });
                state.status = PhaseStatus::Running;
            }

            RecordKind::AttemptFinished {
                phase,
                attempt,
                outcome,
            } => {
                let state = self.phase_mut(phase);
                let Some(open) = state.attempts.last_mut().filter(|a| a.outcome.is_none()) else {
                    return Err(inconsistent(
                        seq,
                        format!("'{}' attempt {} finished but never started", phase, attempt),
                    ));
                };
                if open.attempt != *attempt {
                    return Err(inconsistent(
                        seq,
                        format!(
                            "'{}' attempt {} finished while attempt {} is open",
                            phase, attempt, open.attempt
                        ),
                    ));
                }
                open.outcome = Some(outcome.clone());
                match outcome {
                    RecordedOutcome::Succeeded { .. } => {
                        state.status = PhaseStatus::Succeeded;
                        state.output = outcome.output();
                        state.last_error = None;
                    }
                    RecordedOutcome::Failed { .. } => {
                        state.status = PhaseStatus::Failed;
                        state.output = None;
                        state.last_error = Some(outcome.summary());
                    }
                }
            }

            RecordKind::PhaseEscalated {
                phase, last_error, ..
            } => {
                let state = self.phase_mut(phase);
                if state.attempts.is_empty() || state.open_attempt().is_some() {
                    return Err(inconsistent(
                        seq,
                        format!("'{}' escalated without a finished attempt", phase),
                    ));
                }
                state.status = PhaseStatus::Escalated;
                state.output = None;
                state.last_error = Some(last_error.clone());
            }

            RecordKind::PhaseReset { phase } => {
                let state = self.phase_mut(phase);
                if state.status != PhaseStatus::Escalated {
                    return Err(inconsistent(
                        seq,
                        format!("'{}' reset while {}", phase, state.status),
                    ));
                }
                state.status = PhaseStatus::Pending;
                state.budget_base = state.attempt_count();
                let wave = state.wave().unwrap_or(0);
                // The wave must run (and commit) again.
                self.committed.truncate(wave);
                self.outcome = None;
            }

            RecordKind::VerificationRecorded { result } => {
                if let Some(unknown) = result
                    .implicated
                    .iter()
                    .find(|id| !self.phases.contains_key(id.as_str()))
                {
                    return Err(StateCorruptionError::UnknownPhase {
                        seq,
                        phase: unknown.clone(),
                    });
                }
                self.verifications.push(result.clone());
            }

            RecordKind::WaveCommitted { wave, escalated } => {
                let next = self.committed.len();
                if *wave != next {
                    return Err(inconsistent(
                        seq,
                        format!("wave {} committed, expected wave {}", wave, next),
                    ));
                }
                if let Some(bad) = escalated
                    .iter()
                    .find(|id| self.status(id) != Some(PhaseStatus::Escalated))
                {
                    return Err(inconsistent(
                        seq,
                        format!("wave {} lists '{}' as escalated", wave, bad),
                    ));
                }
                self.committed.push(CommittedWave {
                    wave: *wave,
                    escalated: escalated.clone(),
                });
            }

            RecordKind::JobFinished { outcome } => {
                self.outcome = Some(*outcome);
            }
        }

        self.last_seq = seq;
        Ok(())
    }

    fn phase_mut(&mut self, id: &str) -> &mut PhaseState {
        // Presence was checked before dispatch.
        self.phases.entry(id.to_string()).or_insert_with(PhaseState::pending)
    }
}

fn inconsistent(seq: u64, message: String) -> StateCorruptionError {
    StateCorruptionError::Inconsistent { seq, message }
}
