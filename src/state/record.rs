//! Ledger record types. One JSON object per line in `state.jsonl`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ExecutionError;
use crate::executor::{AttemptOutcome, TaskOutput};
use crate::report::JobOutcome;
use crate::verify::VerificationResult;

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// 1-based, contiguous
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RecordKind,
}

/// What a record says happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordKind {
    /// A run of the job began (first run or a resume)
    JobStarted {
        job_id: Uuid,
        goal: String,
        plan_hash: String,
    },
    AttemptStarted {
        phase: String,
        attempt: u32,
        wave: usize,
        input_digest: String,
    },
    AttemptFinished {
        phase: String,
        attempt: u32,
        outcome: RecordedOutcome,
    },
    PhaseEscalated {
        phase: String,
        attempts: u32,
        last_error: String,
    },
    /// An escalated phase was handed a fresh retry budget by the operator
    PhaseReset { phase: String },
    VerificationRecorded { result: VerificationResult },
    /// Every member of the wave reached a terminal state
    WaveCommitted {
        wave: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        escalated: Vec<String>,
    },
    JobFinished { outcome: JobOutcome },
}

impl RecordKind {
    /// The phase this record is about, if any.
    pub fn phase(&self) -> Option<&str> {
        match self {
            Self::AttemptStarted { phase, .. }
            | Self::AttemptFinished { phase, .. }
            | Self::PhaseEscalated { phase, .. }
            | Self::PhaseReset { phase } => Some(phase),
            _ => None,
        }
    }
}

/// Attempt outcome as stored in the ledger: artifacts and decisions on
/// success, error kind and detail on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordedOutcome {
    Succeeded {
        #[serde(default)]
        artifacts: Vec<String>,
        #[serde(default)]
        decisions: Vec<String>,
    },
    Failed { kind: String, detail: String },
}

impl RecordedOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Artifact/decision summary on success, error detail on failure.
    pub fn summary(&self) -> String {
        match self {
            Self::Succeeded {
                artifacts,
                decisions,
            } => format!(
                "{} artifact(s), {} decision(s)",
                artifacts.len(),
                decisions.len()
            ),
            Self::Failed { kind, detail } => format!("{}: {}", kind, detail),
        }
    }

    /// The attempt's output, if it succeeded.
    pub fn output(&self) -> Option<TaskOutput> {
        match self {
            Self::Succeeded {
                artifacts,
                decisions,
            } => Some(TaskOutput::new(artifacts.clone(), decisions.clone())),
            Self::Failed { .. } => None,
        }
    }
}

impl From<&AttemptOutcome> for RecordedOutcome {
    fn from(outcome: &AttemptOutcome) -> Self {
        match outcome {
            AttemptOutcome::Success(output) => Self::Succeeded {
                artifacts: output.artifacts.clone(),
                decisions: output.decisions.clone(),
            },
            AttemptOutcome::Failure(error) => Self::from(error),
        }
    }
}

impl From<&ExecutionError> for RecordedOutcome {
    fn from(error: &ExecutionError) -> Self {
        Self::Failed {
            kind: error.kind().to_string(),
            detail: error.to_string(),
        }
    }
}
