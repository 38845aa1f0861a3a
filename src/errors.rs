//! Typed error hierarchy for the wavefront orchestrator.
//!
//! Each subsystem owns one enum:
//! - `PlanError`: plan validation failures, fatal before any execution
//! - `ExecutionError`: a single phase attempt failed (retryable)
//! - `StateCorruptionError`: the ledger cannot be trusted (never auto-recovered)
//! - `OrchestratorError`: top-level job failures surfaced to the operator

use thiserror::Error;

/// Errors raised while decomposing phases into waves.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Cycle detected in phase dependencies. Involved phases: {phases:?}")]
    Cycle { phases: Vec<String> },

    #[error("Unknown dependency '{dependency}' in phase '{phase}': no phase with that id exists")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Phases {phases:?} in wave {wave} both write artifact '{artifact}'")]
    ArtifactConflict {
        wave: usize,
        artifact: String,
        phases: Vec<String>,
    },
}

/// Why a single phase attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("executor failed: {0}")]
    Executor(String),

    #[error("attempt timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("attempt cancelled")]
    Cancelled,

    #[error("verification check '{check}' failed: {diagnostics}")]
    Verification { check: String, diagnostics: String },

    #[error("execution context error: {0}")]
    Context(String),

    #[error("attempt interrupted before it recorded an outcome")]
    Interrupted,
}

impl ExecutionError {
    /// Short machine-readable kind, stored in the ledger.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Executor(_) => "executor",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Verification { .. } => "verification",
            Self::Context(_) => "context",
            Self::Interrupted => "interrupted",
        }
    }

    /// Whether the retry controller may act on this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// The state log is unreadable or internally inconsistent.
#[derive(Debug, Error)]
pub enum StateCorruptionError {
    #[error("Failed to read state log at {path}: {source}")]
    Unreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record on line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("Record {seq} references phase '{phase}' that the plan never declared")]
    UnknownPhase { seq: u64, phase: String },

    #[error("Record sequence broken: expected {expected}, found {found}")]
    OutOfSequence { expected: u64, found: u64 },

    #[error("Inconsistent ledger at record {seq}: {message}")]
    Inconsistent { seq: u64, message: String },
}

/// Top-level orchestrator failures.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    StateCorruption(#[from] StateCorruptionError),

    #[error("Failed to write state log at {path}: {source}")]
    StateWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State log {0} is locked by another orchestrator")]
    Locked(std::path::PathBuf),

    #[error("Retry budget exhausted for phases {phases:?}")]
    RetryExhausted { phases: Vec<String> },

    #[error("Job cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
