//! Wavefront: run a plan of dependent phases as verified, parallel waves.
//!
//! The plan is decomposed into waves ([`dag`]), each wave's phases run
//! concurrently in isolated contexts ([`scheduler`], [`context`]), failures
//! are retried with annotated input ([`retry`]), and a wave only commits once
//! its checks pass ([`verify`]). Every transition is appended to a durable
//! ledger ([`state`]) so an interrupted job resumes where it stopped.

pub mod config;
pub mod context;
pub mod dag;
pub mod errors;
pub mod executor;
pub mod phase;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod ui;
pub mod verify;

pub use dag::{Wave, WavePlan, decompose};
pub use errors::{ExecutionError, OrchestratorError, PlanError, StateCorruptionError};
pub use executor::{CommandExecutor, TaskExecutor, TaskOutput};
pub use phase::{Job, Phase, PhaseStatus};
pub use report::{JobOutcome, JobReport};
pub use retry::{RetryController, RetryDecision, RetryPolicy};
pub use scheduler::{SchedulerEvent, WaveScheduler};
pub use state::{Snapshot, StateStore};
pub use verify::{CheckDescriptor, VerificationGate};
