//! Execution context factory: one isolated, single-use scope per phase attempt.
//!
//! A context owns a private copy of the attempt's input snapshot and, when the
//! factory has a scratch root, a private scratch directory. The executor only
//! ever sees `&ExecutionContext`. `destroy` consumes the context, so it cannot
//! be reused for a second attempt; the resulting `ExecutionUnit` carries the
//! outputs, which are the only thing that survives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use crate::errors::ExecutionError;
use crate::executor::{AttemptOutcome, TaskOutput};
use crate::phase::{InputContract, Phase, ResourceClass};

/// The explicit input of one attempt: the phase's contract plus the recorded
/// outputs of its dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub phase: String,
    pub attempt: u32,
    pub contract: InputContract,
    /// Outputs of dependency phases, keyed by phase id
    #[serde(default)]
    pub upstream: BTreeMap<String, TaskOutput>,
}

impl InputSnapshot {
    /// Hex sha256 of the serialized snapshot.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}

/// An isolated scope for exactly one phase attempt.
#[derive(Debug)]
pub struct ExecutionContext {
    id: Uuid,
    snapshot: InputSnapshot,
    command: Option<String>,
    resource_class: ResourceClass,
    scratch_dir: Option<PathBuf>,
    started_at: DateTime<Utc>,
    live: Arc<AtomicUsize>,
}

impl ExecutionContext {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> &str {
        &self.snapshot.phase
    }

    pub fn attempt(&self) -> u32 {
        self.snapshot.attempt
    }

    pub fn snapshot(&self) -> &InputSnapshot {
        &self.snapshot
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn resource_class(&self) -> &ResourceClass {
        &self.resource_class
    }

    /// Private scratch directory, if the factory was given a scratch root.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch_dir.as_deref()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Some(dir) = self.scratch_dir.take()
            && let Err(e) = std::fs::remove_dir_all(&dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove context scratch dir");
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What survives an attempt once its context is destroyed.
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    pub context_id: Uuid,
    pub phase: String,
    pub attempt: u32,
    pub resource_class: ResourceClass,
    pub input_digest: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// Creates and destroys execution contexts.
#[derive(Debug, Clone, Default)]
pub struct ContextFactory {
    scratch_root: Option<PathBuf>,
    live: Arc<AtomicUsize>,
}

impl ContextFactory {
    /// A factory whose contexts have no scratch directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory that gives every context a fresh directory under `root`.
    pub fn with_scratch_root(root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: Some(root.into()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of contexts created and not yet destroyed.
    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Create an isolated context for one attempt of `phase`.
    ///
    /// The snapshot is moved into the context; nothing else is visible to it.
    pub fn create(&self, phase: &Phase, snapshot: InputSnapshot) -> Result<ExecutionContext, ExecutionError> {
        if snapshot.phase != phase.id {
            return Err(ExecutionError::Context(format!(
                "snapshot for '{}' handed to phase '{}'",
                snapshot.phase, phase.id
            )));
        }

        let id = Uuid::new_v4();
        let scratch_dir = match &self.scratch_root {
            Some(root) => {
                let dir = root.join(scratch_dir_name(&phase.id, snapshot.attempt, id));
                std::fs::create_dir_all(&dir).map_err(|e| {
                    ExecutionError::Context(format!(
                        "failed to create scratch dir {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
                Some(dir)
            }
            None => None,
        };

        self.live.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(phase = %phase.id, attempt = snapshot.attempt, context = %id, "context created");

        Ok(ExecutionContext {
            id,
            command: phase.command.clone(),
            resource_class: phase.resource_class.clone(),
            scratch_dir,
            started_at: Utc::now(),
            live: Arc::clone(&self.live),
            snapshot,
        })
    }

    /// Discard a context after its attempt resolved, keeping only its outputs.
    pub fn destroy(&self, context: ExecutionContext, outcome: AttemptOutcome) -> ExecutionUnit {
        let unit = ExecutionUnit {
            context_id: context.id,
            phase: context.snapshot.phase.clone(),
            attempt: context.snapshot.attempt,
            resource_class: context.resource_class.clone(),
            input_digest: context.snapshot.digest(),
            started_at: context.started_at,
            ended_at: Utc::now(),
            outcome,
        };
        tracing::debug!(phase = %unit.phase, attempt = unit.attempt, context = %unit.context_id, "context destroyed");
        drop(context);
        unit
    }
}

fn scratch_dir_name(phase: &str, attempt: u32, id: Uuid) -> String {
    let safe: String = phase
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let short = id.simple().to_string();
    format!("{}-a{}-{}", safe, attempt, &short[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot(phase: &str, attempt: u32) -> InputSnapshot {
        InputSnapshot {
            phase: phase.to_string(),
            attempt,
            contract: InputContract::default(),
            upstream: BTreeMap::new(),
        }
    }

    #[test]
    fn test_contexts_get_distinct_scratch_dirs() {
        let dir = tempdir().unwrap();
        let factory = ContextFactory::with_scratch_root(dir.path());
        let phase = Phase::new("p/1", "P", vec![]);

        let a = factory.create(&phase, snapshot("p/1", 1)).unwrap();
        let b = factory.create(&phase, snapshot("p/1", 2)).unwrap();

        let a_dir = a.scratch_dir().unwrap().to_path_buf();
        let b_dir = b.scratch_dir().unwrap().to_path_buf();
        assert_ne!(a_dir, b_dir);
        assert!(a_dir.exists());
        assert!(a_dir.file_name().unwrap().to_string_lossy().starts_with("p_1-a1-"));
        assert_eq!(factory.live_contexts(), 2);

        let unit = factory.destroy(a, AttemptOutcome::Success(TaskOutput::default()));
        assert_eq!(unit.attempt, 1);
        assert!(!a_dir.exists());
        assert!(b_dir.exists());
        assert_eq!(factory.live_contexts(), 1);

        drop(b);
        assert!(!b_dir.exists());
        assert_eq!(factory.live_contexts(), 0);
    }

    #[test]
    fn test_snapshot_must_match_phase() {
        let factory = ContextFactory::new();
        let phase = Phase::new("a", "A", vec![]);
        let err = factory.create(&phase, snapshot("b", 1)).unwrap_err();
        assert!(matches!(err, ExecutionError::Context(_)));
        assert_eq!(factory.live_contexts(), 0);
    }

    #[test]
    fn test_context_owns_its_snapshot_copy() {
        let factory = ContextFactory::new();
        let phase = Phase::new("a", "A", vec![]).with_command("echo hi");
        let mut original = snapshot("a", 1);
        let ctx = factory.create(&phase, original.clone()).unwrap();

        original.contract.files.push("mutated.txt".into());
        assert!(ctx.snapshot().contract.files.is_empty());
        assert_eq!(ctx.command(), Some("echo hi"));
        assert!(ctx.scratch_dir().is_none());
    }

    #[test]
    fn test_destroy_records_digest_and_outcome() {
        let factory = ContextFactory::new();
        let phase = Phase::new("a", "A", vec![]);
        let snap = snapshot("a", 2);
        let expected = snap.digest();
        let ctx = factory.create(&phase, snap).unwrap();

        let unit = factory.destroy(ctx, AttemptOutcome::Failure(ExecutionError::Cancelled));
        assert_eq!(unit.input_digest, expected);
        assert_eq!(unit.phase, "a");
        assert!(unit.ended_at >= unit.started_at);
        assert!(matches!(unit.outcome, AttemptOutcome::Failure(ExecutionError::Cancelled)));
    }

    #[test]
    fn test_digest_changes_with_failures() {
        let base = snapshot("a", 1);
        let mut retried = snapshot("a", 1);
        retried.contract.failures.push(crate::phase::FailureNote {
            attempt: 1,
            kind: "executor".into(),
            detail: "x".into(),
        });
        assert_ne!(base.digest(), retried.digest());
    }
}
