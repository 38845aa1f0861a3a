//! Job and phase definitions plus JSON plan loading.
//!
//! This module provides:
//! - `Job`, the immutable unit of work submitted to the orchestrator
//! - `Phase`, an atomic unit of work with declared dependencies
//! - `InputContract`, the only information a phase attempt may see
//! - `PlanFile`, the on-disk `plan.json` format

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// Default number of phases run concurrently inside one wave.
pub const DEFAULT_MAX_PARALLEL: usize = 5;

/// The top-level unit of work. Created once at submission, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    id: Uuid,
    goal: String,
    max_parallel: usize,
    retry_policy: RetryPolicy,
    created_at: DateTime<Utc>,
}

impl Job {
    /// Submit a new job with default limits.
    pub fn new(goal: impl Into<String>) -> Self {
        Self::with_limits(goal, DEFAULT_MAX_PARALLEL, RetryPolicy::default())
    }

    /// Submit a new job with explicit concurrency and retry settings.
    ///
    /// A concurrency limit of zero is raised to one.
    pub fn with_limits(goal: impl Into<String>, max_parallel: usize, retry_policy: RetryPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            max_parallel: max_parallel.max(1),
            retry_policy,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Resource class tag used to route a phase to a separately bounded pool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceClass(String);

impl ResourceClass {
    pub const DEFAULT: &'static str = "default";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }
}

impl Default for ResourceClass {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structured detail of a failed attempt, fed into the next attempt's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNote {
    pub attempt: u32,
    pub kind: String,
    pub detail: String,
}

/// Everything a phase attempt is allowed to see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputContract {
    /// Files the phase reads
    #[serde(default)]
    pub files: Vec<String>,
    /// Free-form parameters passed through to the executor
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    /// Failure detail accumulated from earlier attempts, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureNote>,
}

impl InputContract {
    /// Return a copy of this contract with one more failure note appended.
    pub fn with_failure(&self, note: FailureNote) -> Self {
        let mut next = self.clone();
        next.failures.push(note);
        next
    }
}

/// Status of a phase during a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    /// Failed but still within its retry budget
    Failed,
    /// Retry budget exhausted; permanently failed and accepted
    Escalated,
}

impl PhaseStatus {
    /// `Succeeded` and `Escalated` end a phase's participation in its wave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Escalated)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

/// An atomic, independently executable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    /// Unique phase id (e.g., "01", "schema")
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Command run by the shell executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Input contract handed to every attempt
    #[serde(default)]
    pub input: InputContract,
    /// Ids of phases that must succeed first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Artifact paths this phase writes
    #[serde(default)]
    pub writes: Vec<String>,
    /// Worker pool partition
    #[serde(default)]
    pub resource_class: ResourceClass,
    /// Per-attempt timeout override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Phase {
    /// Create a phase with the given id, name, and dependencies.
    pub fn new(id: &str, name: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            command: None,
            input: InputContract::default(),
            depends_on,
            writes: Vec::new(),
            resource_class: ResourceClass::default(),
            timeout_secs: None,
        }
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    pub fn with_writes(mut self, writes: Vec<String>) -> Self {
        self.writes = writes;
        self
    }

    pub fn with_resource_class(mut self, class: &str) -> Self {
        self.resource_class = ResourceClass::new(class);
        self
    }

    pub fn with_input(mut self, input: InputContract) -> Self {
        self.input = input;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Job section of `plan.json`; limits are optional and fall back to config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// The full `plan.json` file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub job: JobSpec,
    pub phases: Vec<Phase>,
}

impl PlanFile {
    /// Load a plan from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let plan: PlanFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))?;

        Ok(plan)
    }

    /// Save the plan to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize plan to JSON")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))?;

        Ok(())
    }

    /// Get a specific phase by id.
    pub fn get_phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Stable digest of the phase list, recorded in the ledger to detect plan drift.
    pub fn plan_hash(&self) -> String {
        plan_hash(&self.phases)
    }
}

/// Hex sha256 of the serialized phase list.
pub fn plan_hash(phases: &[Phase]) -> String {
    let mut sorted: Vec<&Phase> = phases.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let bytes = serde_json::to_vec(&sorted).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}
