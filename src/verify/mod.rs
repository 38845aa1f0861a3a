//! Verification gate: post-wave checks normalized to pass/fail.
//!
//! The gate runs every check that applies to a wave and attributes failing
//! checks to the phases that most likely caused them, so remediation can be
//! scoped to those phases instead of the whole wave. The gate never touches
//! phase or wave state; callers decide what to record.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::dag::Wave;
use crate::executor::TaskOutput;

fn default_check_timeout_secs() -> u64 {
    600
}

/// A named check and how to invoke it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDescriptor {
    pub name: String,
    pub command: String,
    #[serde(default = "default_check_timeout_secs")]
    pub timeout_secs: u64,
    /// Phases this check covers; empty means every phase
    #[serde(default)]
    pub phases: Vec<String>,
}

impl CheckDescriptor {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            timeout_secs: default_check_timeout_secs(),
            phases: Vec::new(),
        }
    }

    pub fn with_phases(mut self, phases: Vec<String>) -> Self {
        self.phases = phases;
        self
    }

    /// Whether this check should run after `wave`.
    pub fn applies_to(&self, wave: &Wave) -> bool {
        self.phases.is_empty() || wave.phases.iter().any(|p| self.phases.contains(p))
    }
}

/// Raw output of a check: exit status plus diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutput {
    pub exit_code: i32,
    pub diagnostics: String,
}

impl CheckOutput {
    /// Zero signals pass, anything else signals fail.
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one check. Errors mean the check could not be run at all.
#[async_trait]
pub trait VerificationRunner: Send + Sync {
    async fn run_check(&self, check: &CheckDescriptor) -> Result<CheckOutput>;
}

/// Outcome of one check for one wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub wave: usize,
    pub check: String,
    pub passed: bool,
    pub diagnostics: String,
    /// Phases a failing check is attributed to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implicated: Vec<String>,
}

/// Aggregate of all checks run for a wave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveVerification {
    pub results: Vec<VerificationResult>,
}

impl WaveVerification {
    /// A wave with no applicable checks passes.
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &VerificationResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// Failing checks grouped by the phase they implicate.
    pub fn implicated(&self) -> BTreeMap<String, Vec<&VerificationResult>> {
        let mut by_phase: BTreeMap<String, Vec<&VerificationResult>> = BTreeMap::new();
        for result in self.failures() {
            for phase in &result.implicated {
                by_phase.entry(phase.clone()).or_default().push(result);
            }
        }
        by_phase
    }
}

/// Runs configured checks after a wave's phases succeed.
#[derive(Clone)]
pub struct VerificationGate {
    runner: Arc<dyn VerificationRunner>,
}

impl VerificationGate {
    pub fn new(runner: Arc<dyn VerificationRunner>) -> Self {
        Self { runner }
    }

    /// Run every check applicable to `wave`.
    ///
    /// `outputs` holds the latest successful output of each wave member and is
    /// used to attribute failures to phases.
    pub async fn verify(
        &self,
        wave: &Wave,
        checks: &[CheckDescriptor],
        outputs: &BTreeMap<String, TaskOutput>,
    ) -> WaveVerification {
        let mut results = Vec::new();

        for check in checks.iter().filter(|c| c.applies_to(wave)) {
            let (passed, diagnostics) = match self.runner.run_check(check).await {
                Ok(output) => (output.passed(), output.diagnostics),
                Err(e) => (false, format!("check could not run: {:#}", e)),
            };

            let implicated = if passed {
                Vec::new()
            } else {
                implicate(check, wave, outputs, &diagnostics)
            };

            if passed {
                tracing::info!(wave = wave.index, check = %check.name, "check passed");
            } else {
                tracing::warn!(
                    wave = wave.index,
                    check = %check.name,
                    implicated = ?implicated,
                    "check failed"
                );
            }

            results.push(VerificationResult {
                wave: wave.index,
                check: check.name.clone(),
                passed,
                diagnostics,
                implicated,
            });
        }

        WaveVerification { results }
    }
}

/// Attribute a failed check to wave members.
///
/// Order of preference: the check's declared scope, phases whose id or
/// artifacts appear in the diagnostics, then every member of the wave.
fn implicate(
    check: &CheckDescriptor,
    wave: &Wave,
    outputs: &BTreeMap<String, TaskOutput>,
    diagnostics: &str,
) -> Vec<String> {
    if !check.phases.is_empty() {
        return wave
            .phases
            .iter()
            .filter(|p| check.phases.contains(p))
            .cloned()
            .collect();
    }

    let mentioned: Vec<String> = wave
        .phases
        .iter()
        .filter(|p| {
            let by_artifact = outputs
                .get(p.as_str())
                .is_some_and(|o| o.artifacts.iter().any(|a| !a.is_empty() && diagnostics.contains(a.as_str())));
            by_artifact || mentions_id(diagnostics, p)
        })
        .cloned()
        .collect();

    if mentioned.is_empty() {
        wave.phases.clone()
    } else {
        mentioned
    }
}

/// Whole-word match so phase "1" is not found inside "10".
fn mentions_id(text: &str, id: &str) -> bool {
    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
    text.match_indices(id).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + id.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

/// Runs checks as shell commands in a working directory.
pub struct ShellRunner {
    shell: String,
    working_dir: PathBuf,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            shell: shell.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl VerificationRunner for ShellRunner {
    async fn run_check(&self, check: &CheckDescriptor) -> Result<CheckOutput> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&check.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn check command: {}", check.command))?;

        let limit = Duration::from_secs(check.timeout_secs);
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for check command")?,
            Err(_) => {
                return Ok(CheckOutput {
                    exit_code: -1,
                    diagnostics: format!("check timed out after {} seconds", check.timeout_secs),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let diagnostics = [stdout.trim(), stderr.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(CheckOutput {
            exit_code: output.status.code().unwrap_or(-1),
            diagnostics,
        })
    }
}
