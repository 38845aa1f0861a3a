//! Task executor seam and the adapter that normalizes its results.
//!
//! The adapter handles:
//! - Per-attempt timeouts (a timeout becomes a failed attempt)
//! - Job-level cancellation (an in-flight attempt resolves as cancelled)
//! - Mapping executor errors into `ExecutionError`
//!
//! `CommandExecutor` is the shell-backed executor used by the CLI.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::errors::ExecutionError;

/// Artifacts and decisions produced by a successful attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
}

impl TaskOutput {
    pub fn new(artifacts: Vec<String>, decisions: Vec<String>) -> Self {
        Self {
            artifacts,
            decisions,
        }
    }

    /// One-line summary stored in logs and reports.
    pub fn summary(&self) -> String {
        format!(
            "{} artifact(s), {} decision(s)",
            self.artifacts.len(),
            self.decisions.len()
        )
    }
}

/// Normalized result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(TaskOutput),
    Failure(ExecutionError),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Performs the work of one phase attempt.
///
/// Implementations must not keep state between invocations; everything an
/// attempt may use arrives through the context.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, context: &ExecutionContext) -> Result<TaskOutput>;
}

/// Runs a `TaskExecutor` inside a context with timeout and cancellation.
#[derive(Clone)]
pub struct ExecutorAdapter {
    executor: Arc<dyn TaskExecutor>,
}

impl ExecutorAdapter {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self { executor }
    }

    /// Run one attempt. `timeout` of `None` means the attempt is unbounded.
    pub async fn run(
        &self,
        context: &ExecutionContext,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        if cancel.is_cancelled() {
            return AttemptOutcome::Failure(ExecutionError::Cancelled);
        }

        let work = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, self.executor.execute(context)).await {
                    Ok(result) => result.map_err(executor_error),
                    Err(_) => Err(ExecutionError::Timeout {
                        secs: limit.as_secs(),
                    }),
                },
                None => self.executor.execute(context).await.map_err(executor_error),
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            result = work => result,
        };

        match result {
            Ok(output) => AttemptOutcome::Success(output),
            Err(error) => AttemptOutcome::Failure(error),
        }
    }
}

fn executor_error(error: anyhow::Error) -> ExecutionError {
    ExecutionError::Executor(format!("{:#}", error))
}

/// Executes a phase's `command` through a shell.
///
/// - The input snapshot is written to stdin as JSON
/// - `WAVEFRONT_PHASE`, `WAVEFRONT_ATTEMPT` and `WAVEFRONT_CONTEXT_DIR` are set
/// - Exit code 0 = success; stdout is parsed as a `TaskOutput` JSON object,
///   otherwise each non-empty line is taken as an artifact
/// - Any other exit code = failure with stderr as detail
pub struct CommandExecutor {
    shell: String,
    working_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(shell: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            shell: shell.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, context: &ExecutionContext) -> Result<TaskOutput> {
        let Some(command) = context.command() else {
            bail!("Phase {} has no command to run", context.phase());
        };

        let input_json = serde_json::to_string(context.snapshot())
            .context("Failed to serialize input snapshot")?;
        let context_dir = context
            .scratch_dir()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("WAVEFRONT_PHASE", context.phase())
            .env("WAVEFRONT_ATTEMPT", context.attempt().to_string())
            .env("WAVEFRONT_CONTEXT_DIR", context_dir)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn phase command: {}", command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early
            if let Err(e) = stdin.write_all(input_json.as_bytes()).await
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(e).context("Failed to write input snapshot to phase stdin");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for phase command")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            if stderr.trim().is_empty() {
                bail!("command exited with code {}", code);
            }
            bail!("command exited with code {}: {}", code, stderr.trim());
        }

        Ok(parse_output(&stdout))
    }
}

fn parse_output(stdout: &str) -> TaskOutput {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return TaskOutput::default();
    }
    if let Ok(output) = serde_json::from_str::<TaskOutput>(trimmed) {
        return output;
    }
    TaskOutput {
        artifacts: trimmed
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
        decisions: Vec::new(),
    }
}
