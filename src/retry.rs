//! Retry policy and the controller that applies it to failed phase attempts.
//!
//! Each retry re-runs only the failed phase, with the failure detail of the
//! previous attempt appended to its input contract. The controller itself is
//! stateless: the attempt count comes from the ledger.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ExecutionError;
use crate::phase::{FailureNote, InputContract};

/// Delay applied before a retry is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Retry immediately
    #[default]
    None,
    /// Same delay before every retry
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^(attempt - 1)`, capped at `max_ms`
    Exponential { base_ms: u64, max_ms: u64 },
}

impl BackoffStrategy {
    /// Delay before the retry that follows `failed_attempt` (1-based).
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { base_ms, max_ms } => {
                let shift = failed_attempt.saturating_sub(1).min(32);
                let delay = base_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(delay.min(max_ms))
            }
        }
    }
}

/// How prior failure detail is folded into the next attempt's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnnotationStrategy {
    /// Append the full failure detail
    #[default]
    Full,
    /// Append the failure detail truncated to at most `max_chars` characters
    Truncated { max_chars: usize },
}

impl AnnotationStrategy {
    fn annotate(&self, detail: &str) -> String {
        match *self {
            Self::Full => detail.to_string(),
            Self::Truncated { max_chars } => {
                if detail.chars().count() <= max_chars {
                    detail.to_string()
                } else {
                    let mut cut: String = detail.chars().take(max_chars).collect();
                    cut.push_str("...");
                    cut
                }
            }
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

/// Per-job retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts per phase, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default)]
    pub annotation: AnnotationStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            annotation: AnnotationStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_annotation(mut self, annotation: AnnotationStrategy) -> Self {
        self.annotation = annotation;
        self
    }
}

/// What to do with a failed phase.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Dispatch another attempt with the annotated input after `delay`.
    Retry {
        next_attempt: u32,
        input: InputContract,
        delay: Duration,
    },
    /// Budget exhausted; the phase is permanently failed.
    Escalate { attempts: u32, last_error: String },
    /// The failure cannot be remediated by retrying (job cancelled).
    Abort { reason: String },
}

/// Applies a `RetryPolicy` to failed attempts.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Build the note a failed attempt contributes to later inputs.
    pub fn failure_note(&self, attempt: u32, kind: &str, detail: &str) -> FailureNote {
        FailureNote {
            attempt,
            kind: kind.to_string(),
            detail: self.policy.annotation.annotate(detail),
        }
    }

    /// Decide the fate of `phase` after attempt number `attempt` failed with `error`.
    ///
    /// `attempt` counts attempts charged against the current budget. `input`
    /// is the contract the failed attempt ran with; a retry receives it plus
    /// one more failure note.
    pub fn on_failure(
        &self,
        phase: &str,
        input: &InputContract,
        error: &ExecutionError,
        attempt: u32,
    ) -> RetryDecision {
        if !error.is_retryable() {
            tracing::debug!(phase, attempt, "failure is not retryable");
            return RetryDecision::Abort {
                reason: error.to_string(),
            };
        }

        if attempt >= self.policy.max_attempts {
            tracing::warn!(
                phase,
                attempt,
                max_attempts = self.policy.max_attempts,
                "retry budget exhausted, escalating"
            );
            return RetryDecision::Escalate {
                attempts: attempt,
                last_error: error.to_string(),
            };
        }

        let note = self.failure_note(attempt, error.kind(), &error.to_string());
        let delay = self.policy.backoff.delay_after(attempt);
        tracing::info!(
            phase,
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );

        RetryDecision::Retry {
            next_attempt: attempt + 1,
            input: input.with_failure(note),
            delay,
        }
    }
}
