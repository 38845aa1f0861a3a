//! Wave scheduler: drives a job's plan to completion, one wave at a time.
//!
//! Within a wave every member runs in its own execution context on a spawned
//! task, bounded by a [`WorkerPool`]. Tasks never touch the ledger; they send
//! their [`ExecutionUnit`] back over a channel and the scheduler loop, which
//! owns the `&mut StateStore`, is the only writer. A wave commits once every
//! member is `Succeeded` or `Escalated` and the wave's checks have passed (or
//! a phase escalated while being remediated). Any escalation halts the job
//! after its wave commits.

pub mod pool;

pub use pool::{WorkerPermit, WorkerPool};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::context::{ContextFactory, ExecutionUnit, InputSnapshot};
use crate::dag::{Wave, WavePlan};
use crate::errors::{ExecutionError, OrchestratorError};
use crate::executor::{AttemptOutcome, ExecutorAdapter, TaskExecutor, TaskOutput};
use crate::phase::{InputContract, Job, Phase, PhaseStatus, plan_hash};
use crate::report::{JobOutcome, JobReport};
use crate::retry::{RetryController, RetryDecision};
use crate::state::{PhaseState, RecordKind, RecordedOutcome, Snapshot, StateStore};
use crate::verify::{CheckDescriptor, VerificationGate, WaveVerification};

/// Default per-attempt timeout.
pub const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 600;

/// Progress notifications for UIs. Purely informational: the ledger is the
/// record of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    WaveStarted {
        wave: usize,
        phases: Vec<String>,
    },
    /// The wave committed in an earlier run
    WaveSkipped {
        wave: usize,
    },
    AttemptStarted {
        phase: String,
        attempt: u32,
        wave: usize,
    },
    AttemptFinished {
        phase: String,
        attempt: u32,
        success: bool,
        detail: String,
    },
    RetryScheduled {
        phase: String,
        next_attempt: u32,
        delay_ms: u64,
    },
    PhaseEscalated {
        phase: String,
        attempts: u32,
        last_error: String,
    },
    VerificationFinished {
        wave: usize,
        passed: bool,
        failed_checks: Vec<String>,
    },
    WaveCommitted {
        wave: usize,
        escalated: Vec<String>,
    },
    JobFinished {
        outcome: JobOutcome,
    },
}

/// Scheduler knobs that are not part of the job itself.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Applied to phases without their own `timeout_secs`; `None` is unbounded
    pub phase_timeout: Option<Duration>,
    /// Per-resource-class concurrency sub-limits
    pub class_limits: BTreeMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            phase_timeout: Some(Duration::from_secs(DEFAULT_PHASE_TIMEOUT_SECS)),
            class_limits: BTreeMap::new(),
        }
    }
}

enum WaveResult {
    Committed { escalated: Vec<String> },
    Cancelled,
}

/// The top-level driver of a job.
pub struct WaveScheduler {
    job: Job,
    plan: WavePlan,
    config: SchedulerConfig,
    adapter: ExecutorAdapter,
    factory: ContextFactory,
    retry: RetryController,
    gate: Option<VerificationGate>,
    checks: Vec<CheckDescriptor>,
    pool: WorkerPool,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl WaveScheduler {
    /// Create a scheduler with the job's concurrency limit and retry policy,
    /// no verification checks, and contexts without scratch directories.
    pub fn new(job: Job, plan: WavePlan, executor: Arc<dyn TaskExecutor>) -> Self {
        let config = SchedulerConfig::default();
        let pool = WorkerPool::new(job.max_parallel(), &config.class_limits);
        Self {
            retry: RetryController::new(job.retry_policy().clone()),
            adapter: ExecutorAdapter::new(executor),
            factory: ContextFactory::new(),
            gate: None,
            checks: Vec::new(),
            cancel: CancellationToken::new(),
            event_tx: None,
            pool,
            config,
            job,
            plan,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.pool = WorkerPool::new(self.job.max_parallel(), &config.class_limits);
        self.config = config;
        self
    }

    /// Run `checks` through `gate` after every wave they apply to.
    pub fn with_verification(mut self, gate: VerificationGate, checks: Vec<CheckDescriptor>) -> Self {
        self.gate = Some(gate);
        self.checks = checks;
        self
    }

    pub fn with_context_factory(mut self, factory: ContextFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Use an externally owned token; cancelling it cancels the job.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn plan(&self) -> &WavePlan {
        &self.plan
    }

    /// Run (or resume) the job against `store`.
    ///
    /// Waves already committed in `store` are skipped and succeeded phases are
    /// not re-run. Escalation and cancellation are reported through the
    /// returned report's outcome, not as errors.
    pub async fn run(&self, store: &mut StateStore) -> Result<JobReport, OrchestratorError> {
        let phases: Vec<Phase> = self.plan.phases().cloned().collect();
        let job_id = store.snapshot().job_id.unwrap_or_else(|| self.job.id());
        let resumed = store.snapshot().runs > 0;

        store.append(RecordKind::JobStarted {
            job_id,
            goal: self.job.goal().to_string(),
            plan_hash: plan_hash(&phases),
        })?;
        tracing::info!(
            job = %job_id,
            goal = %self.job.goal(),
            waves = self.plan.len(),
            phases = self.plan.phase_count(),
            max_parallel = self.pool.max_parallel(),
            resumed,
            "job started"
        );

        self.recover_dangling(store)?;

        let mut outcome = JobOutcome::Succeeded;
        for wave in self.plan.waves() {
            if self.cancel.is_cancelled() {
                outcome = JobOutcome::Cancelled;
                break;
            }

            let snapshot = store.snapshot();
            if snapshot.is_wave_committed(wave.index) {
                tracing::debug!(wave = wave.index, "wave already committed, skipping");
                self.emit(SchedulerEvent::WaveSkipped { wave: wave.index }).await;
                continue;
            }
            if snapshot.committed.get(wave.index).is_some() {
                // Committed with escalations and nobody reset them.
                outcome = JobOutcome::Escalated;
                break;
            }

            let span = tracing::info_span!("wave", index = wave.index);
            match self.run_wave(store, wave).instrument(span).await? {
                WaveResult::Committed { escalated } if escalated.is_empty() => {}
                WaveResult::Committed { .. } => {
                    outcome = JobOutcome::Escalated;
                    break;
                }
                WaveResult::Cancelled => {
                    outcome = JobOutcome::Cancelled;
                    break;
                }
            }
        }

        store.append(RecordKind::JobFinished { outcome })?;
        self.emit(SchedulerEvent::JobFinished { outcome }).await;
        tracing::info!(job = %job_id, %outcome, "job finished");

        Ok(JobReport::from_snapshot(
            self.job.goal(),
            &self.plan,
            store.snapshot(),
            outcome,
        ))
    }

    /// Re-run the checks for committed wave `index` and record the results.
    ///
    /// Phase and wave state are never touched, so calling this on a wave
    /// that passed is safe and, absent external changes, passes again.
    pub async fn reverify(
        &self,
        store: &mut StateStore,
        index: usize,
    ) -> Result<WaveVerification, OrchestratorError> {
        let wave = self
            .plan
            .waves()
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("plan has no wave {}", index))?;
        if store.snapshot().committed.get(index).is_none() {
            return Err(anyhow::anyhow!("wave {} has not committed yet", index).into());
        }
        let Some(gate) = &self.gate else {
            return Ok(WaveVerification::default());
        };

        let checks = self.checks_for(wave);
        let outputs = wave_outputs(store.snapshot(), wave);
        let verification = gate.verify(wave, &checks, &outputs).await;
        self.record_verification(store, wave, &verification).await?;
        Ok(verification)
    }

    /// Close attempts a previous process started but never finished.
    fn recover_dangling(&self, store: &mut StateStore) -> Result<(), OrchestratorError> {
        for (phase, attempt) in store.snapshot().dangling_attempts() {
            tracing::warn!(%phase, attempt, "attempt was interrupted, recording it as failed");
            store.append(RecordKind::AttemptFinished {
                phase,
                attempt,
                outcome: RecordedOutcome::from(&ExecutionError::Interrupted),
            })?;
        }
        Ok(())
    }

    async fn run_wave(&self, store: &mut StateStore, wave: &Wave) -> Result<WaveResult, OrchestratorError> {
        tracing::info!(phases = ?wave.phases, "wave started");
        self.emit(SchedulerEvent::WaveStarted {
            wave: wave.index,
            phases: wave.phases.clone(),
        })
        .await;

        // At most one attempt per member is ever in flight.
        let (tx, mut rx) = mpsc::channel::<ExecutionUnit>(wave.phases.len().max(1));
        let mut inputs: BTreeMap<String, InputContract> = BTreeMap::new();
        let mut in_flight = 0usize;

        for id in &wave.phases {
            let Some(phase) = self.plan.phase(id) else {
                continue;
            };
            let Some(state) = store.snapshot().phase(id).cloned() else {
                continue;
            };
            if state.status.is_terminal() {
                continue;
            }

            if state.status == PhaseStatus::Failed
                && state.budget_used() >= self.retry.policy().max_attempts
            {
                let last_error = state.last_error.clone().unwrap_or_default();
                self.escalate(store, id, state.attempt_count(), last_error).await?;
                continue;
            }

            let input = self.rebuild_input(phase, &state);
            inputs.insert(id.clone(), input.clone());
            self.dispatch(store, wave.index, phase, input, Duration::ZERO, &tx)
                .await?;
            in_flight += 1;
        }

        loop {
            while in_flight > 0 {
                let Some(unit) = rx.recv().await else {
                    break;
                };
                in_flight -= 1;
                if self.handle_unit(store, wave, unit, &mut inputs, &tx).await? {
                    in_flight += 1;
                }
            }

            if self.cancel.is_cancelled() {
                tracing::warn!("wave cancelled before commit");
                return Ok(WaveResult::Cancelled);
            }

            if !escalated_members(store.snapshot(), wave).is_empty() {
                break;
            }

            let Some(gate) = &self.gate else {
                break;
            };
            let checks = self.checks_for(wave);
            if checks.is_empty() {
                break;
            }

            let outputs = wave_outputs(store.snapshot(), wave);
            let verification = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(WaveResult::Cancelled),
                verification = gate.verify(wave, &checks, &outputs) => verification,
            };
            self.record_verification(store, wave, &verification).await?;
            if verification.passed() {
                break;
            }

            // Remediate the implicated phases only, never the whole wave.
            for (phase_id, results) in verification.implicated() {
                let Some(first) = results.first() else {
                    continue;
                };
                let error = ExecutionError::Verification {
                    check: first.check.clone(),
                    diagnostics: first.diagnostics.clone(),
                };
                if self
                    .on_attempt_failed(store, wave.index, &phase_id, &error, &mut inputs, &tx)
                    .await?
                {
                    in_flight += 1;
                }
            }
        }

        let escalated = escalated_members(store.snapshot(), wave);
        store.append(RecordKind::WaveCommitted {
            wave: wave.index,
            escalated: escalated.clone(),
        })?;
        if escalated.is_empty() {
            tracing::info!("wave committed");
        } else {
            tracing::error!(escalated = ?escalated, "wave committed with escalated phases");
        }
        self.emit(SchedulerEvent::WaveCommitted {
            wave: wave.index,
            escalated: escalated.clone(),
        })
        .await;

        Ok(WaveResult::Committed { escalated })
    }

    /// Record a finished attempt. Returns whether a retry was dispatched.
    async fn handle_unit(
        &self,
        store: &mut StateStore,
        wave: &Wave,
        unit: ExecutionUnit,
        inputs: &mut BTreeMap<String, InputContract>,
        tx: &mpsc::Sender<ExecutionUnit>,
    ) -> Result<bool, OrchestratorError> {
        let recorded = RecordedOutcome::from(&unit.outcome);
        store.append(RecordKind::AttemptFinished {
            phase: unit.phase.clone(),
            attempt: unit.attempt,
            outcome: recorded.clone(),
        })?;
        self.emit(SchedulerEvent::AttemptFinished {
            phase: unit.phase.clone(),
            attempt: unit.attempt,
            success: recorded.is_success(),
            detail: recorded.summary(),
        })
        .await;

        match &unit.outcome {
            AttemptOutcome::Success(_) => {
                tracing::info!(phase = %unit.phase, attempt = unit.attempt, "attempt succeeded");
                Ok(false)
            }
            AttemptOutcome::Failure(error) => {
                tracing::warn!(
                    phase = %unit.phase,
                    attempt = unit.attempt,
                    error = %error,
                    "attempt failed"
                );
                self.on_attempt_failed(store, wave.index, &unit.phase, error, inputs, tx)
                    .await
            }
        }
    }

    /// Consult the retry controller. Returns whether a retry was dispatched.
    async fn on_attempt_failed(
        &self,
        store: &mut StateStore,
        wave: usize,
        phase_id: &str,
        error: &ExecutionError,
        inputs: &mut BTreeMap<String, InputContract>,
        tx: &mpsc::Sender<ExecutionUnit>,
    ) -> Result<bool, OrchestratorError> {
        let Some(phase) = self.plan.phase(phase_id) else {
            return Ok(false);
        };
        let (charged, attempts) = store
            .snapshot()
            .phase(phase_id)
            .map(|s| (s.budget_used(), s.attempt_count()))
            .unwrap_or((0, 0));
        let input = inputs
            .get(phase_id)
            .cloned()
            .unwrap_or_else(|| phase.input.clone());

        match self.retry.on_failure(phase_id, &input, error, charged) {
            RetryDecision::Retry { input, delay, .. } => {
                if self.cancel.is_cancelled() {
                    return Ok(false);
                }
                self.emit(SchedulerEvent::RetryScheduled {
                    phase: phase_id.to_string(),
                    next_attempt: attempts + 1,
                    delay_ms: delay.as_millis() as u64,
                })
                .await;
                inputs.insert(phase_id.to_string(), input.clone());
                self.dispatch(store, wave, phase, input, delay, tx).await?;
                Ok(true)
            }
            RetryDecision::Escalate { last_error, .. } => {
                self.escalate(store, phase_id, attempts, last_error).await?;
                Ok(false)
            }
            RetryDecision::Abort { reason } => {
                tracing::info!(phase = phase_id, %reason, "not retrying");
                Ok(false)
            }
        }
    }

    /// Record the attempt's start and hand it to a worker task.
    async fn dispatch(
        &self,
        store: &mut StateStore,
        wave: usize,
        phase: &Phase,
        contract: InputContract,
        delay: Duration,
        tx: &mpsc::Sender<ExecutionUnit>,
    ) -> Result<(), OrchestratorError> {
        let snapshot = store.snapshot();
        let attempt = snapshot
            .phase(&phase.id)
            .map(|s| s.attempt_count())
            .unwrap_or(0)
            + 1;
        let upstream: BTreeMap<String, TaskOutput> = phase
            .depends_on
            .iter()
            .filter_map(|dep| {
                snapshot
                    .phase(dep)
                    .and_then(|s| s.output.clone())
                    .map(|output| (dep.clone(), output))
            })
            .collect();

        let input = InputSnapshot {
            phase: phase.id.clone(),
            attempt,
            contract,
            upstream,
        };
        store.append(RecordKind::AttemptStarted {
            phase: phase.id.clone(),
            attempt,
            wave,
            input_digest: input.digest(),
        })?;
        self.emit(SchedulerEvent::AttemptStarted {
            phase: phase.id.clone(),
            attempt,
            wave,
        })
        .await;

        let task = AttemptTask {
            phase: phase.clone(),
            input,
            delay,
            timeout: phase
                .timeout_secs
                .map(Duration::from_secs)
                .or(self.config.phase_timeout),
            adapter: self.adapter.clone(),
            factory: self.factory.clone(),
            pool: self.pool.clone(),
            cancel: self.cancel.clone(),
        };
        let tx = tx.clone();
        let span = tracing::info_span!("attempt", phase = %phase.id, attempt);
        // Reported if the attempt task dies without producing a unit.
        let mut orphan = task.unstarted(ExecutionError::Cancelled);
        tokio::spawn(async move {
            let unit = match tokio::spawn(task.run().instrument(span)).await {
                Ok(unit) => unit,
                Err(e) => {
                    tracing::error!(phase = %orphan.phase, attempt = orphan.attempt, error = %e, "attempt task died");
                    let detail = if e.is_panic() {
                        format!("executor panicked: {}", panic_message(e))
                    } else {
                        format!("attempt task aborted: {}", e)
                    };
                    orphan.ended_at = Utc::now();
                    orphan.outcome = AttemptOutcome::Failure(ExecutionError::Executor(detail));
                    orphan
                }
            };
            tx.send(unit).await.ok();
        });
        Ok(())
    }

    async fn escalate(
        &self,
        store: &mut StateStore,
        phase: &str,
        attempts: u32,
        last_error: String,
    ) -> Result<(), OrchestratorError> {
        tracing::error!(phase, attempts, %last_error, "phase escalated");
        store.append(RecordKind::PhaseEscalated {
            phase: phase.to_string(),
            attempts,
            last_error: last_error.clone(),
        })?;
        self.emit(SchedulerEvent::PhaseEscalated {
            phase: phase.to_string(),
            attempts,
            last_error,
        })
        .await;
        Ok(())
    }

    async fn record_verification(
        &self,
        store: &mut StateStore,
        wave: &Wave,
        verification: &WaveVerification,
    ) -> Result<(), OrchestratorError> {
        for result in &verification.results {
            store.append(RecordKind::VerificationRecorded {
                result: result.clone(),
            })?;
        }
        self.emit(SchedulerEvent::VerificationFinished {
            wave: wave.index,
            passed: verification.passed(),
            failed_checks: verification.failures().map(|r| r.check.clone()).collect(),
        })
        .await;
        Ok(())
    }

    /// The phase's declared input plus every failure recorded since its last
    /// reset, so a resumed job feeds the same context forward.
    fn rebuild_input(&self, phase: &Phase, state: &PhaseState) -> InputContract {
        let mut input = phase.input.clone();
        for summary in state.attempts.iter().skip(state.budget_base as usize) {
            if summary.was_cancelled() {
                continue;
            }
            if let Some(RecordedOutcome::Failed { kind, detail }) = &summary.outcome {
                let charged = summary.attempt.saturating_sub(state.budget_base);
                input = input.with_failure(self.retry.failure_note(charged, kind, detail));
            }
        }
        input
    }

    fn checks_for(&self, wave: &Wave) -> Vec<CheckDescriptor> {
        self.checks
            .iter()
            .filter(|c| c.applies_to(wave))
            .cloned()
            .collect()
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

fn escalated_members(snapshot: &Snapshot, wave: &Wave) -> Vec<String> {
    wave.phases
        .iter()
        .filter(|id| snapshot.status(id) == Some(PhaseStatus::Escalated))
        .cloned()
        .collect()
}

fn wave_outputs(snapshot: &Snapshot, wave: &Wave) -> BTreeMap<String, TaskOutput> {
    wave.phases
        .iter()
        .filter_map(|id| {
            snapshot
                .phase(id)
                .and_then(|s| s.output.clone())
                .map(|output| (id.clone(), output))
        })
        .collect()
}

fn panic_message(error: tokio::task::JoinError) -> String {
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Everything a worker task needs for one attempt.
struct AttemptTask {
    phase: Phase,
    input: InputSnapshot,
    delay: Duration,
    timeout: Option<Duration>,
    adapter: ExecutorAdapter,
    factory: ContextFactory,
    pool: WorkerPool,
    cancel: CancellationToken,
}

impl AttemptTask {
    async fn run(self) -> ExecutionUnit {
        if !self.delay.is_zero() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.unstarted(ExecutionError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.unstarted(ExecutionError::Cancelled),
            permit = self.pool.acquire(&self.phase.resource_class) => match permit {
                Ok(permit) => permit,
                Err(e) => return self.unstarted(e),
            },
        };

        let context = match self.factory.create(&self.phase, self.input.clone()) {
            Ok(context) => context,
            Err(e) => return self.unstarted(e),
        };
        let outcome = self.adapter.run(&context, self.timeout, &self.cancel).await;
        self.factory.destroy(context, outcome)
    }

    /// A unit for an attempt that never got a context.
    fn unstarted(&self, error: ExecutionError) -> ExecutionUnit {
        let now = Utc::now();
        ExecutionUnit {
            context_id: Uuid::nil(),
            phase: self.phase.id.clone(),
            attempt: self.input.attempt,
            resource_class: self.phase.resource_class.clone(),
            input_digest: self.input.digest(),
            started_at: now,
            ended_at: now,
            outcome: AttemptOutcome::Failure(error),
        }
    }
}
