//! Job execution: `wavefront run`, `wavefront verify`.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::super::Cli;
use wavefront::config::WavefrontConfig;
use wavefront::context::ContextFactory;
use wavefront::executor::CommandExecutor;
use wavefront::scheduler::{SchedulerEvent, WaveScheduler};
use wavefront::state::{RecordKind, StateStore};
use wavefront::ui::{UiMode, WaveProgress};
use wavefront::verify::{ShellRunner, VerificationGate};

/// Flags of `wavefront run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_parallel: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_escalated: bool,
    pub ui: String,
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling job");
            token.cancel();
        }
    });
}

/// Hand every escalated phase a fresh retry budget.
fn reset_escalated(store: &mut StateStore) -> Result<Vec<String>> {
    let escalated: Vec<String> = store
        .snapshot()
        .escalated()
        .into_iter()
        .map(|(id, _)| id.to_string())
        .collect();
    for phase in &escalated {
        store.append(RecordKind::PhaseReset {
            phase: phase.clone(),
        })?;
    }
    Ok(escalated)
}

fn verification_gate(config: &WavefrontConfig) -> VerificationGate {
    VerificationGate::new(Arc::new(ShellRunner::new(
        config.shell(),
        &config.project_dir,
    )))
}

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, options: RunOptions) -> Result<()> {
    let config = WavefrontConfig::with_cli_args(
        project_dir,
        cli.verbose,
        options.max_parallel,
        options.max_attempts,
    )?;
    super::warn_config(&config);

    let (plan_file, plan) = super::load_plan(&config)?;
    let job = config.job_for(&plan_file.job);
    let mut store = StateStore::open(&config.state_file(), super::declared_phases(&plan))?;

    if options.retry_escalated {
        for phase in reset_escalated(&mut store)? {
            println!(
                "{} {}",
                console::style("Reset escalated phase").yellow(),
                phase
            );
        }
    }

    let mode = UiMode::parse(&options.ui);
    let ui = Arc::new(WaveProgress::new(&plan, mode, cli.verbose));
    if mode == UiMode::Full {
        println!();
        println!("{}", console::style(format!("Job: {}", job.goal())).bold().cyan());
        println!("─────────────────────────");
        println!("Max parallel: {}", job.max_parallel());
        println!("Max attempts: {}", job.retry_policy().max_attempts);
        if !config.checks().is_empty() {
            println!("Checks: {}", config.checks().len());
        }
        ui.print_plan(&plan);
    }

    let (event_tx, mut event_rx) = mpsc::channel::<SchedulerEvent>(256);
    let ui_task = {
        let ui = Arc::clone(&ui);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                ui.handle_event(&event);
            }
        })
    };

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let executor = Arc::new(CommandExecutor::new(config.shell(), &config.project_dir));
    let scheduler = WaveScheduler::new(job, plan, executor)
        .with_config(config.scheduler_config())
        .with_verification(verification_gate(&config), config.checks().to_vec())
        .with_context_factory(ContextFactory::with_scratch_root(config.contexts_dir()))
        .with_event_channel(event_tx)
        .with_cancellation(cancel);

    let result = scheduler.run(&mut store).await;

    let completed: BTreeSet<String> = store
        .snapshot()
        .phases
        .iter()
        .filter(|(_, state)| state.status.is_success())
        .map(|(id, _)| id.clone())
        .collect();
    let roadmap = scheduler
        .plan()
        .to_roadmap(scheduler.job().goal(), &completed);

    // Closes the event channel so the UI task drains and exits.
    drop(scheduler);
    let _ = ui_task.await;

    let report = result?;
    if let Err(e) = std::fs::write(config.roadmap_file(), roadmap) {
        tracing::warn!(error = %e, "failed to write roadmap");
    }

    if mode == UiMode::Json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        print!("{}", report.render());
    }

    report.into_result()?;
    Ok(())
}

pub async fn cmd_verify(project_dir: &Path, wave: usize) -> Result<()> {
    let config = WavefrontConfig::new(project_dir.to_path_buf())?;
    super::warn_config(&config);

    let (plan_file, plan) = super::load_plan(&config)?;
    let job = config.job_for(&plan_file.job);
    let mut store = StateStore::open(&config.state_file(), super::declared_phases(&plan))?;

    let executor = Arc::new(CommandExecutor::new(config.shell(), &config.project_dir));
    let scheduler = WaveScheduler::new(job, plan, executor)
        .with_verification(verification_gate(&config), config.checks().to_vec());

    let verification = scheduler.reverify(&mut store, wave).await?;
    if verification.results.is_empty() {
        println!("No checks apply to wave {}.", wave);
        return Ok(());
    }

    for result in &verification.results {
        let status = if result.passed {
            console::style("PASS").green()
        } else {
            console::style("FAIL").red()
        };
        println!("  {} {}", status, result.check);
        if !result.passed && !result.diagnostics.is_empty() {
            for line in result.diagnostics.lines().take(20) {
                println!("      {}", console::style(line).dim());
            }
        }
    }

    if !verification.passed() {
        let implicated: Vec<String> = verification.implicated().into_keys().collect();
        anyhow::bail!(
            "Wave {} failed verification (implicated: {})",
            wave,
            implicated.join(", ")
        );
    }
    println!("Wave {} verified.", wave);
    Ok(())
}
