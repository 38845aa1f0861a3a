//! Ledger inspection and reset: `wavefront status`, `wavefront reset`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

use wavefront::config::WavefrontConfig;
use wavefront::phase::PhaseStatus;
use wavefront::report::{
    EscalatedPhase, JobOutcome, PhaseReport, escalated_phases, failed_checks, phase_reports,
};
use wavefront::state::StateStore;
use wavefront::verify::VerificationResult;

/// What `status --json` prints.
#[derive(Debug, Serialize)]
struct StatusView {
    goal: String,
    job_id: Option<Uuid>,
    runs: u32,
    /// `None` while the job has not finished
    outcome: Option<JobOutcome>,
    total_waves: usize,
    last_committed_wave: Option<usize>,
    phases: Vec<PhaseReport>,
    escalated: Vec<EscalatedPhase>,
    failed_checks: Vec<VerificationResult>,
}

fn status_style(status: PhaseStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        PhaseStatus::Succeeded => console::style(text).green(),
        PhaseStatus::Failed => console::style(text).red(),
        PhaseStatus::Escalated => console::style(text).red().bold(),
        PhaseStatus::Running => console::style(text).cyan(),
        PhaseStatus::Pending => console::style(text).dim(),
    }
}

pub fn cmd_status(project_dir: &Path, json: bool) -> Result<()> {
    let config = WavefrontConfig::new(project_dir.to_path_buf())?;
    let (plan_file, plan) = super::load_plan(&config)?;

    // Read-only: works while another process holds the ledger lock.
    let snapshot = wavefront::state::replay(&config.state_file(), super::declared_phases(&plan))
        .context("Failed to replay state log")?;

    let view = StatusView {
        goal: plan_file.job.goal.clone(),
        job_id: snapshot.job_id,
        runs: snapshot.runs,
        outcome: snapshot.outcome,
        total_waves: plan.len(),
        last_committed_wave: snapshot.last_committed_wave(),
        phases: phase_reports(&plan, &snapshot),
        escalated: escalated_phases(&plan, &snapshot),
        failed_checks: failed_checks(&snapshot),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!();
    println!("Wavefront Job Status");
    println!("====================");
    println!();
    println!("Goal:    {}", view.goal);
    if let Some(id) = view.job_id {
        println!("Job id:  {}", id);
    }
    let state = match (view.runs, view.outcome) {
        (0, _) => console::style("not started".to_string()).dim(),
        (_, None) => console::style("in progress".to_string()).cyan(),
        (_, Some(outcome)) if outcome.is_success() => console::style(outcome.to_string()).green(),
        (_, Some(outcome)) => console::style(outcome.to_string()).red(),
    };
    println!("State:   {}", state);
    println!(
        "Waves:   {} committed of {}",
        view.last_committed_wave.map(|w| w + 1).unwrap_or(0),
        view.total_waves
    );
    println!();

    let mut current_wave = None;
    for phase in &view.phases {
        if current_wave != Some(phase.wave) {
            println!("  Wave {}", console::style(phase.wave).cyan());
            current_wave = Some(phase.wave);
        }
        println!(
            "    {:<24} {:<10} {} attempts",
            phase.phase,
            status_style(phase.status),
            phase.attempts
        );
    }

    if !view.escalated.is_empty() {
        println!();
        println!("{}", console::style("Escalated:").red().bold());
        for e in &view.escalated {
            println!("  - {} ({} attempts): {}", e.phase, e.attempts, e.last_error);
        }
        println!();
        println!("Run 'wavefront run --retry-escalated' after fixing them.");
    }

    if !view.failed_checks.is_empty() {
        println!();
        println!("{}", console::style("Failing checks:").red().bold());
        for c in &view.failed_checks {
            println!("  - wave {} {}", c.wave, c.check);
        }
    }
    println!();
    Ok(())
}

pub fn cmd_reset(project_dir: &Path, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let config = WavefrontConfig::new(project_dir.to_path_buf())?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will discard all job progress. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    StateStore::reset(&config.state_file())?;

    let contexts = config.contexts_dir();
    if contexts.exists() {
        std::fs::remove_dir_all(&contexts).ok();
    }
    let roadmap = config.roadmap_file();
    if roadmap.exists() {
        std::fs::remove_file(&roadmap).ok();
    }

    println!("Reset complete");
    Ok(())
}
