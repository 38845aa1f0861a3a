//! Project setup and plan inspection: `wavefront init`, `wavefront plan`.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::Path;

use wavefront::config::{WavefrontConfig, WavefrontToml};
use wavefront::phase::{JobSpec, Phase, PlanFile};

fn example_plan() -> PlanFile {
    PlanFile {
        job: JobSpec {
            goal: "example".to_string(),
            max_parallel: None,
            retry: None,
        },
        phases: vec![
            Phase::new("schema", "Create schema", vec![]).with_command("echo schema"),
            Phase::new("config", "Write config", vec![]).with_command("echo config"),
            Phase::new(
                "service",
                "Build service",
                vec!["schema".to_string(), "config".to_string()],
            )
            .with_command("echo service"),
        ],
    }
}

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let config = WavefrontConfig::new(project_dir.to_path_buf())?;
    std::fs::create_dir_all(&config.wavefront_dir).with_context(|| {
        format!(
            "Failed to create directory: {}",
            config.wavefront_dir.display()
        )
    })?;

    let mut created = Vec::new();
    let config_file = config.config_file();
    if !config_file.exists() {
        WavefrontToml::default().save(&config_file)?;
        created.push("wavefront.toml  # Scheduler, retry and check settings");
    }
    let plan_file = config.plan_file();
    if !plan_file.exists() {
        example_plan().save(&plan_file)?;
        created.push("plan.json       # Job goal and phases");
    }

    if created.is_empty() {
        println!(
            "Wavefront project already initialized at {}",
            config.wavefront_dir.display()
        );
        return Ok(());
    }

    println!(
        "Initialized wavefront project at {}",
        config.wavefront_dir.display()
    );
    println!();
    println!("Created:");
    for line in created {
        println!("  {}", line);
    }
    println!();
    println!("Next steps:");
    println!("  1. Edit plan.json with your phases");
    println!("  2. Run `wavefront plan` to check the waves");
    println!("  3. Run `wavefront run` to start execution");
    Ok(())
}

pub fn cmd_plan(project_dir: &Path, write: bool) -> Result<()> {
    let config = WavefrontConfig::new(project_dir.to_path_buf())?;
    super::warn_config(&config);
    let (plan_file, plan) = super::load_plan(&config)?;

    println!();
    println!(
        "{}",
        console::style(format!("Plan: {}", plan_file.job.goal)).bold().cyan()
    );
    println!(
        "  {} phases in {} waves",
        console::style(plan.phase_count()).yellow().bold(),
        console::style(plan.len()).yellow().bold()
    );
    println!();
    for wave in plan.waves() {
        println!(
            "  Wave {}: [{}]",
            console::style(wave.index).cyan(),
            console::style(wave.phases.join(", ")).yellow()
        );
    }
    println!();

    if write {
        let completed: BTreeSet<String> = match wavefront::state::replay(
            &config.state_file(),
            super::declared_phases(&plan),
        ) {
            Ok(snapshot) => snapshot
                .phases
                .iter()
                .filter(|(_, state)| state.status.is_success())
                .map(|(id, _)| id.clone())
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read ledger, rendering roadmap without progress");
                BTreeSet::new()
            }
        };
        let roadmap = plan.to_roadmap(&plan_file.job.goal, &completed);
        let path = config.roadmap_file();
        std::fs::write(&path, roadmap)
            .with_context(|| format!("Failed to write roadmap: {}", path.display()))?;
        println!("Wrote {}", path.display());
    }

    Ok(())
}
