//! CLI command implementations.
//!
//! | Module    | Commands handled        |
//! |-----------|-------------------------|
//! | `project` | `Init`, `Plan`          |
//! | `run`     | `Run`, `Verify`         |
//! | `status`  | `Status`, `Reset`       |
//! | `config`  | `Config`                |

pub mod config;
pub mod project;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use project::{cmd_init, cmd_plan};
pub use run::{RunOptions, cmd_run, cmd_verify};
pub use status::{cmd_reset, cmd_status};

use anyhow::{Context, Result};
use wavefront::config::WavefrontConfig;
use wavefront::dag::WavePlan;
use wavefront::phase::PlanFile;

/// Load `plan.json`, apply `[phases.overrides]` and decompose it.
pub fn load_plan(config: &WavefrontConfig) -> Result<(PlanFile, WavePlan)> {
    let path = config.plan_file();
    if !path.exists() {
        anyhow::bail!(
            "No plan found at {}. Run 'wavefront init' to create one.",
            path.display()
        );
    }

    let mut plan_file = PlanFile::load(&path)?;
    config.toml.apply_overrides(&mut plan_file.phases);
    let plan = WavePlan::from_phases(&plan_file.phases)
        .with_context(|| format!("Invalid plan in {}", path.display()))?;
    Ok((plan_file, plan))
}

/// Ids of every phase in `plan`, for opening the ledger.
pub fn declared_phases(plan: &WavePlan) -> Vec<String> {
    plan.phases().map(|p| p.id.clone()).collect()
}

/// Print config warnings to stderr.
pub fn warn_config(config: &WavefrontConfig) {
    for warning in config.validate() {
        eprintln!("{} {}", console::style("warning:").yellow().bold(), warning);
    }
}
