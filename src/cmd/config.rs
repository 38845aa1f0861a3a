//! Configuration view and validation: `wavefront config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;
use wavefront::config::{WavefrontConfig, WavefrontToml};
use wavefront::retry::{AnnotationStrategy, BackoffStrategy};

fn print_toml(toml: &WavefrontToml) {
    println!("[scheduler]");
    println!("  max_parallel = {}", toml.scheduler.max_parallel);
    println!("  phase_timeout_secs = {}", toml.scheduler.phase_timeout_secs);
    for (class, limit) in &toml.scheduler.resource_classes {
        println!("  resource_classes.{} = {}", class, limit);
    }
    println!();

    println!("[retry]");
    println!("  max_attempts = {}", toml.retry.max_attempts);
    match toml.retry.backoff {
        BackoffStrategy::None => println!("  backoff = none"),
        BackoffStrategy::Fixed { delay_ms } => println!("  backoff = fixed {}ms", delay_ms),
        BackoffStrategy::Exponential { base_ms, max_ms } => {
            println!("  backoff = exponential {}ms..{}ms", base_ms, max_ms)
        }
    }
    match toml.retry.annotation {
        AnnotationStrategy::Full => println!("  annotation = full"),
        AnnotationStrategy::Truncated { max_chars } => {
            println!("  annotation = truncated to {} chars", max_chars)
        }
    }
    println!();

    println!("[executor]");
    println!("  shell = \"{}\"", toml.executor.shell);
    println!();

    if !toml.checks.is_empty() {
        println!("[[checks]]");
        for check in &toml.checks {
            let scope = if check.phases.is_empty() {
                "every wave".to_string()
            } else {
                check.phases.join(", ")
            };
            println!(
                "  {} = \"{}\" ({}s, {})",
                check.name, check.command, check.timeout_secs, scope
            );
        }
        println!();
    }

    if !toml.phases.overrides.is_empty() {
        println!("[phases.overrides]");
        for (pattern, override_cfg) in &toml.phases.overrides {
            println!("  \"{}\":", pattern);
            if let Some(class) = &override_cfg.resource_class {
                println!("    resource_class = \"{}\"", class);
            }
            if let Some(secs) = override_cfg.timeout_secs {
                println!("    timeout_secs = {}", secs);
            }
        }
        println!();
    }
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = WavefrontConfig::new(project_dir.to_path_buf())?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Wavefront Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No wavefront.toml found at {}", config_path.display());
                println!("Using default configuration:");
            }
            println!();
            print_toml(&config.toml);

            println!("Effective values (with env overrides):");
            println!("  max_parallel = {}", config.max_parallel());
            println!("  max_attempts = {}", config.max_attempts());
            match config.phase_timeout() {
                Some(timeout) => println!("  phase_timeout = {}s", timeout.as_secs()),
                None => println!("  phase_timeout = none"),
            }
            println!();
            if !config_path.exists() {
                println!("Run 'wavefront config init' to create a wavefront.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No wavefront.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("wavefront.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.wavefront_dir)?;
            WavefrontToml::default().save(&config_path)?;

            println!("Created wavefront.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [scheduler] max_parallel, phase_timeout_secs, resource_classes");
            println!("  - [retry] max_attempts, backoff, annotation");
            println!("  - [[checks]] verification commands run after each wave");
            println!("  - [phases.overrides.\"pattern-*\"] for phase-specific settings");
            println!();
        }
    }

    Ok(())
}
