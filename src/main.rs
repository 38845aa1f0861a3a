use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "wavefront")]
#[command(version, about = "Run dependent phases as verified, parallel waves")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log output format (logs go to stderr)
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .wavefront/ with a default config and an example plan
    Init,
    /// Decompose the plan into waves and show them
    Plan {
        /// Also write .wavefront/ROADMAP.md
        #[arg(long)]
        write: bool,
    },
    /// Run the job, resuming from the ledger if one exists
    Run {
        /// Maximum concurrent phases (overrides plan and config)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Attempts per phase before escalation (overrides plan and config)
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Give escalated phases a fresh retry budget before resuming
        #[arg(long)]
        retry_escalated: bool,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// Show job progress from the ledger
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-run the verification checks of one wave and record the result
    Verify { wave: usize },
    /// Discard the ledger and every execution context
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default wavefront.toml file
    Init,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let fallback = if verbose { "debug" } else { "info" };
    let make_filter = || {
        tracing_subscriber::EnvFilter::try_from_env("WAVEFRONT_LOG")
            .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    match format {
        LogFormat::Text => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(make_filter())
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
        LogFormat::Json => {
            let _ = tracing_subscriber::fmt()
                .json()
                .with_env_filter(make_filter())
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Plan { write } => cmd::cmd_plan(&project_dir, *write)?,
        Commands::Run {
            max_parallel,
            max_attempts,
            retry_escalated,
            ui,
        } => {
            let options = cmd::RunOptions {
                max_parallel: *max_parallel,
                max_attempts: *max_attempts,
                retry_escalated: *retry_escalated,
                ui: ui.clone(),
            };
            cmd::cmd_run(&cli, project_dir, options).await?;
        }
        Commands::Status { json } => cmd::cmd_status(&project_dir, *json)?,
        Commands::Verify { wave } => cmd::cmd_verify(&project_dir, *wave).await?,
        Commands::Reset { force } => cmd::cmd_reset(&project_dir, *force)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
