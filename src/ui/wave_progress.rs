//! Wave execution progress UI.
//!
//! Renders [`SchedulerEvent`]s while a job runs. Three output modes:
//! - `full`: progress bars and colors
//! - `minimal`: one line per notable event
//! - `json`: one JSON object per event, for machine consumption

use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use crate::dag::WavePlan;
use crate::report::JobOutcome;
use crate::scheduler::SchedulerEvent;
use crate::ui::icons::{CHECK, CROSS, ESCALATE, RETRY, RUNNING, SKIP, SPARKLE, VERIFY, WAVE};

/// Output mode for the progress UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    #[default]
    Full,
    Minimal,
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

fn bar_style(template: &str, chars: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(chars)
}

/// Progress display for one job run.
///
/// Driven from a single task draining the scheduler's event channel.
pub struct WaveProgress {
    mode: UiMode,
    multi: MultiProgress,
    /// Overall progress in committed phases
    header_bar: ProgressBar,
    /// Running attempts keyed by phase
    attempt_bars: Mutex<HashMap<String, ProgressBar>>,
    wave_sizes: Vec<usize>,
    verbose: bool,
    term: Term,
}

impl WaveProgress {
    pub fn new(plan: &WavePlan, mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let header_bar = if mode == UiMode::Full {
            let bar = multi.add(ProgressBar::new(plan.phase_count() as u64));
            bar.set_style(bar_style(
                "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                "█▓▒░",
            ));
            bar.set_prefix("JOB");
            bar.set_message("Starting...");
            bar
        } else {
            ProgressBar::hidden()
        };
        header_bar.set_length(plan.phase_count() as u64);

        Self {
            mode,
            multi,
            header_bar,
            attempt_bars: Mutex::new(HashMap::new()),
            wave_sizes: plan.waves().iter().map(|w| w.phases.len()).collect(),
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    /// Phases counted as done so far.
    pub fn committed_phases(&self) -> u64 {
        self.header_bar.position()
    }

    pub fn handle_event(&self, event: &SchedulerEvent) {
        self.track(event);
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    /// Progress accounting shared by every mode.
    fn track(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::WaveSkipped { wave } => {
                let size = self.wave_sizes.get(*wave).copied().unwrap_or(0);
                self.header_bar.inc(size as u64);
            }
            SchedulerEvent::WaveCommitted { wave, escalated } => {
                let size = self.wave_sizes.get(*wave).copied().unwrap_or(0);
                self.header_bar.inc(size.saturating_sub(escalated.len()) as u64);
            }
            _ => {}
        }
    }

    fn handle_json(&self, event: &SchedulerEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &SchedulerEvent) {
        let line = match event {
            SchedulerEvent::WaveStarted { wave, phases } => {
                format!("Wave {}: {}", wave, phases.join(", "))
            }
            SchedulerEvent::WaveSkipped { wave } => format!("Wave {}: already committed", wave),
            SchedulerEvent::AttemptFinished {
                phase,
                attempt,
                success: false,
                detail,
            } => format!("✗ {} attempt {} ({})", phase, attempt, detail),
            SchedulerEvent::PhaseEscalated { phase, attempts, .. } => {
                format!("! {} escalated after {} attempts", phase, attempts)
            }
            SchedulerEvent::WaveCommitted { wave, escalated } if escalated.is_empty() => {
                format!("✓ wave {}", wave)
            }
            SchedulerEvent::WaveCommitted { wave, escalated } => {
                format!("✗ wave {} ({} escalated)", wave, escalated.len())
            }
            SchedulerEvent::JobFinished { outcome } => format!("Done: {}", outcome),
            _ => return,
        };
        let _ = writeln!(&self.term, "{}", line);
    }

    fn handle_full(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::WaveStarted { wave, phases } => self.on_wave_started(*wave, phases),
            SchedulerEvent::WaveSkipped { wave } => {
                self.multi
                    .println(format!(
                        "{}Wave {} {}",
                        SKIP,
                        style(wave).yellow().bold(),
                        style("already committed").dim()
                    ))
                    .ok();
            }
            SchedulerEvent::AttemptStarted { phase, attempt, .. } => {
                self.on_attempt_started(phase, *attempt)
            }
            SchedulerEvent::AttemptFinished {
                phase,
                attempt,
                success,
                detail,
            } => self.on_attempt_finished(phase, *attempt, *success, detail),
            SchedulerEvent::RetryScheduled {
                phase,
                next_attempt,
                delay_ms,
            } => {
                self.multi
                    .println(format!(
                        "    {}{} retry as attempt {}{}",
                        RETRY,
                        style(phase).yellow(),
                        next_attempt,
                        if *delay_ms > 0 {
                            format!(" in {}", format_duration(Duration::from_millis(*delay_ms)))
                        } else {
                            String::new()
                        }
                    ))
                    .ok();
            }
            SchedulerEvent::PhaseEscalated {
                phase,
                attempts,
                last_error,
            } => {
                self.multi
                    .println(format!(
                        "  {}Phase {} {} after {} attempts: {}",
                        ESCALATE,
                        style(phase).red().bold(),
                        style("escalated").red(),
                        attempts,
                        last_error
                    ))
                    .ok();
            }
            SchedulerEvent::VerificationFinished {
                wave,
                passed,
                failed_checks,
            } => {
                let status = if *passed {
                    style("PASS".to_string()).green()
                } else {
                    style(format!("FAIL ({})", failed_checks.join(", "))).red()
                };
                self.multi
                    .println(format!("  {}Verification for wave {}: {}", VERIFY, wave, status))
                    .ok();
            }
            SchedulerEvent::WaveCommitted { wave, escalated } => {
                if escalated.is_empty() {
                    self.multi
                        .println(format!(
                            "{}Wave {} {}",
                            CHECK,
                            wave,
                            style("committed").green()
                        ))
                        .ok();
                } else {
                    self.multi
                        .println(format!(
                            "{}Wave {} committed with {} escalated: {}",
                            CROSS,
                            wave,
                            style(escalated.len()).red().bold(),
                            escalated.join(", ")
                        ))
                        .ok();
                }
            }
            SchedulerEvent::JobFinished { outcome } => self.on_job_finished(*outcome),
        }
    }

    fn on_wave_started(&self, wave: usize, phases: &[String]) {
        self.multi.println("").ok();
        self.multi
            .println(format!(
                "{}{} Wave {} starting: {}",
                WAVE,
                style("═".repeat(40)).cyan(),
                style(wave).yellow().bold(),
                style(phases.join(", ")).dim()
            ))
            .ok();
        self.header_bar
            .set_message(format!("Wave {} ({} phases)", wave, phases.len()));
    }

    fn on_attempt_started(&self, phase: &str, attempt: u32) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::with_template("  {spinner} {prefix:.bold} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix(format!("[{}]", phase));
        bar.set_message(format!("{}attempt {}", RUNNING, attempt));
        bar.enable_steady_tick(Duration::from_millis(100));

        if let Ok(mut bars) = self.attempt_bars.lock()
            && let Some(previous) = bars.insert(phase.to_string(), bar)
        {
            previous.finish_and_clear();
        }

        if self.verbose {
            self.multi
                .println(format!(
                    "  {} Phase {} attempt {}",
                    style("▶").cyan(),
                    style(phase).yellow(),
                    attempt
                ))
                .ok();
        }
    }

    fn on_attempt_finished(&self, phase: &str, attempt: u32, success: bool, detail: &str) {
        let bar = self
            .attempt_bars
            .lock()
            .ok()
            .and_then(|mut bars| bars.remove(phase));
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        if success {
            self.multi
                .println(format!(
                    "  {}Phase {} {} (attempt {})",
                    SPARKLE,
                    style(phase).green().bold(),
                    style("succeeded").green(),
                    attempt
                ))
                .ok();
        } else {
            self.multi
                .println(format!(
                    "  {}Phase {} attempt {} {}: {}",
                    CROSS,
                    style(phase).red().bold(),
                    attempt,
                    style("failed").red(),
                    detail
                ))
                .ok();
        }
    }

    fn on_job_finished(&self, outcome: JobOutcome) {
        self.header_bar.finish_and_clear();
        self.multi.println("").ok();
        let banner = match outcome {
            JobOutcome::Succeeded => format!("{}Job {}", SPARKLE, style("SUCCEEDED").green().bold()),
            JobOutcome::Escalated => format!("{}Job {}", ESCALATE, style("ESCALATED").red().bold()),
            JobOutcome::Cancelled => format!("{}Job {}", CROSS, style("CANCELLED").yellow().bold()),
        };
        self.multi.println(banner).ok();
        self.multi.println("").ok();
    }

    /// Print the wave layout before execution starts.
    pub fn print_plan(&self, plan: &WavePlan) {
        if self.mode != UiMode::Full {
            return;
        }

        self.multi
            .println(format!(
                "  {} phases in {} waves",
                style(plan.phase_count()).yellow().bold(),
                style(plan.len()).yellow().bold()
            ))
            .ok();
        for wave in plan.waves() {
            let parallel = if wave.phases.len() > 1 {
                format!(" {}", style("(parallel)").dim())
            } else {
                String::new()
            };
            self.multi
                .println(format!(
                    "  Wave {}: [{}]{}",
                    style(wave.index).cyan(),
                    style(wave.phases.join(", ")).yellow(),
                    parallel
                ))
                .ok();
        }
    }
}

/// Format a duration for display.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}
