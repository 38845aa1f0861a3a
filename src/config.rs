//! Layered configuration for wavefront.
//!
//! Settings come from `.wavefront/wavefront.toml`, then environment
//! variables, then CLI flags, later layers winning. Every section of the
//! file is optional.
//!
//! ```toml
//! [scheduler]
//! max_parallel = 5
//! phase_timeout_secs = 600
//!
//! [scheduler.resource_classes]
//! heavy = 1
//!
//! [retry]
//! max_attempts = 3
//! backoff = { kind = "exponential", base_ms = 500, max_ms = 30000 }
//! annotation = { kind = "truncated", max_chars = 2000 }
//!
//! [executor]
//! shell = "sh"
//!
//! [[checks]]
//! name = "build"
//! command = "cargo build"
//! timeout_secs = 900
//!
//! [phases.overrides."db-*"]
//! resource_class = "heavy"
//! timeout_secs = 1200
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::phase::{DEFAULT_MAX_PARALLEL, Job, JobSpec, Phase, ResourceClass};
use crate::retry::RetryPolicy;
use crate::scheduler::{DEFAULT_PHASE_TIMEOUT_SECS, SchedulerConfig};
use crate::verify::CheckDescriptor;

/// Name of the per-project state directory.
pub const WAVEFRONT_DIR: &str = ".wavefront";

pub const ENV_MAX_PARALLEL: &str = "WAVEFRONT_MAX_PARALLEL";
pub const ENV_MAX_ATTEMPTS: &str = "WAVEFRONT_MAX_ATTEMPTS";
pub const ENV_PHASE_TIMEOUT_SECS: &str = "WAVEFRONT_PHASE_TIMEOUT_SECS";

/// Concurrency and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Max parallel phases per wave
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Per-attempt timeout; 0 disables it
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Sub-limits keyed by resource class
    #[serde(default)]
    pub resource_classes: BTreeMap<String, usize>,
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

fn default_phase_timeout_secs() -> u64 {
    DEFAULT_PHASE_TIMEOUT_SECS
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            phase_timeout_secs: default_phase_timeout_secs(),
            resource_classes: BTreeMap::new(),
        }
    }
}

/// Shell used for phase commands and checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

/// Settings applied to every phase whose id matches a pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub resource_class: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesConfig {
    /// Pattern-based overrides (e.g., "db-*" -> PhaseOverride)
    #[serde(default)]
    pub overrides: BTreeMap<String, PhaseOverride>,
}

/// The complete wavefront.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WavefrontToml {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub checks: Vec<CheckDescriptor>,
    #[serde(default)]
    pub phases: PhasesConfig,
}

impl WavefrontToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse wavefront.toml")
    }

    /// Load `wavefront.toml` from `dir`, or the defaults if it doesn't exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join("wavefront.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize wavefront.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply matching `[phases.overrides]` to `phases`.
    ///
    /// Patterns are applied in sorted order, so when several match, the
    /// lexically last pattern wins.
    pub fn apply_overrides(&self, phases: &mut [Phase]) {
        for phase in phases.iter_mut() {
            for (pattern, override_cfg) in &self.phases.overrides {
                if !pattern_matches(pattern, &phase.id) {
                    continue;
                }
                if let Some(ref class) = override_cfg.resource_class {
                    phase.resource_class = ResourceClass::new(class.clone());
                }
                if let Some(secs) = override_cfg.timeout_secs {
                    phase.timeout_secs = Some(secs);
                }
            }
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.scheduler.max_parallel == 0 {
            warnings.push("scheduler.max_parallel is 0; at least 1 phase will run at a time".to_string());
        }

        for (class, limit) in &self.scheduler.resource_classes {
            if *limit > self.scheduler.max_parallel {
                warnings.push(format!(
                    "resource class '{}' limit {} exceeds max_parallel {}; it will be capped",
                    class, limit, self.scheduler.max_parallel
                ));
            }
            if *limit == 0 {
                warnings.push(format!(
                    "resource class '{}' limit is 0; it will be raised to 1",
                    class
                ));
            }
        }

        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; every failure escalates immediately".to_string());
        }

        for check in &self.checks {
            if check.command.trim().is_empty() {
                warnings.push(format!("check '{}' has an empty command", check.name));
            }
        }

        warnings
    }
}

/// Check if a pattern matches a phase id.
/// Supports simple glob patterns:
/// - `*` matches any sequence of characters
/// - `?` matches any single character
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    glob_match(&pattern, &name)
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(var = name, %value, "ignoring unparsable environment override");
            None
        }
    }
}

/// Resolved configuration: wavefront.toml plus environment and CLI layers.
#[derive(Debug, Clone)]
pub struct WavefrontConfig {
    pub project_dir: PathBuf,
    pub wavefront_dir: PathBuf,
    pub toml: WavefrontToml,
    pub verbose: bool,
    pub cli_max_parallel: Option<usize>,
    pub cli_max_attempts: Option<u32>,
}

impl WavefrontConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let wavefront_dir = project_dir.join(WAVEFRONT_DIR);
        let toml = WavefrontToml::load_or_default(&wavefront_dir)?;

        Ok(Self {
            project_dir,
            wavefront_dir,
            toml,
            verbose: false,
            cli_max_parallel: None,
            cli_max_attempts: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        max_parallel: Option<usize>,
        max_attempts: Option<u32>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_max_parallel = max_parallel;
        config.cli_max_attempts = max_attempts;
        Ok(config)
    }

    /// CLI → env → file.
    pub fn max_parallel(&self) -> usize {
        self.cli_max_parallel
            .or_else(|| env_parse(ENV_MAX_PARALLEL))
            .unwrap_or(self.toml.scheduler.max_parallel)
    }

    /// CLI → env → file.
    pub fn max_attempts(&self) -> u32 {
        self.cli_max_attempts
            .or_else(|| env_parse(ENV_MAX_ATTEMPTS))
            .unwrap_or(self.toml.retry.max_attempts)
    }

    /// env → file. `None` when the timeout is disabled.
    pub fn phase_timeout(&self) -> Option<Duration> {
        let secs = env_parse(ENV_PHASE_TIMEOUT_SECS).unwrap_or(self.toml.scheduler.phase_timeout_secs);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Build the job for `spec`.
    ///
    /// Limits resolve CLI → env → plan file → wavefront.toml.
    pub fn job_for(&self, spec: &JobSpec) -> Job {
        let max_parallel = self
            .cli_max_parallel
            .or_else(|| env_parse(ENV_MAX_PARALLEL))
            .or(spec.max_parallel)
            .unwrap_or(self.toml.scheduler.max_parallel);

        let mut policy = spec.retry.clone().unwrap_or_else(|| self.toml.retry.clone());
        if let Some(max_attempts) = self.cli_max_attempts.or_else(|| env_parse(ENV_MAX_ATTEMPTS)) {
            policy = policy.with_max_attempts(max_attempts);
        }

        Job::with_limits(spec.goal.clone(), max_parallel, policy)
    }

    /// Retry policy from the file, with the attempt budget layered.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.toml.retry.clone().with_max_attempts(self.max_attempts())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            phase_timeout: self.phase_timeout(),
            class_limits: self.toml.scheduler.resource_classes.clone(),
        }
    }

    pub fn shell(&self) -> &str {
        &self.toml.executor.shell
    }

    pub fn checks(&self) -> &[CheckDescriptor] {
        &self.toml.checks
    }

    pub fn config_file(&self) -> PathBuf {
        self.wavefront_dir.join("wavefront.toml")
    }

    pub fn plan_file(&self) -> PathBuf {
        self.wavefront_dir.join("plan.json")
    }

    pub fn state_file(&self) -> PathBuf {
        self.wavefront_dir.join("state.jsonl")
    }

    /// Root under which execution contexts get scratch directories.
    pub fn contexts_dir(&self) -> PathBuf {
        self.wavefront_dir.join("contexts")
    }

    pub fn roadmap_file(&self) -> PathBuf {
        self.wavefront_dir.join("ROADMAP.md")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{AnnotationStrategy, BackoffStrategy};
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    // =========================================
    // Pattern matching tests
    // =========================================

    #[test]
    fn test_pattern_matches_exact() {
        assert!(pattern_matches("db-schema", "db-schema"));
        assert!(!pattern_matches("db-schema", "db-schemas"));
    }

    #[test]
    fn test_pattern_matches_star() {
        assert!(pattern_matches("db-*", "db-migrate"));
        assert!(pattern_matches("*-api", "users-api"));
        assert!(pattern_matches("a*c", "abbbc"));
        assert!(pattern_matches("*", "anything"));
        assert!(!pattern_matches("db-*", "api-db"));
    }

    #[test]
    fn test_pattern_matches_question_mark() {
        assert!(pattern_matches("0?", "05"));
        assert!(!pattern_matches("0?", "105"));
    }

    #[test]
    fn test_pattern_matches_case_insensitive() {
        assert!(pattern_matches("DB-*", "db-Migrate"));
    }

    // =========================================
    // WavefrontToml tests
    // =========================================

    #[test]
    fn test_parse_empty() {
        let toml = WavefrontToml::parse("").unwrap();
        assert_eq!(toml.scheduler.max_parallel, DEFAULT_MAX_PARALLEL);
        assert_eq!(toml.scheduler.phase_timeout_secs, 600);
        assert_eq!(toml.retry, RetryPolicy::default());
        assert_eq!(toml.executor.shell, "sh");
        assert!(toml.checks.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let content = r#"
[scheduler]
max_parallel = 3
phase_timeout_secs = 30

[scheduler.resource_classes]
heavy = 1

[retry]
max_attempts = 4
backoff = { kind = "exponential", base_ms = 100, max_ms = 1000 }
annotation = { kind = "truncated", max_chars = 200 }

[executor]
shell = "bash"

[[checks]]
name = "build"
command = "cargo build"

[[checks]]
name = "db-tests"
command = "cargo test db"
timeout_secs = 60
phases = ["db-migrate"]

[phases.overrides."db-*"]
resource_class = "heavy"
timeout_secs = 1200
"#;
        let toml = WavefrontToml::parse(content).unwrap();
        assert_eq!(toml.scheduler.max_parallel, 3);
        assert_eq!(toml.scheduler.resource_classes.get("heavy"), Some(&1));
        assert_eq!(toml.retry.max_attempts, 4);
        assert_eq!(
            toml.retry.backoff,
            BackoffStrategy::Exponential {
                base_ms: 100,
                max_ms: 1000
            }
        );
        assert_eq!(
            toml.retry.annotation,
            AnnotationStrategy::Truncated { max_chars: 200 }
        );
        assert_eq!(toml.executor.shell, "bash");
        assert_eq!(toml.checks.len(), 2);
        assert_eq!(toml.checks[0].timeout_secs, 600);
        assert_eq!(toml.checks[1].phases, vec!["db-migrate"]);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_apply_overrides() {
        let toml = WavefrontToml::parse(
            r#"
[phases.overrides."db-*"]
resource_class = "heavy"

[phases.overrides."db-seed"]
timeout_secs = 5
"#,
        )
        .unwrap();
        let mut phases = vec![
            Phase::new("db-migrate", "Migrate", vec![]),
            Phase::new("db-seed", "Seed", vec![]),
            Phase::new("api", "API", vec![]),
        ];
        toml.apply_overrides(&mut phases);

        assert_eq!(phases[0].resource_class.as_str(), "heavy");
        assert_eq!(phases[0].timeout_secs, None);
        assert_eq!(phases[1].resource_class.as_str(), "heavy");
        assert_eq!(phases[1].timeout_secs, Some(5));
        assert!(phases[2].resource_class.is_default());
    }

    #[test]
    fn test_validate_warnings() {
        let toml = WavefrontToml::parse(
            r#"
[scheduler]
max_parallel = 2

[scheduler.resource_classes]
gpu = 8

[retry]
max_attempts = 0

[[checks]]
name = "noop"
command = "  "
"#,
        )
        .unwrap();
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("gpu")));
        assert!(warnings.iter().any(|w| w.contains("max_attempts")));
        assert!(warnings.iter().any(|w| w.contains("noop")));
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wavefront.toml");
        let mut toml = WavefrontToml::default();
        toml.scheduler.max_parallel = 9;
        toml.checks.push(CheckDescriptor::new("lint", "cargo clippy"));
        toml.save(&path).unwrap();

        let loaded = WavefrontToml::load(&path).unwrap();
        assert_eq!(loaded.scheduler.max_parallel, 9);
        assert_eq!(loaded.checks[0].name, "lint");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = WavefrontToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.scheduler.max_parallel, DEFAULT_MAX_PARALLEL);
    }

    #[test]
    fn test_parse_invalid() {
        let err = WavefrontToml::parse("[scheduler]\nmax_parallel = \"many\"").unwrap_err();
        assert!(err.to_string().contains("wavefront.toml"));
    }

    // =========================================
    // WavefrontConfig tests
    // =========================================

    #[test]
    fn test_config_paths() {
        let dir = tempdir().unwrap();
        let config = WavefrontConfig::new(dir.path().to_path_buf()).unwrap();

        assert!(config.plan_file().ends_with(".wavefront/plan.json"));
        assert!(config.state_file().ends_with(".wavefront/state.jsonl"));
        assert!(config.contexts_dir().ends_with(".wavefront/contexts"));
        assert!(config.roadmap_file().ends_with(".wavefront/ROADMAP.md"));
        assert!(config.config_file().ends_with(".wavefront/wavefront.toml"));
    }

    #[test]
    fn test_config_layering() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(ENV_MAX_PARALLEL).ok();
        unsafe { std::env::remove_var(ENV_MAX_PARALLEL) };

        let dir = tempdir().unwrap();
        let wf_dir = dir.path().join(WAVEFRONT_DIR);
        std::fs::create_dir_all(&wf_dir).unwrap();
        std::fs::write(
            wf_dir.join("wavefront.toml"),
            "[scheduler]\nmax_parallel = 4\nphase_timeout_secs = 0\n",
        )
        .unwrap();

        // File
        let config = WavefrontConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.max_parallel(), 4);

        // Env beats file
        unsafe { std::env::set_var(ENV_MAX_PARALLEL, "7") };
        assert_eq!(config.max_parallel(), 7);

        // CLI beats env
        let config =
            WavefrontConfig::with_cli_args(dir.path().to_path_buf(), true, Some(2), Some(6)).unwrap();
        assert_eq!(config.max_parallel(), 2);
        assert_eq!(config.retry_policy().max_attempts, 6);
        assert!(config.verbose);

        unsafe { std::env::remove_var(ENV_MAX_PARALLEL) };
        if let Some(val) = saved {
            unsafe { std::env::set_var(ENV_MAX_PARALLEL, val) };
        }
    }

    #[test]
    fn test_job_for_prefers_plan_over_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(ENV_MAX_PARALLEL).ok();
        let saved_attempts = std::env::var(ENV_MAX_ATTEMPTS).ok();
        unsafe {
            std::env::remove_var(ENV_MAX_PARALLEL);
            std::env::remove_var(ENV_MAX_ATTEMPTS);
        }

        let dir = tempdir().unwrap();
        let config = WavefrontConfig::new(dir.path().to_path_buf()).unwrap();
        let spec = JobSpec {
            goal: "ship".into(),
            max_parallel: Some(3),
            retry: None,
        };
        let job = config.job_for(&spec);
        assert_eq!(job.goal(), "ship");
        assert_eq!(job.max_parallel(), 3);
        assert_eq!(job.retry_policy(), &config.toml.retry);

        let config =
            WavefrontConfig::with_cli_args(dir.path().to_path_buf(), false, Some(8), Some(1)).unwrap();
        let job = config.job_for(&spec);
        assert_eq!(job.max_parallel(), 8);
        assert_eq!(job.retry_policy().max_attempts, 1);

        if let Some(val) = saved {
            unsafe { std::env::set_var(ENV_MAX_PARALLEL, val) };
        }
        if let Some(val) = saved_attempts {
            unsafe { std::env::set_var(ENV_MAX_ATTEMPTS, val) };
        }
    }

    #[test]
    fn test_zero_timeout_disables_it() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(ENV_PHASE_TIMEOUT_SECS).ok();
        unsafe { std::env::remove_var(ENV_PHASE_TIMEOUT_SECS) };

        let dir = tempdir().unwrap();
        let mut config = WavefrontConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.phase_timeout(), Some(Duration::from_secs(600)));
        config.toml.scheduler.phase_timeout_secs = 0;
        assert_eq!(config.scheduler_config().phase_timeout, None);

        if let Some(val) = saved {
            unsafe { std::env::set_var(ENV_PHASE_TIMEOUT_SECS, val) };
        }
    }
}
