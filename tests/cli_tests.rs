//! CLI tests for the wavefront binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn wavefront(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("wavefront");
    cmd.current_dir(dir)
        .env_remove("WAVEFRONT_MAX_PARALLEL")
        .env_remove("WAVEFRONT_MAX_ATTEMPTS")
        .env_remove("WAVEFRONT_PHASE_TIMEOUT_SECS")
        .env_remove("WAVEFRONT_LOG")
        .env_remove("RUST_LOG");
    cmd
}

fn init_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    wavefront(dir.path()).arg("init").assert().success();
    dir
}

fn write_plan(dir: &Path, plan: &str) {
    fs::write(dir.join(".wavefront/plan.json"), plan).unwrap();
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        wavefront(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("verified, parallel waves"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        wavefront(dir.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("wavefront"));
    }

    #[test]
    fn test_init_creates_config_and_plan() {
        let dir = TempDir::new().unwrap();
        wavefront(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized wavefront project"));

        assert!(dir.path().join(".wavefront/wavefront.toml").exists());
        assert!(dir.path().join(".wavefront/plan.json").exists());

        wavefront(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_run_without_plan_fails() {
        let dir = TempDir::new().unwrap();
        wavefront(dir.path())
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No plan found"));
    }
}

mod plan_command {
    use super::*;

    #[test]
    fn test_plan_shows_waves() {
        let dir = init_project();
        wavefront(dir.path())
            .arg("plan")
            .assert()
            .success()
            .stdout(predicate::str::contains("3 phases in 2 waves"))
            .stdout(predicate::str::contains("Wave 1: [service]"));
    }

    #[test]
    fn test_plan_write_renders_roadmap() {
        let dir = init_project();
        wavefront(dir.path())
            .args(["plan", "--write"])
            .assert()
            .success();

        let roadmap = fs::read_to_string(dir.path().join(".wavefront/ROADMAP.md")).unwrap();
        assert!(roadmap.contains("# Roadmap: example"));
        assert!(roadmap.contains("## Wave 1"));
        assert!(roadmap.contains("- [ ] service: Build service"));
    }

    #[test]
    fn test_cycle_is_reported() {
        let dir = init_project();
        write_plan(
            dir.path(),
            r#"{
                "job": { "goal": "loop" },
                "phases": [
                    { "id": "a", "depends_on": ["b"] },
                    { "id": "b", "depends_on": ["a"] }
                ]
            }"#,
        );
        wavefront(dir.path())
            .arg("plan")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cycle detected"));
    }
}

mod run_command {
    use super::*;

    #[test]
    fn test_run_example_plan_succeeds() {
        let dir = init_project();
        wavefront(dir.path())
            .args(["run", "--ui", "minimal"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Job example: succeeded"));

        assert!(dir.path().join(".wavefront/state.jsonl").exists());
        let roadmap = fs::read_to_string(dir.path().join(".wavefront/ROADMAP.md")).unwrap();
        assert!(roadmap.contains("- [x] service: Build service"));

        wavefront(dir.path())
            .args(["status", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"outcome\": \"succeeded\""));
    }

    #[test]
    fn test_escalation_exits_nonzero_and_names_phase() {
        let dir = init_project();
        write_plan(
            dir.path(),
            r#"{
                "job": { "goal": "broken" },
                "phases": [
                    { "id": "ok", "command": "true" },
                    { "id": "bad", "command": "echo nope >&2; exit 3" },
                    { "id": "after", "command": "true", "depends_on": ["ok", "bad"] }
                ]
            }"#,
        );

        wavefront(dir.path())
            .args(["run", "--ui", "minimal", "--max-attempts", "2"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("bad (2 attempts)"))
            .stderr(predicate::str::contains("Retry budget exhausted"));

        wavefront(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Escalated:"))
            .stdout(predicate::str::contains("--retry-escalated"));
    }

    #[test]
    fn test_json_ui_emits_events() {
        let dir = init_project();
        wavefront(dir.path())
            .args(["run", "--ui", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"type\":\"wave_started\""))
            .stdout(predicate::str::contains("\"type\":\"job_finished\""));
    }

    #[test]
    fn test_verify_reruns_checks() {
        let dir = init_project();
        fs::write(
            dir.path().join(".wavefront/wavefront.toml"),
            "[[checks]]\nname = \"smoke\"\ncommand = \"true\"\n",
        )
        .unwrap();
        wavefront(dir.path())
            .args(["run", "--ui", "minimal"])
            .assert()
            .success();

        wavefront(dir.path())
            .args(["verify", "0"])
            .assert()
            .success()
            .stdout(predicate::str::contains("PASS"))
            .stdout(predicate::str::contains("Wave 0 verified."));
    }
}

mod state_commands {
    use super::*;

    #[test]
    fn test_status_before_any_run() {
        let dir = init_project();
        wavefront(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("not started"));
    }

    #[test]
    fn test_reset_force_removes_ledger() {
        let dir = init_project();
        wavefront(dir.path())
            .args(["run", "--ui", "minimal"])
            .assert()
            .success();
        assert!(dir.path().join(".wavefront/state.jsonl").exists());

        wavefront(dir.path())
            .args(["reset", "--force"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Reset complete"));
        assert!(!dir.path().join(".wavefront/state.jsonl").exists());
        assert!(!dir.path().join(".wavefront/contexts").exists());
    }

    #[test]
    fn test_config_validate_and_show() {
        let dir = init_project();
        wavefront(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));

        wavefront(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_attempts = 3"));
    }
}
