//! CLI tests for the `slds` binary: payloads, exit codes, error output.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const MODEL: &str = r#"
initial = [0.5, 0.5]
transition = [[0.95, 0.05], [0.05, 0.95]]

[[regimes]]
a = [[0.95]]
q = [[0.01]]
c = [[1.0]]
r = [[0.01]]
x0 = [0.0]
p0 = [[1.0]]

[[regimes]]
a = [[0.0]]
q = [[4.0]]
c = [[1.0]]
r = [[0.01]]
x0 = [0.0]
p0 = [[1.0]]
"#;

fn slds() -> Command {
    Command::cargo_bin("slds").expect("slds binary should exist")
}

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("write fixture");
    path
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

/// Simulate 150 steps into `obs.json` and return its path.
fn simulated_observations(dir: &TempDir, model: &Path) -> PathBuf {
    let out = dir.path().join("obs.json");
    slds()
        .args(["simulate", "--model", path_str(model), "--steps", "150", "--seed", "4"])
        .args(["--out", path_str(&out)])
        .assert()
        .success();
    out
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

// ============================================================================
// Arguments
// ============================================================================

mod arguments {
    use super::*;

    #[test]
    fn help_exits_zero() {
        slds()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("simulate"));
    }

    #[test]
    fn unknown_command_is_args_error() {
        slds()
            .arg("smooth")
            .assert()
            .code(10)
            .stderr(predicate::str::contains("error"));
    }

    #[test]
    fn zero_steps_is_args_error() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        slds()
            .args(["simulate", "--model", path_str(&model), "--steps", "0"])
            .assert()
            .code(10);
    }

    #[test]
    fn version_reports_name() {
        slds()
            .arg("version")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"name\":\"slds\""));
        slds()
            .args(["version", "--format", "summary"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("slds "));
    }
}

// ============================================================================
// simulate
// ============================================================================

mod simulate {
    use super::*;

    #[test]
    fn writes_rows_to_stdout() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        let output = slds()
            .args(["simulate", "--model", path_str(&model), "--steps", "25", "--seed", "9"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let json = stdout_json(&output);
        assert_eq!(json["seed"], 9);
        assert_eq!(json["observations"].as_array().unwrap().len(), 25);
        assert_eq!(json["regimes"].as_array().unwrap().len(), 25);
    }

    #[test]
    fn same_seed_same_output() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        let run = || {
            slds()
                .args(["simulate", "--model", path_str(&model), "--steps", "10", "--seed", "3"])
                .output()
                .unwrap()
                .stdout
        };
        assert_eq!(run(), run());
    }
}

// ============================================================================
// fit
// ============================================================================

mod fit {
    use super::*;

    #[test]
    fn fit_reports_history_and_responsibilities() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        let obs = simulated_observations(&dir, &model);
        let output = slds()
            .args(["fit", "--model", path_str(&model), "--observations", path_str(&obs)])
            .args(["--max-iter", "30", "--no-parallel"])
            .output()
            .unwrap();
        let code = output.status.code().unwrap();
        assert!(code == 0 || code == 1, "unexpected exit code {code}");

        let json = stdout_json(&output);
        let status = json["status"].as_str().unwrap();
        assert!(status == "converged" || status == "max_iter_reached");
        assert_eq!(json["responsibilities"].as_array().unwrap().len(), 150);
        assert_eq!(json["most_likely_regimes"].as_array().unwrap().len(), 150);
        assert_eq!(json["model"]["regimes"].as_array().unwrap().len(), 2);
        let history = json["ml_history"].as_array().unwrap();
        assert_eq!(history.len(), json["iterations"].as_u64().unwrap() as usize);
    }

    #[test]
    fn budget_exhaustion_exits_one() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        let obs = simulated_observations(&dir, &model);
        let output = slds()
            .args(["fit", "--model", path_str(&model), "--observations", path_str(&obs)])
            .args(["--max-iter", "1"])
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(1));
        let json = stdout_json(&output);
        assert_eq!(json["status"], "max_iter_reached");
        assert_eq!(json["exit_code"], "MAX_ITER_REACHED");
    }

    #[test]
    fn summary_format_is_one_line() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        let obs = simulated_observations(&dir, &model);
        slds()
            .args(["fit", "--model", path_str(&model), "--observations", path_str(&obs)])
            .args(["--max-iter", "2", "--format", "summary"])
            .assert()
            .code(1)
            .stdout(predicate::str::starts_with("[run-").and(predicate::str::contains("fit:")));
    }

    #[test]
    fn saved_model_passes_check() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        let obs = simulated_observations(&dir, &model);
        let fitted = dir.path().join("fitted.toml");
        slds()
            .args(["fit", "--model", path_str(&model), "--observations", path_str(&obs)])
            .args(["--max-iter", "3", "--save-model", path_str(&fitted)])
            .assert()
            .code(predicate::in_iter([0, 1]));
        slds()
            .args(["check", "--model", path_str(&fitted), "--observations", path_str(&obs)])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"ok\""));
    }

    #[test]
    fn saved_json_model_is_json() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        let obs = simulated_observations(&dir, &model);
        let fitted = dir.path().join("fitted.json");
        slds()
            .args(["fit", "--model", path_str(&model), "--observations", path_str(&obs)])
            .args(["--max-iter", "2", "--save-model", path_str(&fitted)])
            .assert()
            .code(predicate::in_iter([0, 1]));
        let text = std::fs::read_to_string(&fitted).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).expect("saved model is JSON");
        assert_eq!(json["regimes"].as_array().unwrap().len(), 2);
        slds()
            .args(["check", "--model", path_str(&fitted)])
            .assert()
            .success();
    }

    #[test]
    fn fit_config_file_is_applied() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        let obs = simulated_observations(&dir, &model);
        let config = write(&dir, "fit.toml", "max_iter = 1\nparallel = false\n");
        let output = slds()
            .args(["fit", "--model", path_str(&model), "--observations", path_str(&obs)])
            .args(["--config", path_str(&config)])
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(1));
        assert_eq!(stdout_json(&output)["iterations"], 1);
    }
}

// ============================================================================
// Errors
// ============================================================================

mod errors {
    use super::*;

    #[test]
    fn missing_model_is_io_error() {
        let dir = TempDir::new().unwrap();
        let obs = write(&dir, "obs.json", "[[0.1], [0.2]]");
        slds()
            .args(["fit", "--model", "/nonexistent/model.toml"])
            .args(["--observations", path_str(&obs)])
            .assert()
            .code(12)
            .stderr(predicate::str::contains("\"code\":60"));
    }

    #[test]
    fn malformed_model_is_config_error() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", "initial = [1.0]\ntransition = oops\n");
        let obs = write(&dir, "obs.json", "[[0.1], [0.2]]");
        slds()
            .args(["fit", "--model", path_str(&model), "--observations", path_str(&obs)])
            .assert()
            .code(11);
    }

    #[test]
    fn zero_budget_is_config_error() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        let obs = write(&dir, "obs.json", "[[0.1], [0.2]]");
        slds()
            .args(["fit", "--model", path_str(&model), "--observations", path_str(&obs)])
            .args(["--max-iter", "0"])
            .assert()
            .code(11)
            .stderr(predicate::str::contains("max_iter"));
    }

    #[test]
    fn indefinite_noise_is_numerical_instability() {
        let dir = TempDir::new().unwrap();
        let model = write(
            &dir,
            "model.toml",
            r#"
initial = [1.0]
transition = [[1.0]]

[[regimes]]
a = [[0.9]]
q = [[0.01]]
c = [[1.0]]
r = [[-1.5]]
x0 = [0.0]
p0 = [[1.0]]
"#,
        );
        let obs = write(&dir, "obs.json", "[[0.1], [0.2], [0.3]]");
        slds()
            .args(["fit", "--model", path_str(&model), "--observations", path_str(&obs)])
            .assert()
            .code(20)
            .stderr(predicate::str::contains("\"category\":\"inference\""));
    }

    #[test]
    fn check_flags_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let model = write(&dir, "model.toml", MODEL);
        let obs = write(&dir, "obs.json", "[[0.1, 0.2], [0.3, 0.4]]");
        slds()
            .args(["check", "--model", path_str(&model), "--observations", path_str(&obs)])
            .assert()
            .code(11)
            .stdout(predicate::str::contains("\"status\": \"error\""));
    }
}
