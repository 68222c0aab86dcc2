//! CLI integration tests.
//!
//! Uses `assert_cmd` to spawn the `hatch` binary and verify exit codes,
//! stdout content, and stderr content. Every test runs in its own temporary
//! directory with a `hatch.toml` that keeps state inside it.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const CONFIG: &str = r#"
storage_path = "state.json"

[[applications]]
application = "fenix"
collection = "nimbus-mobile-experiments"

[[applications]]
application = "desktop"
collection = "nimbus-desktop-experiments"
"#;

/// Temporary working directory holding `hatch.toml`.
fn workspace() -> TempDir {
    let dir = TempDir::new().expect("temp dir");
    fs::write(dir.path().join("hatch.toml"), CONFIG).expect("write config");
    dir
}

/// Helper: create a Command for the `hatch` binary inside `dir`.
fn hatch(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("hatch");
    cmd.current_dir(dir.path());
    cmd.env_remove("HATCH_REMOTE_URL");
    cmd.env_remove("HATCH_REMOTE_AUTH");
    cmd.env_remove("HATCH_REMOTE_TOKEN");
    cmd.env_remove("HATCH_PORT");
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn create(dir: &TempDir, slug: &str) {
    hatch(dir)
        .args(["create", slug, "--application", "fenix", "--population", "25"])
        .assert()
        .success();
}

fn json_stdout(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().expect("run hatch");
    assert!(
        output.status.success(),
        "hatch failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    let dir = workspace();
    hatch(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Hatch experiment publisher"));
}

#[test]
fn version_exits_0() {
    let dir = workspace();
    hatch(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hatch"));
}

// ──────────────────────────────────────────────
// 2. Create, show, history
// ──────────────────────────────────────────────

#[test]
fn create_then_show_across_invocations() {
    let dir = workspace();
    hatch(&dir)
        .args(["create", "exp-a", "--application", "fenix", "--population", "25"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created exp-a"))
        .stdout(predicate::str::contains("status:          DRAFT"));

    assert!(dir.path().join("state.json").exists());

    hatch(&dir)
        .args(["show", "exp-a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("publish_status:  IDLE"))
        .stdout(predicate::str::contains("population:      25%"));
}

#[test]
fn create_json_output() {
    let dir = workspace();
    let record = json_stdout(hatch(&dir).args([
        "--output",
        "json",
        "create",
        "exp-a",
        "--application",
        "focus-android",
        "--population",
        "10",
        "--isolation-group",
        "onboarding",
    ]));
    assert_eq!(record["slug"], "exp-a");
    assert_eq!(record["application"], "focus_android");
    assert_eq!(record["status"], "DRAFT");
    assert_eq!(record["publish_status"], "IDLE");
    assert_eq!(record["isolation_group"], "onboarding");
    assert_eq!(record["version"], 0);
}

#[test]
fn create_with_payload_file() {
    let dir = workspace();
    fs::write(
        dir.path().join("payload.json"),
        r#"{"name": "Onboarding test", "feature_ids": ["onboarding"], "proposedDuration": 28}"#,
    )
    .unwrap();
    hatch(&dir)
        .args([
            "create",
            "exp-a",
            "--application",
            "fenix",
            "--population",
            "5",
            "--payload",
            "payload.json",
        ])
        .assert()
        .success();

    let record = json_stdout(hatch(&dir).args(["show", "exp-a", "--output", "json"]));
    assert_eq!(record["payload"]["name"], "Onboarding test");
    assert_eq!(record["payload"]["proposedDuration"], 28);
}

#[test]
fn duplicate_create_fails() {
    let dir = workspace();
    create(&dir, "exp-a");
    hatch(&dir)
        .args(["create", "exp-a", "--application", "fenix", "--population", "25"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn out_of_range_population_fails() {
    let dir = workspace();
    hatch(&dir)
        .args(["create", "exp-a", "--application", "fenix", "--population", "150"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid request"));
    assert!(!dir.path().join("state.json").exists() || {
        let state = fs::read_to_string(dir.path().join("state.json")).unwrap();
        !state.contains("exp-a")
    });
}

#[test]
fn unknown_application_rejected_by_parser() {
    let dir = workspace();
    hatch(&dir)
        .args(["create", "exp-a", "--application", "android", "--population", "25"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown application"));
}

#[test]
fn show_unknown_slug_fails() {
    let dir = workspace();
    hatch(&dir)
        .args(["show", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("experiment not found: missing"));
}

#[test]
fn json_errors_on_stderr() {
    let dir = workspace();
    let output = hatch(&dir)
        .args(["--output", "json", "history", "missing"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let err: serde_json::Value = serde_json::from_slice(&output.stderr).expect("stderr is JSON");
    assert!(err["error"].as_str().unwrap().contains("missing"));
}

#[test]
fn quiet_suppresses_errors() {
    let dir = workspace();
    hatch(&dir)
        .args(["--quiet", "show", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::is_empty());
}

// ──────────────────────────────────────────────
// 3. Transitions
// ──────────────────────────────────────────────

#[test]
fn request_review_queues_and_records_history() {
    let dir = workspace();
    create(&dir, "exp-a");
    hatch(&dir)
        .args([
            "transition",
            "exp-a",
            "--request-review",
            "live",
            "--actor",
            "alice",
            "--message",
            "ready for launch",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("status_next:     LIVE"))
        .stdout(predicate::str::contains("publish_status:  REVIEW"));

    let history = json_stdout(hatch(&dir).args(["history", "exp-a", "--output", "json"]));
    let entries = history.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["old_status"], serde_json::Value::Null);
    assert_eq!(entries[1]["actor"], "alice");
    assert_eq!(entries[1]["message"], "ready for launch");
    assert_eq!(entries[1]["new_publish_status"], "REVIEW");

    hatch(&dir)
        .args(["history", "exp-a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(created) -> DRAFT/IDLE"))
        .stdout(predicate::str::contains("DRAFT/IDLE -> DRAFT/REVIEW  by alice: ready for launch"));
}

#[test]
fn preview_and_back() {
    let dir = workspace();
    create(&dir, "exp-a");
    hatch(&dir)
        .args(["transition", "exp-a", "--status", "PREVIEW"])
        .assert()
        .success()
        .stdout(predicate::str::contains("status:          PREVIEW"));
    hatch(&dir)
        .args(["transition", "exp-a", "--status", "DRAFT"])
        .assert()
        .success();
}

#[test]
fn invalid_transition_fails_without_change() {
    let dir = workspace();
    create(&dir, "exp-a");
    hatch(&dir)
        .args(["transition", "exp-a", "--status", "LIVE"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid transition"));

    let record = json_stdout(hatch(&dir).args(["show", "exp-a", "--output", "json"]));
    assert_eq!(record["status"], "DRAFT");
    assert_eq!(record["version"], 0);
}

#[test]
fn request_review_conflicts_with_explicit_fields() {
    let dir = workspace();
    create(&dir, "exp-a");
    hatch(&dir)
        .args([
            "transition",
            "exp-a",
            "--request-review",
            "LIVE",
            "--publish-status",
            "IDLE",
        ])
        .assert()
        .failure();
}

// ──────────────────────────────────────────────
// 4. Tick
// ──────────────────────────────────────────────

#[test]
fn tick_pushes_queued_experiment() {
    let dir = workspace();
    create(&dir, "exp-a");
    hatch(&dir)
        .args(["transition", "exp-a", "--request-review", "LIVE"])
        .assert()
        .success();

    hatch(&dir)
        .args(["tick", "--application", "fenix"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "fenix: pushed exp-a towards LIVE (APPROVED), 0 queued",
        ));

    let record = json_stdout(hatch(&dir).args(["show", "exp-a", "--output", "json"]));
    assert_eq!(record["publish_status"], "APPROVED");
    assert_eq!(record["status"], "DRAFT");
}

#[test]
fn tick_all_applications_json() {
    let dir = workspace();
    let reports = json_stdout(hatch(&dir).args(["tick", "--output", "json"]));
    let reports = reports.as_array().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0]["application"], "desktop");
    assert_eq!(reports[1]["application"], "fenix");
    assert!(reports[0]["publish"]["Ok"]["pushed"].is_null());
}

#[test]
fn tick_unconfigured_application_fails() {
    let dir = workspace();
    hatch(&dir)
        .args(["tick", "--application", "ios"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not configured"));
}

#[test]
fn tick_reports_unreachable_remote() {
    let dir = workspace();
    create(&dir, "exp-a");
    hatch(&dir)
        .args(["transition", "exp-a", "--request-review", "LIVE"])
        .assert()
        .success();

    hatch(&dir)
        .env("HATCH_REMOTE_URL", "http://127.0.0.1:9")
        .args(["tick", "--application", "fenix"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("publish failed"))
        .stderr(predicate::str::contains("tick(s) failed"));

    // The candidate is untouched and will be retried.
    let record = json_stdout(hatch(&dir).args(["show", "exp-a", "--output", "json"]));
    assert_eq!(record["publish_status"], "REVIEW");
}

// ──────────────────────────────────────────────
// 5. Configuration
// ──────────────────────────────────────────────

#[test]
fn bad_config_exits_2() {
    let dir = workspace();
    fs::write(dir.path().join("hatch.toml"), "[server]\nhost = \"x\"\n").unwrap();
    hatch(&dir)
        .args(["show", "exp-a"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("could not parse"));
}

#[test]
fn missing_explicit_config_exits_2() {
    let dir = workspace();
    hatch(&dir)
        .args(["--config", "nope.toml", "show", "exp-a"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("could not read"));
}

#[test]
fn malformed_remote_credential_exits_2() {
    let dir = workspace();
    hatch(&dir)
        .env("HATCH_REMOTE_AUTH", "no-colon")
        .args(["show", "exp-a"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("user:password"));
}
