//! Smoke tests for the `beban` binary.

#![allow(deprecated)] // Command::cargo_bin
#![allow(clippy::unwrap_used)]

use std::{fs, path::PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const LOGIN: &str = r#"
name: login-stress
base_url: http://localhost:8080
stages:
  - { duration: 30s, target: 10 }
  - { duration: 1m30s, target: 10 }
  - { duration: 20s, target: 0 }
think_time: { cycle: [2s, 3s] }
thresholds:
  http_req_duration: ["p(95)<1000"]
  checks: ["rate>0.95"]
steps:
  - name: login
    method: POST
    path: /login
    form: { username: superadmin, password: admin123 }
    checks:
      - { name: "Status is 200/302", status_in: [200, 302] }
"#;

fn beban() -> Command {
    Command::cargo_bin("beban").unwrap()
}

fn scenario(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("scenario.yaml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn help_lists_subcommands() {
    beban()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn validate_accepts_a_good_file() {
    let dir = TempDir::new().unwrap();
    let path = scenario(&dir, LOGIN);

    beban()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("login-stress is valid"))
        .stdout(predicate::str::contains("up to 10 VUs"));
}

#[test]
fn validate_rejects_unparseable_files() {
    let dir = TempDir::new().unwrap();
    let path = scenario(&dir, "name: [unterminated");

    beban().arg("validate").arg(&path).assert().code(104);
}

#[test]
fn validate_rejects_missing_files() {
    beban()
        .args(["validate", "does/not/exist.yaml"])
        .assert()
        .code(104)
        .stderr(predicate::str::contains("exist.yaml"));
}

#[test]
fn validate_rejects_unknown_placeholders() {
    let dir = TempDir::new().unwrap();
    let path = scenario(&dir, &LOGIN.replace("path: /login", "path: /login/${user}"));

    beban()
        .arg("validate")
        .arg(&path)
        .assert()
        .code(104)
        .stderr(predicate::str::contains("unknown placeholder"));
}

#[test]
fn validate_rejects_bad_thresholds() {
    let dir = TempDir::new().unwrap();
    let path = scenario(&dir, &LOGIN.replace("rate>0.95", "rate>>0.95"));

    beban().arg("validate").arg(&path).assert().code(104);
}

#[test]
fn run_requires_duration_with_vus() {
    let dir = TempDir::new().unwrap();
    let path = scenario(&dir, LOGIN);

    beban()
        .arg("run")
        .arg(&path)
        .args(["--vus", "3"])
        .assert()
        .code(2);
}

#[test]
fn run_fails_setup_for_unresolvable_hosts() {
    let dir = TempDir::new().unwrap();
    let path = scenario(&dir, LOGIN);

    beban()
        .arg("run")
        .arg(&path)
        .args(["--vus", "1", "--duration", "1s"])
        .args(["--base-url", "http://beban-does-not-exist.invalid"])
        .assert()
        .code(107);
}

#[test]
fn run_rejects_bad_base_url_overrides() {
    let dir = TempDir::new().unwrap();
    let path = scenario(&dir, LOGIN);

    beban()
        .arg("run")
        .arg(&path)
        .env("BEBAN_BASE_URL", "ftp://example.com")
        .assert()
        .code(104);
}

#[test]
fn bundled_scenarios_validate() {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../scenarios");
    for name in [
        "login_stress.yaml",
        "read_item_list.yaml",
        "add_item_peak.yaml",
        "endurance.yaml",
    ] {
        beban()
            .arg("validate")
            .arg(dir.join(name))
            .assert()
            .success()
            .stdout(predicate::str::contains("is valid"));
    }
}
