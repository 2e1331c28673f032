#![allow(clippy::unwrap_used, clippy::expect_used)]

//! CLI smoke tests for the dt-management-server binary.

use std::io::Write;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn run_server(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dt-management-server"))
        .args(args)
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute dt-management-server")
}

fn write_file(dir: &TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn test_cli_help_command() {
    let output = run_server(&["--help"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("run"));
    assert!(stdout.contains("check"));
    assert!(stdout.contains("--config"));
    assert!(stdout.contains("--module"));
}

#[test]
fn test_cli_version_command() {
    let output = run_server(&["--version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("dt-management-server"));
}

#[test]
fn test_check_with_valid_config() {
    let dir = TempDir::new().unwrap();
    let config = write_file(
        &dir,
        "config.yaml",
        "dt_management:\n  hostname: twins.local\n  readiness:\n    timeout: 20s\n",
    );

    let output = run_server(&["--config", &config, "check"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration is valid"));
    assert!(stdout.contains("twins.local"));
}

#[test]
fn test_check_with_missing_config_fails() {
    let output = run_server(&["--config", "/nonexistent/dt-management.yaml", "check"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("config file does not exist"));
}

#[test]
fn test_check_with_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_file(&dir, "config.yaml", "dt_management:\n  use_proxy: [not, a, bool]\n");

    let output = run_server(&["--config", &config, "check"]);
    assert!(!output.status.success());
}

#[test]
fn test_check_validates_module_definitions() {
    let dir = TempDir::new().unwrap();
    let valid = write_file(
        &dir,
        "module.json",
        r#"{"id":"m1","deploymentType":"CONTAINERIZED","providedModel":{"environment":{}}}"#,
    );
    let invalid = write_file(&dir, "broken.json", r#"{"name": 42}"#);

    let output = run_server(&["--module", &valid, "check"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Module definitions are valid: 1"));

    let output = run_server(&["--module", &invalid, "check"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid module definition"));
}

#[test]
fn test_print_config_outputs_yaml() {
    let output = run_server(&["--print-config", "-v"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Effective configuration:"));
    assert!(stdout.contains("console_level: debug"));
    assert!(stdout.contains("modapto-module-"));
}
