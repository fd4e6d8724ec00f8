//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::tempdir,
};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("rigctl")
}

/// Command isolated from the user's config, remembered ports and RIGCTL_* variables.
fn isolated_cmd(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cli_cmd();
    cmd.current_dir(dir)
        .env("HOME", dir)
        .env("XDG_CONFIG_HOME", dir.join("config"))
        .env("APPDATA", dir.join("appdata"))
        .env_remove("RIGCTL_MASTER")
        .env_remove("RIGCTL_TARGET")
        .env_remove("RIGCTL_BAUD")
        .env_remove("RIGCTL_FIRMWARE")
        .env_remove("RIGCTL_NON_INTERACTIVE");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("rigctl"))
        .stdout(predicate::str::contains("flash-run"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn short_help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("-h")
        .assert()
        .success()
        .stdout(predicate::str::contains("rigctl"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("rigctl"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn short_version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("-V")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")))
        .stderr(predicate::str::is_empty());
}

#[test]
fn completions_command_writes_to_stdout() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rigctl"))
        .stdout(predicate::str::contains("flash-run"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let dir = tempdir().expect("tempdir should be created");
    let output = isolated_cmd(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("stdout should be a single JSON document");
    assert!(parsed.is_array());
}

#[test]
fn invalid_local_config_is_a_warning() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("rigctl.toml"), "invalid toml [[[").expect("write invalid config");

    let output = isolated_cmd(dir.path())
        .arg("list-ports")
        .output()
        .expect("command should execute");
    assert!(output.status.success(), "command should succeed despite config warning");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn unknown_command_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.arg("reboot")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn invalid_baud_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args(["--baud", "fast", "test"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("baud"));
}

#[test]
fn test_without_ports_non_interactive_exits_two() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["--non-interactive", "test"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("No master port selected"));
}

#[test]
fn non_interactive_environment_variable_works() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .env("RIGCTL_NON_INTERACTIVE", "true")
        .arg("test")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--master"));
}

#[test]
fn config_file_supplies_master_but_not_target() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("rig.toml");
    fs::write(&config, "[ports]\nmaster = \"/dev/rigctl-test-master\"\n").expect("write config");

    isolated_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["--non-interactive", "test"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("No target port selected"));
}

#[test]
fn flash_without_firmware_exits_two() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["--non-interactive", "flash"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("firmware"));
}

#[test]
fn flash_run_with_missing_firmware_file_exits_two() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["--non-interactive", "--firmware", "missing.hex", "flash-run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing.hex"));
}

#[test]
fn console_reports_status_and_quits() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args([
            "--non-interactive",
            "-m",
            "/dev/rigctl-test-master",
            "-t",
            "/dev/rigctl-test-target",
            "console",
        ])
        .write_stdin("status\nbogus\nquit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("master: /dev/rigctl-test-master"))
        .stdout(predicate::str::contains("session: Idle"))
        .stderr(predicate::str::contains("Unknown command: bogus"));
}
