//! Integration tests for the `fcp-cli` binary.
//!
//! These tests exercise the CLI binary via `assert_cmd`. Commands that need
//! hardware are only checked for argument handling and `--help`.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn cli() -> assert_cmd::Command {
    cargo_bin_cmd!("fcp-cli")
}

#[test]
fn cli_help_succeeds() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("fcp-cli"));
}

#[test]
fn cli_version_prints_version() {
    cli()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn version_subcommand_reports_protocol() {
    cli()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("2.0.0"));
}

#[test]
fn version_json_has_packed_value() {
    let output = cli()
        .args(["--json", "version"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["protocol_packed"], 0x0002_0000);
    assert_eq!(json["protocol"], "2.0.0");
}

#[test]
fn cli_config_json_produces_valid_json() {
    let output = cli()
        .args(["--json", "config"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value =
        serde_json::from_slice(&output).expect("config --json should produce valid JSON");
    assert!(
        json["settings"].is_object(),
        "JSON output should contain 'settings' object"
    );
    assert!(
        json["config_file"].is_string() || json["config_file"].is_null(),
        "config_file should be string or null"
    );
}

#[test]
fn config_reads_custom_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "device_serial = \"ABC123\"\n\n[meter]\nslots = 4\nmap = [0, 3, -1]\n",
    )
    .unwrap();

    let output = cli()
        .args(["--json", "--config"])
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["config_file_exists"], true);
    assert_eq!(json["settings"]["device_serial"], "ABC123");
    assert_eq!(json["settings"]["meter"]["map"][1], 3);
    assert!(json["problems"].as_array().unwrap().is_empty());
}

#[test]
fn config_reports_problems() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "step0_size = 300\n").unwrap();

    cli()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Problems:"))
        .stdout(predicate::str::contains("step0_size 300"));
}

#[test]
fn config_write_creates_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    cli()
        .arg("--config")
        .arg(&path)
        .args(["config", "--write"])
        .assert()
        .success();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.starts_with("# fcp configuration"));
    assert!(contents.contains("step0_size = 24"));
}

// ── --verbose flag ──

#[test]
fn cli_verbose_flag_accepted() {
    cli().args(["-v", "config"]).assert().success();
}

#[test]
fn cli_verbose_long_flag_accepted() {
    cli().args(["--verbose", "config"]).assert().success();
}

// ── Subcommand integration tests ──
// Device-requiring commands tested via --help or argument errors.

#[test]
fn cli_devices_succeeds() {
    cli().arg("devices").assert().success();
}

#[test]
fn cli_devices_json_is_valid() {
    let output = cli()
        .args(["--json", "devices"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert!(json["devices"].is_array());
}

#[test]
fn cli_init_help_succeeds() {
    cli()
        .args(["init", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--handshake"));
}

#[test]
fn cli_cmd_help_succeeds() {
    cli()
        .args(["cmd", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--resp-size"));
}

#[test]
fn cli_cmd_rejects_bad_opcode() {
    cli()
        .args(["cmd", "0xZZ"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid number"));
}

#[test]
fn cli_cmd_rejects_odd_hex_data() {
    cli()
        .args(["cmd", "0x1001", "--data", "123"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("odd number of hex digits"));
}

#[test]
fn cli_meter_without_map_fails_before_opening_device() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.toml");

    cli()
        .arg("--config")
        .arg(&path)
        .arg("meter")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no meter map"));
}

#[test]
fn cli_meter_help_succeeds() {
    cli()
        .args(["meter", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--watch"));
}

#[test]
fn cli_events_help_succeeds() {
    cli()
        .args(["events", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--count"));
}
