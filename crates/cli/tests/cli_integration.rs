//! CLI integration tests for the `carbonmap` binary.
//!
//! All tests set `current_dir` to the workspace root so that relative
//! paths into `fixtures/` resolve.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const RULES: &str = "fixtures/rules/manufacturing_to_ghg.yaml";
const SEED: &str = "fixtures/source/sample1_small_factory.json";
const UNKNOWN_ENERGY: &str = "fixtures/source/unknown_energy_type.json";
const SCHEMA: &str = "fixtures/schema/ghg_report.schema.json";

fn workspace_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    // crates/cli -> workspace root is two levels up
    manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("workspace root")
        .to_path_buf()
}

fn carbonmap() -> Command {
    let mut cmd = cargo_bin_cmd!("carbonmap");
    cmd.current_dir(workspace_root());
    cmd
}

// ──────────────────────────────────────────────
// Help and version
// ──────────────────────────────────────────────

#[test]
fn help_lists_subcommands() {
    carbonmap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("transform"))
        .stdout(predicate::str::contains("validate"));
}

// ──────────────────────────────────────────────
// transform
// ──────────────────────────────────────────────

#[test]
fn transform_seed_fixture_to_stdout() {
    let assert = carbonmap()
        .args(["transform", RULES, SEED, "--report-date", "2024-02-15"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty());

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(doc["@type"], "ghg:EmissionReport");
    assert_eq!(doc["total_emissions"], serde_json::json!(12175.5));
    assert_eq!(doc["emission_count"], serde_json::json!(3));
    assert_eq!(doc["report_date"], "2024-02-15");
}

#[test]
fn transform_writes_out_file() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("report.json");

    carbonmap()
        .args(["transform", RULES, SEED, "--report-date", "2024-02-15", "--out"])
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(doc["total_scope2"], serde_json::json!(10450.0));
}

#[test]
fn transform_reports_diagnostics_on_stderr() {
    carbonmap()
        .args(["transform", RULES, UNKNOWN_ENERGY, "--report-date", "2024-02-15"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"total_emissions\": 50.0"))
        .stderr(predicate::str::contains("calculation_error"))
        .stderr(predicate::str::contains("hydrogen"));
}

#[test]
fn transform_strict_exits_2_on_diagnostics() {
    carbonmap()
        .args(["transform", RULES, UNKNOWN_ENERGY, "--strict"])
        .assert()
        .code(2);

    carbonmap()
        .args(["transform", RULES, SEED, "--strict"])
        .assert()
        .success();
}

#[test]
fn transform_json_diagnostics() {
    let assert = carbonmap()
        .args(["--output", "json", "transform", RULES, UNKNOWN_ENERGY])
        .assert()
        .success();

    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    let line = stderr
        .lines()
        .find(|l| l.starts_with("{\"diagnostics\""))
        .expect("diagnostics line");
    let value: serde_json::Value = serde_json::from_str(line).unwrap();
    let diagnostics = value["diagnostics"].as_array().unwrap();
    let error = diagnostics
        .iter()
        .find(|d| d["kind"] == "calculation_error")
        .expect("calculation error");
    assert_eq!(error["severity"], "error");
    assert!(error["location"].as_str().unwrap().contains("process_energy_consumption"));
}

#[test]
fn transform_rejects_bad_report_date() {
    carbonmap()
        .args(["transform", RULES, SEED, "--report-date", "2024-13-01"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid --report-date"));
}

#[test]
fn transform_missing_source_exits_1() {
    carbonmap()
        .args(["transform", RULES, "fixtures/source/does_not_exist.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error reading file"));
}

// ──────────────────────────────────────────────
// check
// ──────────────────────────────────────────────

#[test]
fn check_summarizes_rule_document() {
    carbonmap()
        .args(["check", RULES])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Manufacturing to GHG Emission Report Transformation",
        ))
        .stdout(predicate::str::contains("calculation rules:    2"));

    carbonmap()
        .args(["--output", "json", "check", RULES])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"transformation_steps\": 3"));
}

#[test]
fn check_rejects_unknown_calculation() {
    let tmp = TempDir::new().unwrap();
    let rules = tmp.path().join("broken.yaml");
    fs::write(
        &rules,
        "transformation_steps:\n  - name: s\n    mapping:\n      - target: x\n        calculation: nope\n",
    )
    .unwrap();

    carbonmap()
        .arg("check")
        .arg(&rules)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid rule document"))
        .stderr(predicate::str::contains("nope"));

    carbonmap()
        .arg("--quiet")
        .arg("check")
        .arg(&rules)
        .assert()
        .code(1)
        .stderr(predicate::str::is_empty());
}

#[test]
fn check_accepts_json_rule_documents() {
    let tmp = TempDir::new().unwrap();
    let rules = tmp.path().join("rules.json");
    fs::write(
        &rules,
        r#"{ "metadata": { "name": "tiny" }, "transformation_steps": [] }"#,
    )
    .unwrap();

    carbonmap()
        .arg("check")
        .arg(&rules)
        .assert()
        .success()
        .stdout(predicate::str::contains("valid: tiny"));
}

// ──────────────────────────────────────────────
// validate
// ──────────────────────────────────────────────

#[test]
fn validate_transformed_seed_against_schema() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("report.json");

    carbonmap()
        .args(["transform", RULES, SEED, "--out"])
        .arg(&out)
        .assert()
        .success();

    carbonmap()
        .arg("validate")
        .arg(&out)
        .args(["--schema", SCHEMA])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));

    carbonmap()
        .args(["--output", "json", "validate"])
        .arg(&out)
        .args(["--schema", SCHEMA])
        .assert()
        .success()
        .stdout(predicate::str::contains("{\"valid\": true}"));
}

#[test]
fn validate_rejects_null_emission_amount() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("report.json");

    carbonmap()
        .args(["transform", RULES, UNKNOWN_ENERGY, "--out"])
        .arg(&out)
        .assert()
        .success();

    carbonmap()
        .arg("validate")
        .arg(&out)
        .args(["--schema", SCHEMA])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid"))
        .stderr(predicate::str::contains("/emissions/0/co2_amount"));
}

#[test]
fn validate_empty_object_is_invalid() {
    let tmp = TempDir::new().unwrap();
    let doc = tmp.path().join("empty.json");
    fs::write(&doc, "{}").unwrap();

    carbonmap()
        .arg("validate")
        .arg(&doc)
        .args(["--schema", SCHEMA])
        .assert()
        .failure()
        .stderr(predicate::str::contains("  - "));
}
