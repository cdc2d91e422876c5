//! CLI integration tests

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::PathBuf;

fn netextract_cli() -> Command {
    cargo_bin_cmd!("netextract-cli")
}

/// Path to the library's test fixtures (relative to workspace).
fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("netextract")
        .join("tests")
        .join("fixtures")
}

fn inverter() -> PathBuf {
    fixtures_dir().join("inverter.json")
}

#[test]
fn test_cli_help() {
    let mut cmd = netextract_cli();

    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("netlist"));
}

#[test]
fn test_cli_version() {
    let mut cmd = netextract_cli();

    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_cli_extract_human() {
    let mut cmd = netextract_cli();

    cmd.arg("extract").arg(inverter());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("circuit INV"))
        .stdout(predicate::str::contains("device PMOS"))
        .stdout(predicate::str::contains("device NMOS"))
        .stdout(predicate::str::contains("end;"));
}

#[test]
fn test_cli_extract_json() {
    let mut cmd = netextract_cli();

    cmd.arg("extract")
        .arg(inverter())
        .arg("--format")
        .arg("json")
        .arg("--purge")
        .arg("--threads")
        .arg("4");

    let output = cmd.assert().success().get_output().stdout.clone();
    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["summary"]["devices"], 2);
    assert_eq!(json["summary"]["nets"], 4);
    assert!(json["recognition_errors"].as_array().unwrap().is_empty());
}

#[test]
fn test_cli_net_at_location() {
    let mut cmd = netextract_cli();

    cmd.arg("probe")
        .arg(inverter())
        .arg("--layer")
        .arg("metal1")
        .arg("-x")
        .arg("1.4")
        .arg("-y")
        .arg("1.75");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("INV:OUT"));
}

#[test]
fn test_cli_net_at_negative_coordinates() {
    let mut cmd = netextract_cli();

    cmd.arg("probe")
        .arg(inverter())
        .arg("--layer")
        .arg("metal1")
        .arg("-x")
        .arg("-0.4")
        .arg("-y")
        .arg("1.0");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("INV:VSS"));
}

#[test]
fn test_cli_no_net_at_empty_location() {
    let mut cmd = netextract_cli();

    cmd.arg("probe")
        .arg(inverter())
        .arg("--layer")
        .arg("metal1")
        .arg("-x")
        .arg("50")
        .arg("-y")
        .arg("50");

    cmd.assert()
        .failure()
        .stdout(predicate::str::contains("no net"));
}

#[test]
fn test_cli_net_lookup_unknown_layer() {
    let mut cmd = netextract_cli();

    cmd.arg("probe")
        .arg(inverter())
        .arg("--layer")
        .arg("metal9")
        .arg("-x")
        .arg("0")
        .arg("-y")
        .arg("0");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("metal9"));
}

/// One good NMOS and one gate with a single source/drain side
fn bad_gate_deck() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "layers": [{{"name": "active", "layer": 1}}, {{"name": "poly", "layer": 2}}],
            "cells": [{{"name": "TOP", "shapes": [
                {{"layer": "active", "box": [0, 0, 1000, 1000]}},
                {{"layer": "poly", "box": [400, -200, 600, 1200]}},
                {{"layer": "active", "box": [2000, 0, 3000, 1000]}},
                {{"layer": "poly", "box": [2400, -200, 3200, 1200]}}
            ]}}],
            "top": "TOP",
            "extraction": {{
                "inputs": [
                    {{"name": "active", "source": "active", "kind": "polygons"}},
                    {{"name": "poly", "source": "poly", "kind": "polygons"}}
                ],
                "derived": [
                    {{"name": "gate", "op": "and", "a": "active", "b": "poly"}},
                    {{"name": "sd", "op": "not", "a": "active", "b": "poly"}}
                ],
                "devices": [
                    {{"extractor": "mos3", "class": "NMOS", "layers": {{"SD": "sd", "G": "gate", "P": "poly"}}}}
                ],
                "connect": [["poly"], ["sd"]]
            }}
        }}"#
    )
    .unwrap();
    file
}

#[test]
fn test_cli_strict_fails_on_recognition_errors() {
    let deck = bad_gate_deck();

    let mut cmd = netextract_cli();
    cmd.arg("extract").arg(deck.path()).arg("--strict");

    cmd.assert()
        .code(2)
        .stdout(predicate::str::contains("device NMOS"))
        .stderr(predicate::str::contains("warning"));
}

#[test]
fn test_cli_recognition_errors_are_warnings_by_default() {
    let deck = bad_gate_deck();

    let mut cmd = netextract_cli();
    cmd.arg("extract").arg(deck.path()).arg("--format").arg("json");

    let output = cmd.assert().success().get_output().stdout.clone();
    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["summary"]["devices"], 1);
    assert_eq!(json["recognition_errors"].as_array().unwrap().len(), 1);
}

#[test]
fn test_cli_layers() {
    let mut cmd = netextract_cli();

    cmd.arg("layers").arg(inverter());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("pgate"))
        .stdout(predicate::str::contains("pactive and poly"))
        .stdout(predicate::str::contains("PMOS"));
}

#[test]
fn test_cli_missing_file() {
    let mut cmd = netextract_cli();

    cmd.arg("extract").arg("/nonexistent/deck.json");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("cannot load deck"));
}

#[test]
fn test_cli_cyclic_hierarchy() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "layers": [{{"name": "m1", "layer": 1}}],
            "cells": [
                {{"name": "A", "shapes": [{{"layer": "m1", "box": [0, 0, 10, 10]}}],
                  "instances": [{{"cell": "B"}}]}},
                {{"name": "B", "instances": [{{"cell": "A", "at": [100, 0]}}]}}
            ],
            "top": "A",
            "extraction": {{
                "inputs": [{{"name": "m1", "source": "m1"}}],
                "connect": [["m1"]]
            }}
        }}"#
    )
    .unwrap();

    let mut cmd = netextract_cli();
    cmd.arg("extract").arg(file.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
}
