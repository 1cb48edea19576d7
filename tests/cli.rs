//! CLI test cases.
//!
//! Nothing here talks to a real model. Scans use `--driver offline`, which
//! replies with canned text.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use predicates::prelude::*;
use serde_json::Value;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("shipscan").unwrap();
    cmd.env_remove("GEMINI_API_KEY")
        .env_remove("SHIPSCAN_STORE")
        .env("RUST_LOG", "warn");
    cmd
}

/// Write a small PNG "photo" to `path`.
fn write_label_png(path: &Path) {
    let image = RgbImage::from_fn(64, 48, |x, y| {
        let v = (x * 7 + y * 13) as u8;
        Rgb([v, 255 - v, v / 2])
    });
    DynamicImage::ImageRgb8(image)
        .save_with_format(path, ImageFormat::Png)
        .unwrap();
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema() {
    for schema_type in ["ScanInput", "ScanOutput", "ExtractedFields", "ShippingRecord"] {
        cmd()
            .arg("schema")
            .arg(schema_type)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"properties\""));
    }
}

#[test]
fn test_parse_text() {
    let output = cmd()
        .arg("parse-text")
        .arg("tests/fixtures/label.txt")
        .output()
        .unwrap();
    assert!(output.status.success());
    let fields = stdout_json(&output);
    assert_eq!(fields["barcodeNumber"], "123456789012");
    assert_eq!(fields["internalNumber"], "GSH12345");
    assert_eq!(fields["senderName"], "SHEIN-KW");
    assert_eq!(fields["shippingDate"], "2024-08-25");
    assert_eq!(fields["contents"], "Women's Top*2,Women's Skirt*1");
    assert_eq!(fields["recipientName"], "UNKNOWN");
    assert_eq!(fields["confidenceScores"]["barcodeNumber"], 0.95);
}

#[test]
fn test_aggregate() {
    let output = cmd()
        .arg("aggregate")
        .arg("tests/fixtures/contents.jsonl")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(
        stdout_json(&output),
        serde_json::json!([
            { "name": "women's top", "qty": 5, "price": "0.01" },
            { "name": "hat", "qty": 1, "price": "0.01" },
        ])
    );
}

#[test]
fn test_scan_offline_then_list_records() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("label.png");
    write_label_png(&image_path);
    let input_path = dir.path().join("input.jsonl");
    fs::write(
        &input_path,
        format!(
            "{}\n{}\n",
            serde_json::json!({ "id": 1, "path": image_path }),
            serde_json::json!({ "id": 2, "path": dir.path().join("missing.png") }),
        ),
    )
    .unwrap();
    let store_path = dir.path().join("records.json");
    let summary_path = dir.path().join("summary.json");

    let output = cmd()
        .arg("scan")
        .arg(&input_path)
        .arg("--driver")
        .arg("offline")
        .arg("--retries")
        .arg("0")
        .arg("--store")
        .arg(&store_path)
        .arg("--summary")
        .arg(&summary_path)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let lines = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["status"], "ok");
    assert_eq!(lines[0]["fileName"], "label.png");
    assert_eq!(lines[0]["source"], "offline");
    assert_eq!(lines[0]["overallConfidence"], 0.85);
    assert_eq!(lines[0]["fields"]["barcodeNumber"], "UNKNOWN");
    assert!(lines[0]["recordId"].is_string());
    assert_eq!(lines[1]["status"], "failed");

    let summary = serde_json::from_str::<Value>(&fs::read_to_string(&summary_path).unwrap())
        .unwrap();
    assert_eq!(summary["processedImages"], 1);
    assert_eq!(summary["failedImages"], 1);
    assert!(dir.path().join("uploads").is_dir());

    let output = cmd()
        .arg("records")
        .arg("--store")
        .arg(&store_path)
        .arg("list")
        .output()
        .unwrap();
    assert!(output.status.success());
    let page = stdout_json(&output);
    assert_eq!(page["pagination"]["totalItems"], 1);
    assert_eq!(page["items"][0]["contents"][0]["name"], "Unknown Item");
    assert_eq!(page["items"][0]["id"], lines[0]["recordId"]);
}

#[test]
fn test_scan_fails_when_nothing_works() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("input.csv");
    fs::write(&input_path, "id,path\n1,/does/not/exist.png\n").unwrap();

    cmd()
        .arg("scan")
        .arg(&input_path)
        .arg("--driver")
        .arg("offline")
        .arg("--store")
        .arg(dir.path().join("records.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("could be processed"));
}

#[test]
fn test_scan_requires_api_key() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(dir.path())
        .arg("scan")
        .arg("tests/fixtures/contents.jsonl")
        .assert()
        .failure()
        .stderr(predicate::str::contains("GEMINI_API_KEY"));
}
