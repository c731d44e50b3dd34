//! CLI test cases.
//!
//! These only exercise paths which need no model server and no poppler
//! tools: the fixtures route to native text extraction or are
//! unclassifiable, so the OCR stage runs with no documents.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Input PDFs: one with a text layer, and one text file pretending to be a PDF.
static FIXTURES: &str = "tests/fixtures/pdfs";

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("pdf-triage").unwrap();
    cmd.env("RUST_LOG", "warn");
    cmd
}

/// Count the records in a finalized stage directory.
fn records(stage_dir: &Path) -> u64 {
    let marker: serde_json::Value =
        serde_json::from_slice(&fs::read(stage_dir.join("_COMPLETED.json")).unwrap())
            .unwrap();
    marker["shards"]
        .as_array()
        .unwrap()
        .iter()
        .map(|shard| shard["records"].as_u64().unwrap())
        .sum()
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
    for schema_type in ["Document", "PipelineConfig", "CompletionMarker", "LogisticModel"] {
        cmd()
            .arg("schema")
            .arg(schema_type)
            .assert()
            .success()
            .stdout(predicate::str::contains(schema_type));
    }
}

#[test]
fn test_validate_missing_output() {
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .arg("validate")
        .arg(tmp.path().join("nope"))
        .assert()
        .failure()
        .stdout(predicate::str::contains("missing"));
}

#[test]
fn test_classify() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");
    cmd()
        .arg("classify")
        .arg(FIXTURES)
        .arg("--output-dir")
        .arg(&out)
        .arg("--logging-dir")
        .arg(tmp.path().join("logs"))
        .assert()
        .success();
    assert_eq!(records(&out.join("classified")), 2);
    assert!(!out.join("text_extraction").exists());
    assert!(tmp.path().join("logs/classification/stats.json").exists());

    cmd()
        .arg("validate")
        .arg("--deep")
        .arg(out.join("classified"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\""));
}

#[test]
fn test_run_then_resume() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");
    let run = || {
        let mut cmd = cmd();
        cmd.arg("run")
            .arg(FIXTURES)
            .arg("--output-dir")
            .arg(&out)
            .arg("--logging-dir")
            .arg(tmp.path().join("logs"))
            .arg("--driver")
            .arg("echo");
        cmd
    };
    run().assert().success();

    assert_eq!(records(&out.join("classified")), 2);
    assert_eq!(records(&out.join("text_extraction")), 1);
    assert_eq!(records(&out.join("ocr_extraction")), 0);
    assert_eq!(records(&out.join("unclassifiable")), 1);

    // A second run finds every stage finalized and leaves the output alone.
    let marker = fs::read(out.join("classified/_COMPLETED.json")).unwrap();
    run().assert().success();
    assert_eq!(
        fs::read(out.join("classified/_COMPLETED.json")).unwrap(),
        marker
    );
}

#[test]
fn test_malformed_pdf_does_not_stop_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("in");
    fs::create_dir(&input).unwrap();
    let letter = fs::read_to_string(Path::new(FIXTURES).join("letter.pdf")).unwrap();
    fs::write(input.join("letter.pdf"), &letter).unwrap();
    // Same length, so the xref table stays valid: page 4 becomes its own parent.
    let looping = letter.replacen("/Type /Page /Parent 2 0 R", "/Type /Page /Parent 4 0 R", 1);
    assert_ne!(looping, letter);
    fs::write(input.join("looping.pdf"), looping).unwrap();

    let out = tmp.path().join("out");
    cmd()
        .arg("run")
        .arg(&input)
        .arg("--output-dir")
        .arg(&out)
        .arg("--logging-dir")
        .arg(tmp.path().join("logs"))
        .arg("--driver")
        .arg("echo")
        .assert()
        .success();
    assert_eq!(records(&out.join("classified")), 2);
    assert_eq!(records(&out.join("text_extraction")), 1);
    assert_eq!(records(&out.join("unclassifiable")), 1);
}

#[test]
fn test_duplicate_ids_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = tmp.path().join("manifest.jsonl");
    let letter = fs::canonicalize(Path::new(FIXTURES).join("letter.pdf")).unwrap();
    let line = serde_json::json!({ "id": "same", "path": letter }).to_string();
    fs::write(&manifest, format!("{line}\n{line}\n")).unwrap();
    cmd()
        .arg("classify")
        .arg(&manifest)
        .arg("--output-dir")
        .arg(tmp.path().join("out"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate document id \"same\""));
    assert!(!tmp.path().join("out/classified").exists());
}

#[test]
fn test_bad_threshold_fails() {
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .arg("classify")
        .arg(FIXTURES)
        .arg("--output-dir")
        .arg(tmp.path().join("out"))
        .arg("--threshold")
        .arg("1.5")
        .assert()
        .failure()
        .stderr(predicate::str::contains("threshold"));
}
