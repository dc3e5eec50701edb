// Command-line interface: dump, merge and check

#![allow(deprecated)] // Command::cargo_bin is deprecated but still functional

use assert_cmd::Command;
use predicates::prelude::*;
use scrutinize::event::{CollectionEvent, Meta, TestEvent};
use scrutinize::output::{read_events, OutputLog};
use scrutinize::timer::Duration;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn write_log(path: &Path, producer: &str, tests: &[&str]) {
    let log = Arc::new(OutputLog::new(path));
    let guard = log.open_for_write().unwrap();
    log.add(CollectionEvent {
        meta: Meta::new(producer),
        runtime: Duration::from_nanos(1_500),
    });
    for name in tests {
        log.add(TestEvent {
            meta: Meta::new(producer),
            name: name.to_string(),
            test_id: format!("tests/cli.rs::{}", name),
            requires: vec![],
            runtime: Duration::from_nanos(2_000),
        });
    }
    guard.close().unwrap();
}

// ============================================================================
// dump
// ============================================================================

#[test]
fn test_dump_prints_one_line_per_event() {
    let tmp_dir = TempDir::new().unwrap();
    let log = tmp_dir.path().join("out.jsonl.gz");
    write_log(&log, "master", &["test_a", "test_b"]);

    let output = Command::cargo_bin("scrutinize")
        .unwrap()
        .arg("dump")
        .arg(&log)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value["type"].is_string());
        assert_eq!(value["meta"]["worker"], "master");
    }
}

#[test]
fn test_dump_filters_by_type() {
    let tmp_dir = TempDir::new().unwrap();
    let log = tmp_dir.path().join("out.jsonl.gz");
    write_log(&log, "gw0", &["test_a"]);

    Command::cargo_bin("scrutinize")
        .unwrap()
        .args(["dump", "--type", "test"])
        .arg(&log)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"type\":\"test\""))
        .stdout(predicate::str::contains("\"type\":\"collection\"").not());
}

#[test]
fn test_dump_rejects_unknown_type() {
    let tmp_dir = TempDir::new().unwrap();
    let log = tmp_dir.path().join("out.jsonl.gz");
    write_log(&log, "master", &[]);

    Command::cargo_bin("scrutinize")
        .unwrap()
        .args(["dump", "--type", "syscall"])
        .arg(&log)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid value for --type"));
}

#[test]
fn test_dump_reports_truncation() {
    let tmp_dir = TempDir::new().unwrap();
    let log = tmp_dir.path().join("out.jsonl.gz");
    write_log(&log, "master", &["test_a"]);
    let bytes = fs::read(&log).unwrap();
    fs::write(&log, &bytes[..bytes.len() - 8]).unwrap();

    Command::cargo_bin("scrutinize")
        .unwrap()
        .arg("dump")
        .arg(&log)
        .assert()
        .success()
        .stdout(predicate::str::contains("test_a"))
        .stderr(predicate::str::contains("truncated"));
}

#[test]
fn test_dump_missing_file_fails() {
    Command::cargo_bin("scrutinize")
        .unwrap()
        .args(["dump", "/nonexistent/scrutinize/out.jsonl.gz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open"));
}

// ============================================================================
// merge
// ============================================================================

#[test]
fn test_merge_concatenates_in_order() {
    let tmp_dir = TempDir::new().unwrap();
    let a = tmp_dir.path().join("gw0.jsonl.gz");
    let b = tmp_dir.path().join("gw1.jsonl.gz");
    write_log(&a, "gw0", &["test_a"]);
    write_log(&b, "gw1", &["test_b"]);
    let dest = tmp_dir.path().join("final.jsonl.gz");

    Command::cargo_bin("scrutinize")
        .unwrap()
        .arg("merge")
        .arg("-o")
        .arg(&dest)
        .arg(&b)
        .arg(&a)
        .assert()
        .success()
        .stdout(predicate::str::contains("Merged 2 of 2"));

    let producers: Vec<String> = read_events(&dest)
        .unwrap()
        .iter()
        .map(|e| e.meta().worker.clone())
        .collect();
    assert_eq!(producers, vec!["gw1", "gw1", "gw0", "gw0"]);
}

#[test]
fn test_merge_skips_missing_segment() {
    let tmp_dir = TempDir::new().unwrap();
    let a = tmp_dir.path().join("gw0.jsonl.gz");
    write_log(&a, "gw0", &["test_a"]);
    let dest = tmp_dir.path().join("final.jsonl.gz");

    Command::cargo_bin("scrutinize")
        .unwrap()
        .arg("merge")
        .arg("--output")
        .arg(&dest)
        .arg(&a)
        .arg(tmp_dir.path().join("gw1.jsonl.gz"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Merged 1 of 2"))
        .stderr(predicate::str::contains("skipped"));

    assert_eq!(read_events(&dest).unwrap().len(), 2);
}

#[test]
fn test_merge_refuses_destination_as_segment() {
    let tmp_dir = TempDir::new().unwrap();
    let a = tmp_dir.path().join("gw0.jsonl.gz");
    let b = tmp_dir.path().join("gw1.jsonl.gz");
    write_log(&a, "gw0", &["test_a", "test_b"]);
    write_log(&b, "gw1", &["test_c"]);

    Command::cargo_bin("scrutinize")
        .unwrap()
        .arg("merge")
        .arg("-o")
        .arg(&a)
        .arg(&a)
        .arg(&b)
        .assert()
        .failure()
        .stderr(predicate::str::contains("merge destination"));

    assert_eq!(read_events(&a).unwrap().len(), 3);
}

// ============================================================================
// check
// ============================================================================

#[test]
fn test_check_valid_config() {
    let tmp_dir = TempDir::new().unwrap();
    let config = tmp_dir.path().join("scrutinize.toml");
    fs::write(
        &config,
        "output = \"timings.jsonl.gz\"\nfunctions = [\"app.http.get, app.cache.get\"]\ngc = true\nsql = \"hash\"\n",
    )
    .unwrap();

    Command::cargo_bin("scrutinize")
        .unwrap()
        .arg("check")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Function: app.cache.get"))
        .stdout(predicate::str::contains("Function: app.http.get"))
        .stdout(predicate::str::contains("GC: enabled"))
        .stdout(predicate::str::contains("SQL: Hash via sql.execute"));
}

#[test]
fn test_check_rejects_bad_target() {
    let tmp_dir = TempDir::new().unwrap();
    let config = tmp_dir.path().join("scrutinize.toml");
    fs::write(&config, "output = \"t.gz\"\nfunctions = [\"not_dotted\"]\n").unwrap();

    Command::cargo_bin("scrutinize")
        .unwrap()
        .arg("check")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not_dotted"));
}
