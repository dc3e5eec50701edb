// Worker-pool runs: per-worker logs merged by the coordinating process.

use scrutinize::coordinator::{WorkerId, WorkerOutput, MASTER, OUTPUT_KEY, WORKER_ENV};
use scrutinize::event::{Event, WorkerEvent};
use scrutinize::host::{FinalizerStack, FixtureDef, FixtureKind, FixtureScope, TestItem};
use scrutinize::output::{read_events, SegmentOutcome};
use scrutinize::{Config, Instrumentation, Role};
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Run one worker process worth of tests and return what it published
fn run_worker(id: &str, dest: &Path, tests: &[&str]) -> WorkerOutput {
    let inst = Instrumentation::new(Config::new(dest), Role::Worker(WorkerId::new(id))).unwrap();
    inst.start().unwrap();
    inst.collection(|| ()).unwrap();

    let def = FixtureDef::new("tests.conftest", "db", FixtureScope::Function, FixtureKind::Generator);
    for name in tests {
        let item = TestItem::new(*name, format!("tests/suite.rs::{}", name)).with_requires(["db"]);
        let mut finalizers = FinalizerStack::new();
        inst.test_protocol(&item, || {
            inst.setup_fixture(&def, &item.test_id, &mut finalizers, |_| ())
                .unwrap();
            inst.call_test(&item, || ()).unwrap();
            finalizers.run_all();
        })
        .unwrap();
    }

    let mut output = WorkerOutput::new();
    assert!(inst.publish_output(&mut output));
    let report = inst.finish().unwrap();
    assert!(report.output_path.exists());
    assert_ne!(report.output_path, dest);
    output
}

fn published_path(output: &WorkerOutput) -> PathBuf {
    PathBuf::from(&output[OUTPUT_KEY])
}

fn cleanup(outputs: &[&WorkerOutput]) {
    for output in outputs {
        if let Some(dir) = published_path(output).parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}

fn workers_of(events: &[Event]) -> Vec<&WorkerEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Worker(w) => Some(w),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Merging
// ============================================================================

#[test]
fn test_two_workers_merged_into_final_log() {
    let tmp_dir = TempDir::new().unwrap();
    let dest = tmp_dir.path().join("final.jsonl.gz");

    let coordinator = Instrumentation::new(Config::new(&dest), Role::Coordinator).unwrap();
    coordinator.start().unwrap();
    coordinator.collection(|| ()).unwrap();
    coordinator.setup_nodes().unwrap();
    coordinator.node_ready("gw0").unwrap();
    coordinator.node_ready("gw1").unwrap();

    let out0 = run_worker("gw0", &dest, &["test_a", "test_b"]);
    let out1 = run_worker("gw1", &dest, &["test_c"]);

    // gw1 reports first
    coordinator.node_down("gw1", Some(&out1), None).unwrap();
    coordinator.node_down("gw0", Some(&out0), None).unwrap();
    let report = coordinator.finish().unwrap();
    assert!(report.faults.is_empty());

    let merge = report.merge.unwrap();
    assert_eq!(merge.merged.len(), 3);
    assert!(merge.skipped.is_empty());
    assert!(merge
        .merged
        .iter()
        .all(|(_, outcome)| matches!(outcome, SegmentOutcome::Copied { .. })));

    let events = read_events(&dest).unwrap();

    let workers = workers_of(&events);
    assert_eq!(workers.len(), 2);
    for worker in &workers {
        assert!(worker.runtime.unwrap() >= worker.ready);
    }

    // Exactly one collection event, from the coordinator
    let collections: Vec<_> = events.iter().filter(|e| e.kind() == "collection").collect();
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].meta().worker, MASTER);

    let producers: Vec<&str> = events
        .iter()
        .filter(|e| matches!(e, Event::Test(_) | Event::Fixture(_)))
        .map(|e| e.meta().worker.as_str())
        .collect();
    assert_eq!(producers.len(), 6);
    assert!(producers.iter().all(|w| *w != MASTER));

    // Coordinator's own events, then workers in completion order
    let first_worker_event = producers.iter().position(|w| *w == "gw0").unwrap();
    assert!(producers[..first_worker_event].iter().all(|w| *w == "gw1"));

    let test_ids: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            Event::Test(t) => Some(t.test_id.as_str()),
            _ => None,
        })
        .collect();
    let mut unique = test_ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), test_ids.len());

    cleanup(&[&out0, &out1]);
}

#[test]
fn test_crashed_worker_is_skipped() {
    let tmp_dir = TempDir::new().unwrap();
    let dest = tmp_dir.path().join("final.jsonl.gz");

    let coordinator = Instrumentation::new(Config::new(&dest), Role::Coordinator).unwrap();
    coordinator.start().unwrap();
    coordinator.setup_nodes().unwrap();
    coordinator.node_ready("gw0").unwrap();
    coordinator.node_ready("gw1").unwrap();
    coordinator.node_ready("gw2").unwrap();

    let out0 = run_worker("gw0", &dest, &["test_a"]);
    coordinator.node_down("gw0", Some(&out0), None).unwrap();
    // gw1 died without publishing anything; gw2 never reported at all
    coordinator
        .node_down("gw1", None, Some("worker 'gw1' crashed"))
        .unwrap();

    let report = coordinator.finish().unwrap();
    let merge = report.merge.unwrap();
    assert_eq!(merge.merged.len(), 2);

    let events = read_events(&dest).unwrap();
    let workers = workers_of(&events);
    let finished: Vec<&str> = workers
        .iter()
        .filter(|w| w.runtime.is_some())
        .map(|w| w.meta.worker.as_str())
        .collect();
    assert_eq!(finished, vec!["gw0"]);
    assert!(workers
        .iter()
        .filter(|w| w.meta.worker != "gw0")
        .all(|w| w.runtime.is_none()));

    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Test(t) if t.test_id == "tests/suite.rs::test_a")));
    assert!(events
        .iter()
        .filter(|e| e.kind() == "test")
        .all(|e| e.meta().worker == "gw0"));

    cleanup(&[&out0]);
}

#[test]
fn test_truncated_worker_log_is_recovered() {
    let tmp_dir = TempDir::new().unwrap();
    let dest = tmp_dir.path().join("final.jsonl.gz");

    let coordinator = Instrumentation::new(Config::new(&dest), Role::Coordinator).unwrap();
    coordinator.start().unwrap();
    coordinator.setup_nodes().unwrap();
    coordinator.node_ready("gw0").unwrap();
    coordinator.node_ready("gw1").unwrap();

    let out0 = run_worker("gw0", &dest, &["test_a", "test_b"]);
    let out1 = run_worker("gw1", &dest, &["test_c"]);

    // Killed before the final gzip trailer was written
    let path0 = published_path(&out0);
    let bytes = fs::read(&path0).unwrap();
    fs::write(&path0, &bytes[..bytes.len() - 8]).unwrap();

    coordinator.node_down("gw0", Some(&out0), None).unwrap();
    coordinator.node_down("gw1", Some(&out1), None).unwrap();
    let report = coordinator.finish().unwrap();
    assert_eq!(report.merge.unwrap().recovered(), 1);

    let events = read_events(&dest).unwrap();
    let tests: Vec<&str> = events
        .iter()
        .filter(|e| e.kind() == "test")
        .map(|e| e.meta().worker.as_str())
        .collect();
    assert_eq!(tests, vec!["gw0", "gw0", "gw1"]);

    cleanup(&[&out0, &out1]);
}

#[test]
fn test_worker_cannot_drive_pool_hooks() {
    let tmp_dir = TempDir::new().unwrap();
    let inst = Instrumentation::new(
        Config::new(tmp_dir.path().join("x.jsonl.gz")),
        Role::Worker(WorkerId::new("gw0")),
    )
    .unwrap();
    assert!(inst.setup_nodes().is_err());
    assert!(inst.node_ready("gw1").is_err());
}

// ============================================================================
// Role detection (touches process environment)
// ============================================================================

#[test]
#[serial]
fn test_role_from_worker_env() {
    std::env::set_var(WORKER_ENV, "gw4");
    assert_eq!(Role::detect(true), Role::Worker(WorkerId::new("gw4")));
    assert_eq!(Role::detect(false).producer_id(), "gw4");
    std::env::remove_var(WORKER_ENV);
}

#[test]
#[serial]
fn test_role_without_worker_env() {
    std::env::remove_var(WORKER_ENV);
    assert_eq!(Role::detect(true), Role::Coordinator);
    assert_eq!(Role::detect(false), Role::Standalone);
    assert!(WorkerId::from_env().is_master());
}

#[test]
#[serial]
fn test_master_sentinel_in_env_is_not_a_worker() {
    std::env::set_var(WORKER_ENV, MASTER);
    assert_eq!(Role::detect(false), Role::Standalone);
    std::env::remove_var(WORKER_ENV);
}
