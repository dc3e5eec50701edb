//! Worker-pool roles and log merging
//!
//! In a distributed run every process records into its own temporary log.
//! Workers publish the path of that log through the runner's side channel
//! ([`WorkerOutput`]); the coordinating process tracks pool lifecycle
//! signals and, at run end, concatenates its own log and every published
//! worker log (in completion order) into the final artifact.
//!
//! Merging appends each segment's compressed bytes verbatim. Segments that
//! are truncated are recovered up to their last complete event; segments
//! that cannot be read at all are skipped with a warning.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, ScrutinizeError};
use crate::event::{Meta, WorkerEvent};
use crate::output::{same_file, OutputLog, SegmentOutcome, WriteGuard};
use crate::timer::Timer;

/// Environment variable carrying the worker identity
pub const WORKER_ENV: &str = "SCRUTINIZE_WORKER";

/// Producer id of the coordinating (or only) process
pub const MASTER: &str = "master";

/// Side-channel key under which a worker publishes its log path
pub const OUTPUT_KEY: &str = "scrutinize.output";

/// Values a worker hands back to the coordinator when it finishes
pub type WorkerOutput = BTreeMap<String, String>;

/// Identity of one producer process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn master() -> Self {
        Self(MASTER.to_string())
    }

    /// Read from `SCRUTINIZE_WORKER`; unset or empty means `master`
    pub fn from_env() -> Self {
        match std::env::var(WORKER_ENV) {
            Ok(id) if !id.trim().is_empty() => Self(id.trim().to_string()),
            _ => Self::master(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.0 == MASTER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What this process does with its log at run end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// No worker pool: the log is moved to the destination
    Standalone,
    /// Pool member: the log stays put and its path is published
    Worker(WorkerId),
    /// Pool owner: merges every worker log into the destination
    Coordinator,
}

impl Role {
    /// Role of the current process
    ///
    /// A worker identity in the environment always wins; otherwise the
    /// process coordinates if a worker pool is in use.
    pub fn detect(distributed: bool) -> Self {
        let id = WorkerId::from_env();
        if !id.is_master() {
            Role::Worker(id)
        } else if distributed {
            Role::Coordinator
        } else {
            Role::Standalone
        }
    }

    /// Producer id stamped on this process's events
    pub fn producer_id(&self) -> &str {
        match self {
            Role::Worker(id) => id.as_str(),
            Role::Standalone | Role::Coordinator => MASTER,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Standalone => "standalone",
            Role::Worker(_) => "worker",
            Role::Coordinator => "coordinator",
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Role::Worker(_))
    }
}

/// Pool bookkeeping held by the coordinating process
#[derive(Debug, Default)]
pub struct Coordinator {
    nodes_timer: Timer,
    workers: HashMap<String, WorkerEvent>,
    segments: Vec<PathBuf>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool provisioning started
    pub fn setup_nodes(&mut self) {
        self.nodes_timer.start();
        tracing::debug!("worker pool provisioning started");
    }

    /// A worker came up; fails if provisioning was never signalled
    pub fn node_ready(&mut self, worker_id: &str) -> Result<()> {
        let ready = self.nodes_timer.elapsed()?;
        tracing::info!(worker = worker_id, ready_us = ready.as_microseconds(), "worker ready");
        self.workers.insert(
            worker_id.to_string(),
            WorkerEvent {
                meta: Meta::new(worker_id),
                ready,
                runtime: None,
            },
        );
        Ok(())
    }

    /// A worker went down
    ///
    /// Returns the completed worker event, if the worker was seen coming up
    /// and reported back. A published log path is queued for merging.
    pub fn node_down(
        &mut self,
        worker_id: &str,
        output: Option<&WorkerOutput>,
        error: Option<&str>,
    ) -> Result<Option<WorkerEvent>> {
        if let Some(error) = error {
            tracing::warn!(worker = worker_id, error, "worker reported an error");
        }
        let Some(output) = output else {
            tracing::warn!(worker = worker_id, "worker went down without reporting; its events are lost");
            return Ok(None);
        };

        let completed = match self.workers.remove(worker_id) {
            Some(mut event) => {
                event.runtime = Some(self.nodes_timer.elapsed()?);
                Some(event)
            }
            None => {
                tracing::warn!(worker = worker_id, "worker finished without a ready signal");
                None
            }
        };

        match output.get(OUTPUT_KEY) {
            Some(path) => {
                tracing::debug!(worker = worker_id, path = %path, "queued worker log");
                self.segments.push(PathBuf::from(path));
            }
            None => tracing::warn!(worker = worker_id, "worker published no log path"),
        }
        Ok(completed)
    }

    /// Workers that came up but never reported back
    pub fn drain_unfinished(&mut self) -> Vec<WorkerEvent> {
        let mut pending: Vec<WorkerEvent> = self.workers.drain().map(|(_, ev)| ev).collect();
        pending.sort_by(|a, b| a.ready.cmp(&b.ready));
        pending
    }

    /// Worker log paths in completion order
    pub fn segments(&self) -> &[PathBuf] {
        &self.segments
    }
}

/// Result of a merge
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: Vec<(PathBuf, SegmentOutcome)>,
    pub skipped: Vec<(PathBuf, String)>,
}

impl MergeReport {
    pub fn recovered(&self) -> usize {
        self.merged
            .iter()
            .filter(|(_, outcome)| matches!(outcome, SegmentOutcome::Recovered { .. }))
            .count()
    }
}

/// Append each segment to an open log, in order
///
/// A segment that cannot be opened or decoded is skipped; it never aborts
/// the remaining segments.
pub fn merge_segments(guard: &WriteGuard, segments: &[PathBuf]) -> MergeReport {
    let mut report = MergeReport::default();
    for path in segments {
        let segment = OutputLog::new(path.clone());
        match guard.append_segment(&segment) {
            Ok(outcome) => {
                match outcome {
                    SegmentOutcome::Copied { bytes } => {
                        tracing::debug!(path = %path.display(), bytes, "copied segment")
                    }
                    SegmentOutcome::Recovered { events } => tracing::warn!(
                        path = %path.display(),
                        events,
                        "segment was truncated, recovered complete events"
                    ),
                    SegmentOutcome::Empty => {
                        tracing::debug!(path = %path.display(), "segment is empty")
                    }
                }
                report.merged.push((path.clone(), outcome));
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable segment");
                report.skipped.push((path.clone(), e.to_string()));
            }
        }
    }
    report
}

/// Merge segment files into a fresh log at `dest`
///
/// Fails before touching `dest` if it is also one of the segments, since
/// opening it for write would truncate that segment.
pub fn merge_files(dest: &Path, segments: &[PathBuf]) -> Result<MergeReport> {
    if let Some(path) = segments.iter().find(|s| same_file(s, dest)) {
        return Err(ScrutinizeError::SegmentIsDestination { path: path.clone() });
    }
    let log = Arc::new(OutputLog::new(dest));
    let guard = log.open_for_write()?;
    let report = merge_segments(&guard, segments);
    guard.close()?;
    tracing::info!(
        dest = %dest.display(),
        merged = report.merged.len(),
        skipped = report.skipped.len(),
        "merged event logs"
    );
    Ok(report)
}
