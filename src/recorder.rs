//! Call interception and timing
//!
//! The [`Interceptor`] is the process-wide call table. Host code registers
//! the callables it is willing to have measured and routes every call
//! through it:
//!
//! ```
//! use scrutinize::recorder::Interceptor;
//!
//! let interceptor = Interceptor::new();
//! interceptor.register_target("app.http.get");
//!
//! // Runs untouched unless a recorder is engaged for "app.http.get"
//! let status = interceptor.call("app.http.get", || 200);
//! assert_eq!(status, 200);
//! ```
//!
//! While a [`RecordScope`] is open, every engaged [`SingleRecorder`] has a
//! patch installed for its target: calls are timed, emitted as `mock` (or
//! `sql`) events attributed to the active test or fixture, and their
//! results returned unchanged.
//!
//! # Recursion guard
//!
//! Opening a scope swaps the registry's recorder map for an empty one and
//! restores it when the scope closes. Anything that tries to open a nested
//! scope meanwhile (a fixture requested from inside another fixture, say)
//! finds no recorders and records nothing, so calls are never wrapped
//! twice. A single recorder additionally refuses to be engaged while it is
//! already engaged.

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{validate_target, SqlMode};
use crate::error::{Result, ScrutinizeError};
use crate::event::{Attribution, Event, Meta, MockEvent, SqlEvent};
use crate::output::OutputLog;
use crate::timer::{measure_time, Duration};

/// Event name used for the SQL recorder
pub const SQL_RECORDER_NAME: &str = "sql";

/// Hex SHA-256 of a raw query
pub fn sql_hash(query: &[u8]) -> String {
    hex::encode(Sha256::digest(query))
}

/// An active wrapper for one target
struct Patch {
    recorder: Arc<SingleRecorder>,
    attribution: Attribution,
    producer: Arc<str>,
    output: Arc<OutputLog>,
}

impl Patch {
    fn invoke<F, R>(&self, payload: Option<&[u8]>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let (result, timer) = measure_time(f);
        let event = timer.elapsed().and_then(|elapsed| {
            self.recorder.record_timing(
                &self.producer,
                self.attribution.clone(),
                elapsed,
                payload,
            )
        });
        match event {
            Ok(event) => {
                if let Err(event) = self.output.add_if_open(event) {
                    tracing::warn!(
                        recorder = %self.recorder.name,
                        kind = event.kind(),
                        path = %self.output.path().display(),
                        "event log closed, dropping call timing"
                    );
                }
            }
            Err(e) => tracing::error!(recorder = %self.recorder.name, error = %e, "call timing lost"),
        }
        result
    }
}

/// Process-wide table of interceptable callables
#[derive(Default)]
pub struct Interceptor {
    targets: RwLock<BTreeSet<String>>,
    patches: RwLock<HashMap<String, Arc<Patch>>>,
}

impl Interceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a callable that may be intercepted by name
    pub fn register_target(&self, name: impl Into<String>) {
        self.targets.write().insert(name.into());
    }

    /// Check that `name` is a valid, registered target
    pub fn resolve(&self, name: &str) -> Result<()> {
        validate_target(name)?;
        if self.targets.read().contains(name) {
            Ok(())
        } else {
            Err(ScrutinizeError::UnresolvedTarget {
                name: name.to_string(),
            })
        }
    }

    pub fn is_patched(&self, name: &str) -> bool {
        self.patches.read().contains_key(name)
    }

    /// Call `f` as the callable `name`
    pub fn call<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        match self.patch(name) {
            Some(patch) => patch.invoke(None, f),
            None => f(),
        }
    }

    /// Call `f` as the SQL entry point `name`, executing `query`
    pub fn call_sql<F, R>(&self, name: &str, query: impl AsRef<[u8]>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        match self.patch(name) {
            Some(patch) => patch.invoke(Some(query.as_ref()), f),
            None => f(),
        }
    }

    fn patch(&self, name: &str) -> Option<Arc<Patch>> {
        // Clone out so the table lock is not held while the call runs
        self.patches.read().get(name).cloned()
    }

    fn install(&self, target: &str, patch: Patch) {
        self.patches.write().insert(target.to_string(), Arc::new(patch));
    }

    fn uninstall(&self, target: &str) {
        self.patches.write().remove(target);
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("targets", &*self.targets.read())
            .field("patched", &self.patches.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What a recorder emits per call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderKind {
    Call,
    Sql(SqlMode),
}

/// Timing wrapper for a single target
#[derive(Debug)]
pub struct SingleRecorder {
    name: String,
    target: String,
    kind: RecorderKind,
    engaged: AtomicBool,
}

impl SingleRecorder {
    /// Recorder emitting `mock` events, named after its target
    pub fn call(target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            name: target.clone(),
            target,
            kind: RecorderKind::Call,
            engaged: AtomicBool::new(false),
        }
    }

    /// Recorder emitting `sql` events
    pub fn sql(target: impl Into<String>, mode: SqlMode) -> Self {
        Self {
            name: SQL_RECORDER_NAME.to_string(),
            target: target.into(),
            kind: RecorderKind::Sql(mode),
            engaged: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    fn record_timing(
        &self,
        producer: &str,
        attribution: Attribution,
        runtime: Duration,
        payload: Option<&[u8]>,
    ) -> Result<Event> {
        match self.kind {
            RecorderKind::Call => Ok(MockEvent {
                meta: Meta::new(producer),
                name: self.name.clone(),
                attribution,
                runtime,
            }
            .into()),
            RecorderKind::Sql(mode) => {
                // A query-less call has no content to hash
                let query = payload.ok_or_else(|| ScrutinizeError::MissingQuery {
                    target: self.target.clone(),
                })?;
                let sql = match mode {
                    SqlMode::Query => Some(String::from_utf8_lossy(query).into_owned()),
                    SqlMode::Hash => None,
                };
                Ok(SqlEvent {
                    meta: Meta::new(producer),
                    name: self.name.clone(),
                    attribution,
                    runtime,
                    sql_hash: sql_hash(query),
                    sql,
                }
                .into())
            }
        }
    }

    /// Install this recorder's patch until the returned guard drops
    pub fn engage(
        self: &Arc<Self>,
        interceptor: &Arc<Interceptor>,
        output: &Arc<OutputLog>,
        producer: &Arc<str>,
        attribution: Attribution,
    ) -> Result<EngagedRecorder> {
        if self.engaged.swap(true, Ordering::SeqCst) {
            return Err(ScrutinizeError::RecursiveRecording {
                name: self.name.clone(),
            });
        }
        interceptor.install(
            &self.target,
            Patch {
                recorder: Arc::clone(self),
                attribution,
                producer: Arc::clone(producer),
                output: Arc::clone(output),
            },
        );
        Ok(EngagedRecorder {
            recorder: Arc::clone(self),
            interceptor: Arc::clone(interceptor),
        })
    }
}

/// Guard for an installed patch
pub struct EngagedRecorder {
    recorder: Arc<SingleRecorder>,
    interceptor: Arc<Interceptor>,
}

impl Drop for EngagedRecorder {
    fn drop(&mut self) {
        self.interceptor.uninstall(&self.recorder.target);
        self.recorder.engaged.store(false, Ordering::SeqCst);
    }
}

/// The set of recorders available to record scopes
pub struct RecorderRegistry {
    mocks: BTreeSet<String>,
    sql: Option<(SqlMode, String)>,
    producer: Arc<str>,
    output: Arc<OutputLog>,
    interceptor: Arc<Interceptor>,
    recorders: Mutex<HashMap<String, Arc<SingleRecorder>>>,
}

impl RecorderRegistry {
    pub fn new(
        mocks: BTreeSet<String>,
        sql: Option<(SqlMode, String)>,
        producer: Arc<str>,
        output: Arc<OutputLog>,
        interceptor: Arc<Interceptor>,
    ) -> Self {
        Self {
            mocks,
            sql,
            producer,
            output,
            interceptor,
            recorders: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve every configured target and populate the registry
    ///
    /// An unknown target fails immediately and leaves the registry empty.
    pub fn initialize_mocks(&self) -> Result<()> {
        let mut recorders = HashMap::new();
        for name in &self.mocks {
            self.interceptor.resolve(name)?;
            recorders.insert(name.clone(), Arc::new(SingleRecorder::call(name.clone())));
        }
        if let Some((mode, target)) = &self.sql {
            self.interceptor.resolve(target)?;
            if self.mocks.contains(target) {
                return Err(ScrutinizeError::InvalidConfig(format!(
                    "{} is configured both as a function and as the SQL target",
                    target
                )));
            }
            recorders.insert(
                SQL_RECORDER_NAME.to_string(),
                Arc::new(SingleRecorder::sql(target.clone(), *mode)),
            );
        }
        tracing::debug!(recorders = recorders.len(), "initialized call recorders");
        *self.recorders.lock() = recorders;
        Ok(())
    }

    pub fn clear_mocks(&self) {
        self.recorders.lock().clear();
    }

    /// Available recorder registered under `name`
    pub fn recorder(&self, name: &str) -> Option<Arc<SingleRecorder>> {
        self.recorders.lock().get(name).cloned()
    }

    /// Recorders currently available (zero while a scope is open)
    pub fn available(&self) -> usize {
        self.recorders.lock().len()
    }

    /// Engage every available recorder for `attribution`
    ///
    /// The registry is emptied for the lifetime of the scope; a nested call
    /// gets an inert scope.
    pub fn record(self: &Arc<Self>, attribution: Attribution) -> Result<RecordScope> {
        let taken = std::mem::take(&mut *self.recorders.lock());
        let mut scope = RecordScope {
            registry: Arc::clone(self),
            taken: None,
            engaged: Vec::with_capacity(taken.len()),
        };
        if taken.is_empty() {
            return Ok(scope);
        }

        let recorders: Vec<Arc<SingleRecorder>> = taken.values().cloned().collect();
        scope.taken = Some(taken);
        for recorder in recorders {
            // On error the partially built scope drops and restores the registry
            scope.engaged.push(recorder.engage(
                &self.interceptor,
                &self.output,
                &self.producer,
                attribution.clone(),
            )?);
        }
        tracing::trace!(?attribution, engaged = scope.engaged.len(), "record scope opened");
        Ok(scope)
    }
}

impl std::fmt::Debug for RecorderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderRegistry")
            .field("mocks", &self.mocks)
            .field("sql", &self.sql)
            .field("available", &self.available())
            .finish()
    }
}

/// Open recording scope; disengages and restores the registry on drop
pub struct RecordScope {
    registry: Arc<RecorderRegistry>,
    taken: Option<HashMap<String, Arc<SingleRecorder>>>,
    engaged: Vec<EngagedRecorder>,
}

impl RecordScope {
    /// True if this scope engaged nothing (nested or no recorders)
    pub fn is_inert(&self) -> bool {
        self.engaged.is_empty()
    }
}

impl Drop for RecordScope {
    fn drop(&mut self) {
        self.engaged.clear();
        if let Some(taken) = self.taken.take() {
            *self.registry.recorders.lock() = taken;
        }
    }
}
