//! Run orchestration
//!
//! One [`Instrumentation`] exists per test-run process. The host calls into
//! it at each lifecycle point and it turns those calls into timing events:
//!
//! ```text
//!  Idle ──start()──► Opened ──test_protocol()──► Running ──finish()──► Draining ──► Closed
//!                      │                            │
//!                      └──── collection(), call_test(), setup_fixture() ────┘
//! ```
//!
//! Bodies handed to the orchestrator (a test, a fixture, the collection
//! phase) return their own value untouched. A failure while measuring or
//! emitting after the body ran is a *fault*: it is logged and reported on
//! [`RunReport::faults`], and never replaces the body's result.
//!
//! # Fixture teardown timing
//!
//! Finalizers run in reverse registration order, so a generator fixture
//! registers three of them around its body:
//!
//! ```text
//! register: done, teardown_finish, [body registers its own teardown], teardown_start
//! run:      teardown_start, [fixture teardown], teardown_finish, done
//! ```

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::coordinator::{self, Coordinator, MergeReport, Role, WorkerOutput, OUTPUT_KEY};
use crate::error::{Result, ScrutinizeError};
use crate::event::{Attribution, CollectionEvent, Event, FixtureEvent, GcEvent, Meta, TestEvent};
use crate::host::{FixtureDef, FixtureKind, Finalizers, TestItem};
use crate::output::{OutputLog, WriteGuard};
use crate::recorder::{Interceptor, RecordScope, RecorderRegistry};
use crate::timer::{measure_time, Duration, Timer};

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Opened,
    Running,
    Draining,
    Closed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Opened => "opened",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Closed => "closed",
        }
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Where this process's events ended up
    pub output_path: PathBuf,
    /// Instrumentation failures that did not affect test outcomes
    pub faults: Vec<String>,
    /// Segment merge details (coordinator only)
    pub merge: Option<MergeReport>,
}

/// Event sink shared with finalizers and callbacks
#[derive(Clone)]
struct Emitter {
    producer: Arc<str>,
    output: Arc<OutputLog>,
    faults: Arc<Mutex<Vec<String>>>,
}

impl Emitter {
    fn meta(&self) -> Meta {
        Meta::new(&*self.producer)
    }

    /// Queue an event; once the log is closed the event is a fault
    fn emit(&self, event: impl Into<Event>) {
        if let Err(event) = self.output.add_if_open(event) {
            self.fault(
                event.kind(),
                ScrutinizeError::LogClosed {
                    path: self.output.path().to_path_buf(),
                    kind: event.kind(),
                },
            );
        }
    }

    fn fault(&self, context: &str, error: impl std::fmt::Display) {
        tracing::error!(producer = %self.producer, context, error = %error, "instrumentation fault");
        self.faults.lock().push(format!("{}: {}", context, error));
    }
}

/// Garbage-collection phase reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Start,
    Stop,
}

/// Collector statistics delivered with a stop notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcInfo {
    pub collected: u64,
    pub generation: u32,
}

/// Process-wide collection callback
pub struct GcHook {
    timer: Mutex<Timer>,
    emitter: Emitter,
}

impl GcHook {
    /// Handle one collector notification; safe to call from any thread
    pub fn notify(&self, phase: GcPhase, info: GcInfo) {
        let mut timer = self.timer.lock();
        match phase {
            GcPhase::Start => timer.start(),
            GcPhase::Stop => {
                timer.stop();
                match timer.elapsed() {
                    Ok(runtime) => self.emitter.emit(GcEvent {
                        meta: self.emitter.meta(),
                        runtime,
                        collected_count: info.collected,
                        generation: info.generation,
                    }),
                    Err(e) => self.emitter.fault("gc", e),
                }
                timer.reset();
            }
        }
    }
}

/// Timings shared between a fixture's finalizers
#[derive(Default)]
struct FixturePhases {
    setup: Option<Duration>,
    teardown_timer: Option<Timer>,
    teardown: Option<Duration>,
    teardown_scope: Option<RecordScope>,
}

/// Per-process orchestrator
pub struct Instrumentation {
    config: Config,
    role: Role,
    emitter: Emitter,
    interceptor: Arc<Interceptor>,
    registry: Arc<RecorderRegistry>,
    state: Mutex<RunState>,
    writer: Mutex<Option<WriteGuard>>,
    gc: Option<Arc<GcHook>>,
    coordinator: Mutex<Coordinator>,
}

impl Instrumentation {
    /// Build an idle orchestrator writing to a fresh temporary log
    pub fn new(config: Config, role: Role) -> Result<Self> {
        config.validate()?;
        let output = Arc::new(OutputLog::temporary()?);
        let producer: Arc<str> = Arc::from(role.producer_id());
        let interceptor = Arc::new(Interceptor::new());
        let registry = Arc::new(RecorderRegistry::new(
            config.mocks.clone(),
            config.sql.map(|mode| (mode, config.sql_target.clone())),
            Arc::clone(&producer),
            Arc::clone(&output),
            Arc::clone(&interceptor),
        ));
        let emitter = Emitter {
            producer,
            output,
            faults: Arc::new(Mutex::new(Vec::new())),
        };
        let gc = config.enable_gc.then(|| {
            Arc::new(GcHook {
                timer: Mutex::new(Timer::new()),
                emitter: emitter.clone(),
            })
        });

        tracing::debug!(
            role = role.as_str(),
            producer = role.producer_id(),
            log = %emitter.output.path().display(),
            "instrumentation created"
        );
        Ok(Self {
            config,
            role,
            emitter,
            interceptor,
            registry,
            state: Mutex::new(RunState::Idle),
            writer: Mutex::new(None),
            gc,
            coordinator: Mutex::new(Coordinator::new()),
        })
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// The call table host code routes interceptable calls through
    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    /// This process's temporary log file
    pub fn log_path(&self) -> &std::path::Path {
        self.emitter.output.path()
    }

    /// Collection callback to register with the runtime, if GC timing is on
    pub fn gc_hook(&self) -> Option<Arc<GcHook>> {
        self.gc.clone()
    }

    fn expect_state(&self, allowed: &[RunState], expected: &'static str) -> Result<RunState> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(ScrutinizeError::InvalidState {
                expected,
                actual: state.as_str(),
            })
        }
    }

    fn expect_active(&self) -> Result<()> {
        self.expect_state(&[RunState::Opened, RunState::Running], "opened or running")
            .map(|_| ())
    }

    /// Open the log and resolve every interception target
    pub fn start(&self) -> Result<()> {
        self.expect_state(&[RunState::Idle], "idle")?;
        let guard = self.emitter.output.open_for_write()?;
        // Dropping the guard on failure closes the log again
        self.registry.initialize_mocks()?;
        *self.writer.lock() = Some(guard);
        *self.state.lock() = RunState::Opened;
        tracing::info!(
            role = self.role.as_str(),
            functions = self.config.mocks.len(),
            gc = self.config.enable_gc,
            sql = self.config.sql.is_some(),
            "recording started"
        );
        Ok(())
    }

    /// Time the discovery phase
    ///
    /// Workers run `f` but emit nothing; collection is attributed to the
    /// coordinating process only.
    pub fn collection<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        self.expect_active()?;
        let (result, timer) = measure_time(f);
        if !self.role.is_worker() {
            match timer.elapsed() {
                Ok(runtime) => self.emitter.emit(CollectionEvent {
                    meta: self.emitter.meta(),
                    runtime,
                }),
                Err(e) => self.emitter.fault("collection", e),
            }
        }
        Ok(result)
    }

    /// Run one test's whole protocol, flushing afterwards
    pub fn test_protocol<F, R>(&self, item: &TestItem, f: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        self.expect_active()?;
        *self.state.lock() = RunState::Running;

        // Flush even if the protocol unwinds
        struct FlushOnExit<'a>(&'a Emitter, &'a str);
        impl Drop for FlushOnExit<'_> {
            fn drop(&mut self) {
                if let Err(e) = self.0.output.flush() {
                    self.0.fault(self.1, e);
                }
            }
        }

        let _flush = FlushOnExit(&self.emitter, &item.test_id);
        Ok(f())
    }

    /// Time a test body, attributing intercepted calls to the test
    pub fn call_test<F, R>(&self, item: &TestItem, f: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        self.expect_active()?;
        let scope = self.open_scope(Attribution::Test(item.test_id.clone()), &item.test_id);
        let (result, timer) = measure_time(f);
        drop(scope);

        match timer.elapsed() {
            Ok(runtime) => self.emitter.emit(TestEvent {
                meta: self.emitter.meta(),
                name: item.name.clone(),
                test_id: item.test_id.clone(),
                requires: item.requires.clone(),
                runtime,
            }),
            Err(e) => self.emitter.fault(&item.test_id, e),
        }
        Ok(result)
    }

    /// Time a fixture's setup, and its teardown via finalizers
    ///
    /// `test_id` is the test that requested the fixture; it is recorded only
    /// for function-scoped fixtures. `f` runs the fixture body and may
    /// register the fixture's own teardown on the finalizers it is given.
    pub fn setup_fixture<F, R>(
        &self,
        def: &FixtureDef,
        test_id: &str,
        finalizers: &mut dyn Finalizers,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut dyn Finalizers) -> R,
    {
        self.expect_active()?;
        let phases = Arc::new(Mutex::new(FixturePhases::default()));
        let attribution = Attribution::Fixture(def.name.clone());

        // Registered first so it runs last
        finalizers.add_finalizer(Box::new({
            let phases = Arc::clone(&phases);
            let emitter = self.emitter.clone();
            let def = def.clone();
            let test_id = def.is_function_scoped().then(|| test_id.to_string());
            move || {
                let phases = phases.lock();
                let Some(setup) = phases.setup else {
                    emitter.fault(
                        &def.name,
                        ScrutinizeError::SetupNotMeasured {
                            fixture: def.name.clone(),
                        },
                    );
                    return;
                };
                emitter.emit(FixtureEvent {
                    meta: emitter.meta(),
                    name: def.name,
                    short_name: def.short_name,
                    test_id,
                    scope: def.scope,
                    setup,
                    teardown: phases.teardown,
                });
            }
        }));

        if def.kind == FixtureKind::Generator {
            finalizers.add_finalizer(Box::new({
                let phases = Arc::clone(&phases);
                let emitter = self.emitter.clone();
                let name = def.name.clone();
                move || {
                    let mut phases = phases.lock();
                    if let Some(mut timer) = phases.teardown_timer.take() {
                        timer.stop();
                        match timer.elapsed() {
                            Ok(teardown) => phases.teardown = Some(teardown),
                            Err(e) => emitter.fault(&name, e),
                        }
                    }
                    phases.teardown_scope = None;
                }
            }));
        }

        let scope = self.open_scope(attribution.clone(), &def.name);
        let (result, timer) = measure_time(|| f(&mut *finalizers));
        drop(scope);
        match timer.elapsed() {
            Ok(setup) => phases.lock().setup = Some(setup),
            Err(e) => self.emitter.fault(&def.name, e),
        }

        if def.kind == FixtureKind::Generator {
            finalizers.add_finalizer(Box::new({
                let registry = Arc::clone(&self.registry);
                let emitter = self.emitter.clone();
                move || {
                    let mut phases = phases.lock();
                    match registry.record(attribution) {
                        Ok(scope) => phases.teardown_scope = Some(scope),
                        Err(e) => emitter.fault("fixture teardown", e),
                    }
                    let mut timer = Timer::new();
                    timer.start();
                    phases.teardown_timer = Some(timer);
                }
            }));
        }
        Ok(result)
    }

    /// Engage recorders around a body; a failure is a fault and the body
    /// still runs, unrecorded
    fn open_scope(&self, attribution: Attribution, context: &str) -> Option<RecordScope> {
        match self.registry.record(attribution) {
            Ok(scope) => Some(scope),
            Err(e) => {
                self.emitter.fault(context, e);
                None
            }
        }
    }

    /// Faults recorded so far, including any raised after `finish`
    pub fn faults(&self) -> Vec<String> {
        self.emitter.faults.lock().clone()
    }

    /// Publish this worker's log path to the coordinator's side channel
    ///
    /// Returns false (and publishes nothing) outside the worker role.
    pub fn publish_output(&self, output: &mut WorkerOutput) -> bool {
        if !self.role.is_worker() {
            return false;
        }
        let path = self.log_path();
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        output.insert(OUTPUT_KEY.to_string(), path.display().to_string());
        true
    }

    fn expect_coordinator(&self) -> Result<()> {
        if self.role == Role::Coordinator {
            Ok(())
        } else {
            Err(ScrutinizeError::InvalidState {
                expected: "coordinator",
                actual: self.role.as_str(),
            })
        }
    }

    /// Worker pool provisioning started
    pub fn setup_nodes(&self) -> Result<()> {
        self.expect_coordinator()?;
        self.coordinator.lock().setup_nodes();
        Ok(())
    }

    /// A worker came up
    pub fn node_ready(&self, worker_id: &str) -> Result<()> {
        self.expect_coordinator()?;
        self.coordinator.lock().node_ready(worker_id)
    }

    /// A worker went down, with whatever it published and its error, if any
    pub fn node_down(
        &self,
        worker_id: &str,
        output: Option<&WorkerOutput>,
        error: Option<&str>,
    ) -> Result<()> {
        self.expect_coordinator()?;
        if let Some(event) = self.coordinator.lock().node_down(worker_id, output, error)? {
            self.emitter.emit(event);
        }
        Ok(())
    }

    /// Drain, close, and produce this process's final artifact
    pub fn finish(&self) -> Result<RunReport> {
        self.expect_active()?;
        *self.state.lock() = RunState::Draining;
        self.registry.clear_mocks();

        let result = self.drain();
        *self.state.lock() = RunState::Closed;
        let (output_path, merge) = result?;

        let faults = self.faults();
        if !faults.is_empty() {
            tracing::warn!(faults = faults.len(), "run finished with instrumentation faults");
        }
        tracing::info!(output = %output_path.display(), "recording finished");
        Ok(RunReport {
            output_path,
            faults,
            merge,
        })
    }

    fn drain(&self) -> Result<(PathBuf, Option<MergeReport>)> {
        let mut coordinator = self.coordinator.lock();
        if self.role == Role::Coordinator {
            for event in coordinator.drain_unfinished() {
                tracing::warn!(worker = %event.meta.worker, "worker never reported completion");
                self.emitter.emit(event);
            }
        }

        if let Some(guard) = self.writer.lock().take() {
            guard.close()?;
        }

        let log = &self.emitter.output;
        match &self.role {
            Role::Standalone => {
                log.move_to(&self.config.output_path)?;
                Ok((self.config.output_path.clone(), None))
            }
            Role::Worker(_) => Ok((log.path().to_path_buf(), None)),
            Role::Coordinator => {
                let mut segments = vec![log.path().to_path_buf()];
                segments.extend_from_slice(coordinator.segments());
                let report = coordinator::merge_files(&self.config.output_path, &segments)?;
                if let Err(e) = std::fs::remove_file(log.path()) {
                    tracing::warn!(path = %log.path().display(), error = %e, "could not remove merged log");
                }
                Ok((self.config.output_path.clone(), Some(report)))
            }
        }
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("log", &self.emitter.output.path())
            .finish()
    }
}
