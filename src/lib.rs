//! Scrutinize - structured timing logs for test runs
//!
//! This library records how long every notable phase of a test run takes:
//! collection, tests, fixture setup and teardown, garbage collection and
//! intercepted calls (including SQL), as a gzip-compressed JSON-lines event
//! log. In a worker-pool run each process writes its own log and the
//! coordinating process merges them into one artifact.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod host;
pub mod instrumentation;
pub mod output;
pub mod recorder;
pub mod timer;

pub use config::{Config, SqlMode};
pub use coordinator::Role;
pub use error::{Result, ScrutinizeError};
pub use event::Event;
pub use instrumentation::{Instrumentation, RunReport};
