//! Error taxonomy for the event recorder
//!
//! Contract violations (a log opened twice, a timer read before it was
//! started, a recorder engaged twice) have dedicated variants and are never
//! retried. I/O and decoding failures wrap their source errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the recording engine
#[derive(Error, Debug)]
pub enum ScrutinizeError {
    #[error("Output file already opened: {}", path.display())]
    AlreadyOpen { path: PathBuf },

    #[error("Output file not opened: {}", path.display())]
    NotOpen { path: PathBuf },

    #[error("Output file not closed: {}", path.display())]
    WriterActive { path: PathBuf },

    #[error("Timer not started")]
    TimerNotStarted,

    #[error("Recursive mock call for recorder {name}")]
    RecursiveRecording { name: String },

    #[error("Cannot resolve interception target {name:?}: no callable registered under that name")]
    UnresolvedTarget { name: String },

    #[error("Invalid interception target {name:?}: expected a dotted path such as module.function")]
    InvalidTarget { name: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Instrumentation is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Fixture {fixture} finished without a measured setup phase")]
    SetupNotMeasured { fixture: String },

    #[error("SQL target {target} was called without a query")]
    MissingQuery { target: String },

    #[error("Event log already closed, dropped {kind} event: {}", path.display())]
    LogClosed { path: PathBuf, kind: &'static str },

    #[error("Segment is the merge destination itself: {}", path.display())]
    SegmentIsDestination { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration file is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ScrutinizeError>;
