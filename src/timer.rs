//! Monotonic timing primitives
//!
//! `Timer` measures elapsed time with `std::time::Instant`, which is immune
//! to wall-clock adjustments. `Duration` is the serialized form carried by
//! every timing event: a nanosecond count with derived microsecond and text
//! views that are computed, never stored.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::time::Instant;

use crate::error::{Result, ScrutinizeError};

/// Wall-clock timestamp used for event metadata
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Elapsed time in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(into = "DurationRepr", from = "DurationRepr")]
pub struct Duration {
    as_nanoseconds: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { as_nanoseconds: 0 };

    pub fn from_nanos(nanos: u64) -> Self {
        Self {
            as_nanoseconds: nanos,
        }
    }

    pub fn as_nanoseconds(&self) -> u64 {
        self.as_nanoseconds
    }

    /// Whole microseconds (truncating division)
    pub fn as_microseconds(&self) -> u64 {
        self.as_nanoseconds / 1_000
    }

    /// Whole-microsecond delta, matching `as_microseconds`
    pub fn as_iso(&self) -> TimeDelta {
        TimeDelta::microseconds(i64::try_from(self.as_microseconds()).unwrap_or(i64::MAX))
    }

    pub fn as_text(&self) -> String {
        format!("{} microseconds", self.as_microseconds())
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, other: Duration) -> Duration {
        Duration::from_nanos(self.as_nanoseconds.saturating_add(other.as_nanoseconds))
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Duration::from_nanos(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// Wire form: computed fields are written out, only nanoseconds are read back
#[derive(Serialize, Deserialize)]
struct DurationRepr {
    as_nanoseconds: u64,
    #[serde(default, skip_deserializing)]
    as_microseconds: u64,
    #[serde(default, skip_deserializing)]
    as_iso: String,
    #[serde(default, skip_deserializing)]
    as_text: String,
}

impl From<Duration> for DurationRepr {
    fn from(d: Duration) -> Self {
        Self {
            as_nanoseconds: d.as_nanoseconds,
            as_microseconds: d.as_microseconds(),
            as_iso: d.as_iso().to_string(),
            as_text: d.as_text(),
        }
    }
}

impl From<DurationRepr> for Duration {
    fn from(repr: DurationRepr) -> Self {
        Duration::from_nanos(repr.as_nanoseconds)
    }
}

/// Start/stop timer over a monotonic clock
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    start: Option<Instant>,
    end: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset and record a new origin
    pub fn start(&mut self) {
        self.reset();
        self.start = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        self.end = Some(Instant::now());
    }

    pub fn reset(&mut self) {
        self.start = None;
        self.end = None;
    }

    pub fn is_started(&self) -> bool {
        self.start.is_some()
    }

    /// Time from origin to stop, or to now while still running
    pub fn elapsed(&self) -> Result<Duration> {
        let start = self.start.ok_or(ScrutinizeError::TimerNotStarted)?;
        let end = self.end.unwrap_or_else(Instant::now);
        Ok(end.saturating_duration_since(start).into())
    }

    /// Start the timer and stop it when the returned guard drops
    ///
    /// The stop happens on every exit path, including unwinding.
    pub fn scope(&mut self) -> TimerScope<'_> {
        self.start();
        TimerScope { timer: self }
    }
}

/// Guard returned by [`Timer::scope`]
pub struct TimerScope<'a> {
    timer: &'a mut Timer,
}

impl Drop for TimerScope<'_> {
    fn drop(&mut self) {
        self.timer.stop();
    }
}

/// Run `f` inside a fresh timer, returning its result and the stopped timer
///
/// # Example
/// ```
/// use scrutinize::timer::measure_time;
///
/// let (value, timer) = measure_time(|| 6 * 7);
/// assert_eq!(value, 42);
/// assert!(timer.elapsed().is_ok());
/// ```
pub fn measure_time<F, R>(f: F) -> (R, Timer)
where
    F: FnOnce() -> R,
{
    let mut timer = Timer::new();
    let result = {
        let _scope = timer.scope();
        f()
    };
    (result, timer)
}
