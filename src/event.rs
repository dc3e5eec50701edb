//! Typed timing events
//!
//! Every event carries a [`Meta`] block and is written as one JSON object
//! discriminated by its `type` field. The variants form a closed set:
//!
//! | `type`       | Emitted for                                  |
//! |--------------|----------------------------------------------|
//! | `collection` | the discovery phase, once per run            |
//! | `test`       | each executed test                           |
//! | `fixture`    | each fixture setup (and teardown, if any)    |
//! | `mock`       | each intercepted call                        |
//! | `sql`        | each intercepted SQL execution               |
//! | `gc`         | each garbage-collection cycle                |
//! | `worker`     | each worker process (coordinator only)       |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::FixtureScope;
use crate::timer::{now, Duration};

/// Metadata shared by every event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Producer id: a worker id, or the `master` sentinel
    pub worker: String,
    pub recorded_at: DateTime<Utc>,
    pub thread_name: String,
}

impl Meta {
    /// Metadata stamped with the current time and thread
    pub fn new(worker: impl Into<String>) -> Self {
        let thread = std::thread::current();
        let thread_name = match thread.name() {
            Some(name) => name.to_string(),
            None => format!("{:?}", thread.id()),
        };
        Self {
            worker: worker.into(),
            recorded_at: now(),
            thread_name,
        }
    }
}

/// The test or fixture a measurement belongs to
///
/// Exactly one of the two is ever set; on the wire this becomes the pair of
/// nullable `test_id` / `fixture_name` fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Attribution {
    Test(String),
    Fixture(String),
}

impl Attribution {
    pub fn test_id(&self) -> Option<&str> {
        match self {
            Attribution::Test(id) => Some(id),
            Attribution::Fixture(_) => None,
        }
    }

    pub fn fixture_name(&self) -> Option<&str> {
        match self {
            Attribution::Test(_) => None,
            Attribution::Fixture(name) => Some(name),
        }
    }

    fn into_parts(self) -> (Option<String>, Option<String>) {
        match self {
            Attribution::Test(id) => (Some(id), None),
            Attribution::Fixture(name) => (None, Some(name)),
        }
    }

    fn from_parts(test_id: Option<String>, fixture_name: Option<String>) -> Result<Self, String> {
        match (test_id, fixture_name) {
            (Some(id), None) => Ok(Attribution::Test(id)),
            (None, Some(name)) => Ok(Attribution::Fixture(name)),
            (Some(_), Some(_)) => Err("mock event has both test_id and fixture_name".to_string()),
            (None, None) => Err("mock event has neither test_id nor fixture_name".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcEvent {
    pub meta: Meta,
    pub runtime: Duration,
    pub collected_count: u64,
    pub generation: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEvent {
    pub meta: Meta,
    pub runtime: Duration,
}

/// Worker lifecycle: `ready` is set when the node comes up, `runtime` once it reports down
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub meta: Meta,
    pub ready: Duration,
    #[serde(default)]
    pub runtime: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "MockRecord", try_from = "MockRecord")]
pub struct MockEvent {
    pub meta: Meta,
    pub name: String,
    pub attribution: Attribution,
    pub runtime: Duration,
}

#[derive(Serialize, Deserialize)]
struct MockRecord {
    meta: Meta,
    name: String,
    test_id: Option<String>,
    fixture_name: Option<String>,
    runtime: Duration,
}

impl From<MockEvent> for MockRecord {
    fn from(ev: MockEvent) -> Self {
        let (test_id, fixture_name) = ev.attribution.into_parts();
        Self {
            meta: ev.meta,
            name: ev.name,
            test_id,
            fixture_name,
            runtime: ev.runtime,
        }
    }
}

impl TryFrom<MockRecord> for MockEvent {
    type Error = String;

    fn try_from(rec: MockRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            meta: rec.meta,
            name: rec.name,
            attribution: Attribution::from_parts(rec.test_id, rec.fixture_name)?,
            runtime: rec.runtime,
        })
    }
}

/// Intercepted SQL execution
///
/// `sql_hash` is the hex SHA-256 of the raw query; `sql` holds the query
/// text only in full-query mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "SqlRecord", try_from = "SqlRecord")]
pub struct SqlEvent {
    pub meta: Meta,
    pub name: String,
    pub attribution: Attribution,
    pub runtime: Duration,
    pub sql_hash: String,
    pub sql: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SqlRecord {
    meta: Meta,
    name: String,
    test_id: Option<String>,
    fixture_name: Option<String>,
    runtime: Duration,
    sql_hash: String,
    sql: Option<String>,
}

impl From<SqlEvent> for SqlRecord {
    fn from(ev: SqlEvent) -> Self {
        let (test_id, fixture_name) = ev.attribution.into_parts();
        Self {
            meta: ev.meta,
            name: ev.name,
            test_id,
            fixture_name,
            runtime: ev.runtime,
            sql_hash: ev.sql_hash,
            sql: ev.sql,
        }
    }
}

impl TryFrom<SqlRecord> for SqlEvent {
    type Error = String;

    fn try_from(rec: SqlRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            meta: rec.meta,
            name: rec.name,
            attribution: Attribution::from_parts(rec.test_id, rec.fixture_name)?,
            runtime: rec.runtime,
            sql_hash: rec.sql_hash,
            sql: rec.sql,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    pub meta: Meta,
    pub name: String,
    pub test_id: String,
    /// Declared fixture dependencies
    pub requires: Vec<String>,
    pub runtime: Duration,
}

/// Fixture setup and optional teardown
///
/// `runtime` is not stored: it is `setup`, plus `teardown` when present,
/// and is written out as a computed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "FixtureRecord", from = "FixtureRecord")]
pub struct FixtureEvent {
    pub meta: Meta,
    /// Qualified name (`module.function`)
    pub name: String,
    pub short_name: String,
    /// Set only for function-scoped fixtures
    pub test_id: Option<String>,
    pub scope: FixtureScope,
    pub setup: Duration,
    pub teardown: Option<Duration>,
}

impl FixtureEvent {
    pub fn runtime(&self) -> Duration {
        match self.teardown {
            Some(teardown) => self.setup + teardown,
            None => self.setup,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct FixtureRecord {
    meta: Meta,
    name: String,
    short_name: String,
    test_id: Option<String>,
    scope: FixtureScope,
    setup: Duration,
    teardown: Option<Duration>,
    #[serde(default, skip_deserializing)]
    runtime: Duration,
}

impl From<FixtureEvent> for FixtureRecord {
    fn from(ev: FixtureEvent) -> Self {
        let runtime = ev.runtime();
        Self {
            meta: ev.meta,
            name: ev.name,
            short_name: ev.short_name,
            test_id: ev.test_id,
            scope: ev.scope,
            setup: ev.setup,
            teardown: ev.teardown,
            runtime,
        }
    }
}

impl From<FixtureRecord> for FixtureEvent {
    fn from(rec: FixtureRecord) -> Self {
        Self {
            meta: rec.meta,
            name: rec.name,
            short_name: rec.short_name,
            test_id: rec.test_id,
            scope: rec.scope,
            setup: rec.setup,
            teardown: rec.teardown,
        }
    }
}

/// One record of the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Gc(GcEvent),
    Collection(CollectionEvent),
    Worker(WorkerEvent),
    Mock(MockEvent),
    Sql(SqlEvent),
    Test(TestEvent),
    Fixture(FixtureEvent),
}

impl Event {
    pub fn meta(&self) -> &Meta {
        match self {
            Event::Gc(ev) => &ev.meta,
            Event::Collection(ev) => &ev.meta,
            Event::Worker(ev) => &ev.meta,
            Event::Mock(ev) => &ev.meta,
            Event::Sql(ev) => &ev.meta,
            Event::Test(ev) => &ev.meta,
            Event::Fixture(ev) => &ev.meta,
        }
    }

    /// The `type` tag this event is written with
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Gc(_) => "gc",
            Event::Collection(_) => "collection",
            Event::Worker(_) => "worker",
            Event::Mock(_) => "mock",
            Event::Sql(_) => "sql",
            Event::Test(_) => "test",
            Event::Fixture(_) => "fixture",
        }
    }

    /// Primary duration of the event; `None` for a worker that never finished
    pub fn runtime(&self) -> Option<Duration> {
        match self {
            Event::Gc(ev) => Some(ev.runtime),
            Event::Collection(ev) => Some(ev.runtime),
            Event::Worker(ev) => ev.runtime,
            Event::Mock(ev) => Some(ev.runtime),
            Event::Sql(ev) => Some(ev.runtime),
            Event::Test(ev) => Some(ev.runtime),
            Event::Fixture(ev) => Some(ev.runtime()),
        }
    }

    /// Attribution of an intercepted call, if this is one
    pub fn attribution(&self) -> Option<&Attribution> {
        match self {
            Event::Mock(ev) => Some(&ev.attribution),
            Event::Sql(ev) => Some(&ev.attribution),
            _ => None,
        }
    }
}

macro_rules! impl_from_variant {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Event {
                fn from(ev: $ty) -> Self {
                    Event::$variant(ev)
                }
            }
        )*
    };
}

impl_from_variant! {
    Gc => GcEvent,
    Collection => CollectionEvent,
    Worker => WorkerEvent,
    Mock => MockEvent,
    Sql => SqlEvent,
    Test => TestEvent,
    Fixture => FixtureEvent,
}
