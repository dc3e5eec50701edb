//! Narrow contracts with the host test runner
//!
//! The recorder never discovers tests or resolves fixtures itself. The host
//! describes what it is running with these types and hands over a
//! [`Finalizers`] implementation for deferred cleanup callbacks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A test about to be executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestItem {
    pub name: String,
    /// Unique node id, e.g. `tests/api.rs::test_login`
    pub test_id: String,
    /// Declared fixture dependencies
    pub requires: Vec<String>,
}

impl TestItem {
    pub fn new(name: impl Into<String>, test_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            test_id: test_id.into(),
            requires: Vec::new(),
        }
    }

    pub fn with_requires<I, S>(mut self, fixtures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = fixtures.into_iter().map(Into::into).collect();
        self
    }
}

/// Lifetime of a fixture value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureScope {
    Function,
    Class,
    Module,
    Package,
    Session,
}

impl FixtureScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixtureScope::Function => "function",
            FixtureScope::Class => "class",
            FixtureScope::Module => "module",
            FixtureScope::Package => "package",
            FixtureScope::Session => "session",
        }
    }
}

impl fmt::Display for FixtureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a fixture has a teardown phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureKind {
    /// Setup only
    Plain,
    /// Setup, then a teardown run later from a finalizer
    Generator,
}

/// A fixture about to be set up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureDef {
    /// Qualified name (`module.function`)
    pub name: String,
    pub short_name: String,
    pub scope: FixtureScope,
    pub kind: FixtureKind,
}

impl FixtureDef {
    /// Build from a module path and function name
    pub fn new(module: &str, short_name: &str, scope: FixtureScope, kind: FixtureKind) -> Self {
        Self {
            name: format!("{}.{}", module, short_name),
            short_name: short_name.to_string(),
            scope,
            kind,
        }
    }

    pub fn is_function_scoped(&self) -> bool {
        self.scope == FixtureScope::Function
    }
}

pub type Finalizer = Box<dyn FnOnce() + Send + 'static>;

/// Deferred cleanup registration
///
/// Implementations must run finalizers in reverse registration order; the
/// fixture teardown timing relies on it.
pub trait Finalizers {
    fn add_finalizer(&mut self, finalizer: Finalizer);
}

/// LIFO finalizer list
#[derive(Default)]
pub struct FinalizerStack {
    pending: Vec<Finalizer>,
}

impl FinalizerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run every pending finalizer, most recently registered first
    pub fn run_all(&mut self) {
        while let Some(finalizer) = self.pending.pop() {
            finalizer();
        }
    }
}

impl Finalizers for FinalizerStack {
    fn add_finalizer(&mut self, finalizer: Finalizer) {
        self.pending.push(finalizer);
    }
}

impl fmt::Debug for FinalizerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizerStack")
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_finalizers_run_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = FinalizerStack::new();
        for i in 0..3 {
            let order = order.clone();
            stack.add_finalizer(Box::new(move || order.lock().unwrap().push(i)));
        }
        assert_eq!(stack.len(), 3);

        stack.run_all();
        assert!(stack.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_fixture_def_qualified_name() {
        let def = FixtureDef::new("tests.api", "client", FixtureScope::Module, FixtureKind::Plain);
        assert_eq!(def.name, "tests.api.client");
        assert_eq!(def.short_name, "client");
        assert!(!def.is_function_scoped());
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(FixtureScope::Session.to_string(), "session");
        assert_eq!(
            serde_json::to_string(&FixtureScope::Package).unwrap(),
            "\"package\""
        );
    }

    #[test]
    fn test_item_requires() {
        let item = TestItem::new("test_login", "tests/api.rs::test_login")
            .with_requires(["client", "db"]);
        assert_eq!(item.requires, vec!["client".to_string(), "db".to_string()]);
    }
}
