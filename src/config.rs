// Configuration surface for a recorded run
//
// Sources: programmatic builder, the host's repeated comma-separated
// function lists, or a TOML file.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{Result, ScrutinizeError};

/// Default interception target for SQL executions
pub const DEFAULT_SQL_TARGET: &str = "sql.execute";

/// Detail level for intercepted SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlMode {
    /// Record only the query hash
    #[default]
    Hash,
    /// Record the hash and the full query text
    Query,
}

impl std::str::FromStr for SqlMode {
    type Err = ScrutinizeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hash" => Ok(SqlMode::Hash),
            "query" => Ok(SqlMode::Query),
            other => Err(ScrutinizeError::InvalidConfig(format!(
                "sql mode must be \"hash\" or \"query\", got {:?}",
                other
            ))),
        }
    }
}

/// Run configuration
///
/// # Example
/// ```
/// use scrutinize::config::{Config, SqlMode};
///
/// let config = Config::new("timings.jsonl.gz")
///     .with_func_args(["app.http.get, app.http.post", "app.cache.get"])
///     .with_gc(true)
///     .with_sql(SqlMode::Hash);
/// assert_eq!(config.mocks.len(), 3);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Destination of the final artifact
    pub output_path: PathBuf,
    /// Dotted names of callables to intercept
    pub mocks: BTreeSet<String>,
    pub enable_gc: bool,
    /// SQL interception, if enabled
    pub sql: Option<SqlMode>,
    /// Callable name routed through for SQL executions
    pub sql_target: String,
}

impl Config {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            mocks: BTreeSet::new(),
            enable_gc: false,
            sql: None,
            sql_target: DEFAULT_SQL_TARGET.to_string(),
        }
    }

    /// Add functions from repeated, comma-separated lists
    ///
    /// Entries are trimmed; empty entries are dropped.
    pub fn with_func_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.mocks.extend(
                arg.as_ref()
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
            );
        }
        self
    }

    pub fn with_gc(mut self, enable: bool) -> Self {
        self.enable_gc = enable;
        self
    }

    pub fn with_sql(mut self, mode: SqlMode) -> Self {
        self.sql = Some(mode);
        self
    }

    pub fn with_sql_target(mut self, target: impl Into<String>) -> Self {
        self.sql_target = target.into();
        self
    }

    /// Check every interception target is a dotted path
    pub fn validate(&self) -> Result<()> {
        if self.output_path.as_os_str().is_empty() {
            return Err(ScrutinizeError::InvalidConfig(
                "output path must not be empty".to_string(),
            ));
        }
        for name in &self.mocks {
            validate_target(name)?;
        }
        if self.sql.is_some() {
            validate_target(&self.sql_target)?;
        }
        Ok(())
    }

    /// Parse a TOML configuration
    ///
    /// ```toml
    /// output = "timings.jsonl.gz"
    /// functions = ["app.http.get", "app.cache.get"]
    /// gc = true
    /// sql = "query"
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        let mut config = Config::new(file.output)
            .with_func_args(&file.functions)
            .with_gc(file.gc);
        config.sql = file.sql;
        if let Some(target) = file.sql_target {
            config.sql_target = target;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    output: PathBuf,
    #[serde(default)]
    functions: Vec<String>,
    #[serde(default)]
    gc: bool,
    #[serde(default)]
    sql: Option<SqlMode>,
    #[serde(default)]
    sql_target: Option<String>,
}

fn dotted_name() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)+$")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

/// A target must look like `module.callable` (at least one dot)
pub fn validate_target(name: &str) -> Result<()> {
    if dotted_name().is_match(name) {
        Ok(())
    } else {
        Err(ScrutinizeError::InvalidTarget {
            name: name.to_string(),
        })
    }
}
