//! Driver seam: dialect capabilities, connections, and the value model.
//!
//! Backends plug in through two traits. [`Dialect`] is a static capability
//! object selected once per [`ServerConfig`] — it answers questions the core
//! needs (does this backend use wrapped queries, what do its stale-handle
//! errors look like, how is its URL built). [`Driver`] actually opens
//! connections and is registered per dialect in a [`DriverRegistry`], so the
//! core never links a concrete client library.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{QdeskError, Result};
use crate::server::{DialectTag, ServerConfig};

/// Error-text fragments that identify a silently closed array-database
/// handle. This is a textual contract with remote processes that only emit
/// text — match these exact substrings, do not "improve" them into typed
/// errors.
pub const STALE_HANDLE_MARKERS: [&str; 2] = ["Connection reset by peer", "end of stream"];

/// Per-backend capabilities, selected once per server config.
pub trait Dialect: Send + Sync {
    /// Whether queries are sent inside the protective envelope.
    fn wraps_queries(&self) -> bool;

    /// Error-text fragments indicating a stale (remotely closed) handle.
    /// Empty for backends without the condition.
    fn stale_handle_markers(&self) -> &'static [&'static str];

    /// Whether connections go through the shared pool by default.
    fn pooled(&self) -> bool;

    /// Connection URL for display and for drivers that want one.
    fn build_url(&self, server: &ServerConfig) -> String;
}

struct KqDialect;
struct PostgresDialect;
struct SqliteDialect;

impl Dialect for KqDialect {
    fn wraps_queries(&self) -> bool {
        true
    }

    fn stale_handle_markers(&self) -> &'static [&'static str] {
        &STALE_HANDLE_MARKERS
    }

    fn pooled(&self) -> bool {
        false
    }

    fn build_url(&self, server: &ServerConfig) -> String {
        match &server.database {
            Some(db) => format!("kq://{}:{}/{}", server.host, server.port, db),
            None => format!("kq://{}:{}", server.host, server.port),
        }
    }
}

impl Dialect for PostgresDialect {
    fn wraps_queries(&self) -> bool {
        false
    }

    fn stale_handle_markers(&self) -> &'static [&'static str] {
        &[]
    }

    fn pooled(&self) -> bool {
        true
    }

    fn build_url(&self, server: &ServerConfig) -> String {
        let mut url = format!("postgres://{}@{}", server.username, server.host);
        if server.port != 5432 {
            url.push(':');
            url.push_str(&server.port.to_string());
        }
        url.push('/');
        if let Some(db) = &server.database {
            url.push_str(db);
        }
        url
    }
}

impl Dialect for SqliteDialect {
    fn wraps_queries(&self) -> bool {
        false
    }

    fn stale_handle_markers(&self) -> &'static [&'static str] {
        &[]
    }

    fn pooled(&self) -> bool {
        true
    }

    fn build_url(&self, server: &ServerConfig) -> String {
        format!("sqlite://{}", server.database.as_deref().unwrap_or(":memory:"))
    }
}

impl DialectTag {
    /// The capability object for this tag.
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            DialectTag::Kq => &KqDialect,
            DialectTag::Postgres => &PostgresDialect,
            DialectTag::Sqlite => &SqliteDialect,
        }
    }
}

/// Relational view of a result for tabular display.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cursor {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Cursor {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }
}

/// Dynamic value returned by a backend evaluation.
///
/// Array-database replies arrive as nested lists; relational backends
/// produce `Table` values directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Long(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    List(Vec<Value>),
    Table(Cursor),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Message text for error payloads: strings and symbols verbatim,
    /// anything else rendered.
    pub fn text(&self) -> String {
        match self {
            Value::Str(s) | Value::Symbol(s) => s.clone(),
            other => other.console(),
        }
    }

    /// Relational cursor view, if this value has one.
    pub fn as_cursor(&self) -> Option<Cursor> {
        match self {
            Value::Table(c) => Some(c.clone()),
            _ => None,
        }
    }

    /// Local plain-text rendering, used as the console fallback when the
    /// remote console text is unavailable (unwrapped mode).
    pub fn console(&self) -> String {
        match self {
            Value::Null => "::".to_string(),
            Value::Bool(true) => "1b".to_string(),
            Value::Bool(false) => "0b".to_string(),
            Value::Long(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::Symbol(s) => format!("`{}", s),
            Value::List(items) => items
                .iter()
                .map(|v| v.console())
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Table(c) => format!("{} column(s), {} row(s)", c.columns.len(), c.rows.len()),
        }
    }

    /// Cursor view for relational wrappers: tables pass through, scalars
    /// become a one-cell grid, everything else one value per row.
    pub fn into_cursor(self) -> Cursor {
        match self {
            Value::Table(c) => c,
            Value::Null => Cursor::default(),
            Value::List(items) => Cursor::new(
                vec!["value".to_string()],
                items.into_iter().map(|v| vec![v.console()]).collect(),
            ),
            scalar => Cursor::new(vec!["value".to_string()], vec![vec![scalar.console()]]),
        }
    }
}

/// An exclusive handle to one live backend connection.
///
/// Handles are never shared concurrently; the pool hands each one to a
/// single borrower at a time. `close` severs the local side only — a remote
/// server that is mid-computation is not told to stop.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the local side of the handle is still usable.
    fn is_open(&self) -> bool;

    /// Evaluate an expression and return its value.
    async fn query(&self, text: &str) -> Result<Value>;

    /// Run a statement, returning the affected-row count.
    async fn execute(&self, text: &str) -> Result<u64>;

    /// Sever the local handle. Idempotent.
    fn close(&self);
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("is_open", &self.is_open())
            .finish()
    }
}

/// Opens connections for one dialect.
#[async_trait]
pub trait Driver: Send + Sync {
    fn dialect(&self) -> DialectTag;

    async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn Connection>>;
}

/// Registry of drivers, one per dialect.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<DialectTag, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver, replacing any previous driver for its dialect.
    pub fn register(&self, driver: Arc<dyn Driver>) {
        self.drivers
            .write()
            .unwrap()
            .insert(driver.dialect(), driver);
    }

    pub fn driver_for(&self, tag: DialectTag) -> Result<Arc<dyn Driver>> {
        self.drivers
            .read()
            .unwrap()
            .get(&tag)
            .cloned()
            .ok_or_else(|| QdeskError::Connectivity(format!("no driver registered for {}", tag)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_capabilities() {
        assert!(DialectTag::Kq.dialect().wraps_queries());
        assert!(!DialectTag::Kq.dialect().pooled());
        assert_eq!(
            DialectTag::Kq.dialect().stale_handle_markers(),
            &STALE_HANDLE_MARKERS
        );

        assert!(!DialectTag::Postgres.dialect().wraps_queries());
        assert!(DialectTag::Postgres.dialect().pooled());
        assert!(DialectTag::Postgres.dialect().stale_handle_markers().is_empty());
    }

    #[test]
    fn test_build_urls() {
        let kq = ServerConfig::new("a", "tick.example.com", 5010);
        assert_eq!(
            DialectTag::Kq.dialect().build_url(&kq),
            "kq://tick.example.com:5010"
        );

        let pg = ServerConfig::new("b", "db.example.com", 5432)
            .with_credentials("admin", "x")
            .with_database("prod");
        assert_eq!(
            DialectTag::Postgres.dialect().build_url(&pg),
            "postgres://admin@db.example.com/prod"
        );

        let pg_alt = ServerConfig::new("c", "db.example.com", 5433)
            .with_credentials("admin", "x")
            .with_database("prod");
        assert_eq!(
            DialectTag::Postgres.dialect().build_url(&pg_alt),
            "postgres://admin@db.example.com:5433/prod"
        );
    }

    #[test]
    fn test_value_console_rendering() {
        assert_eq!(Value::Null.console(), "::");
        assert_eq!(Value::Bool(true).console(), "1b");
        assert_eq!(Value::Long(42).console(), "42");
        assert_eq!(Value::Symbol("trade".into()).console(), "`trade");
        assert_eq!(
            Value::List(vec![Value::Long(1), Value::Long(2)]).console(),
            "1\n2"
        );
    }

    #[test]
    fn test_value_into_cursor() {
        let table = Cursor::new(vec!["a".into()], vec![vec!["1".into()]]);
        assert_eq!(Value::Table(table.clone()).into_cursor(), table);

        let scalar = Value::Long(7).into_cursor();
        assert_eq!(scalar.columns, vec!["value"]);
        assert_eq!(scalar.rows, vec![vec!["7".to_string()]]);

        assert_eq!(Value::Null.into_cursor(), Cursor::default());
    }

    #[test]
    fn test_registry_lookup() {
        struct NullDriver;

        #[async_trait]
        impl Driver for NullDriver {
            fn dialect(&self) -> DialectTag {
                DialectTag::Sqlite
            }

            async fn connect(&self, _server: &ServerConfig) -> Result<Arc<dyn Connection>> {
                Err(QdeskError::Connectivity("not implemented".into()))
            }
        }

        let registry = DriverRegistry::new();
        assert!(registry.driver_for(DialectTag::Sqlite).is_err());
        registry.register(Arc::new(NullDriver));
        assert!(registry.driver_for(DialectTag::Sqlite).is_ok());
        assert!(registry.driver_for(DialectTag::Kq).is_err());
    }
}
