//! The database gateway: a capability trait over a physical store.
//!
//! A `Gateway` enumerates tables, reads bounded pages of rows and writes single
//! rows back. One adapter exists per backend: `MySqlGateway` talks to a live
//! server through `sqlx`, `MemoryGateway` keeps everything in process.

pub mod memory;
pub mod mysql;

use crate::errors::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use memory::MemoryGateway;
pub use mysql::MySqlGateway;

/// The default MySQL port used when none is configured.
pub const DEFAULT_PORT: u16 = 3306;

/// A single cell value as read from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<Option<String>> for Value {
    fn from(s: Option<String>) -> Self {
        s.map(Value::Text).unwrap_or(Value::Null)
    }
}

/// The column/value pairs that identify a row for a write-back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowKey(pub Vec<(String, Value)>);

impl RowKey {
    pub fn new(parts: Vec<(String, Value)>) -> Self {
        Self(parts)
    }

    /// Key made of a single column.
    pub fn single(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self(vec![(column.into(), value.into())])
    }

    pub fn parts(&self) -> &[(String, Value)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(c, v)| format!("{c}={v}")).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// One named cell of a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub column: String,
    pub value: Value,
}

impl Cell {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// A row as returned by `Gateway::fetch_rows`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: RowKey,
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn new(key: RowKey, cells: Vec<Cell>) -> Self {
        Self { key, cells }
    }

    /// Looks up a cell value by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells
            .iter()
            .find(|c| c.column == column)
            .map(|c| &c.value)
    }
}

/// Column name to new textual value, as passed to `Gateway::write_row`.
pub type Changes = BTreeMap<String, String>;

/// Capability interface over a physical store.
///
/// Implementations must return tables in a deterministic order and rows in a
/// stable order so that offsets stay meaningful across batches and runs.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// A short name for the backend, used in logs.
    fn backend(&self) -> &str;

    /// Lists every table visible through this gateway.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Reads up to `limit` rows of `table` starting at `offset`.
    ///
    /// `limit = None` reads to the end of the table. An offset past the end
    /// yields an empty vector rather than an error.
    async fn fetch_rows(&self, table: &str, offset: u64, limit: Option<u64>) -> Result<Vec<Row>>;

    /// Writes the changed columns of one row back.
    async fn write_row(&self, table: &str, key: &RowKey, changes: &Changes) -> Result<()>;
}

/// Credentials and address used to open a backend connection.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .finish()
    }
}

impl ConnectionParams {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: password.into(),
            database: database.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Checks the fields a connection cannot do without. Empty passwords are allowed.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Configuration(
                "database host cannot be empty".to_string(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(Error::Configuration(
                "database username cannot be empty".to_string(),
            ));
        }
        if self.database.trim().is_empty() {
            return Err(Error::Configuration(
                "database name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_validation() {
        assert!(ConnectionParams::new("localhost", "root", "", "wp").validate().is_ok());

        let err = ConnectionParams::new("", "root", "pw", "wp").validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = ConnectionParams::new("localhost", "", "pw", "wp").validate().unwrap_err();
        assert!(err.to_string().contains("username"));

        let err = ConnectionParams::new("localhost", "root", "pw", " ").validate().unwrap_err();
        assert!(err.to_string().contains("database name"));
    }

    #[test]
    fn test_params_debug_hides_password() {
        let params = ConnectionParams::new("db", "app", "hunter2", "shop");
        let rendered = format!("{params:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("shop"));
    }

    #[test]
    fn test_row_key_display() {
        let key = RowKey::new(vec![
            ("id".into(), Value::Integer(7)),
            ("lang".into(), Value::Text("en".into())),
        ]);
        assert_eq!(key.to_string(), "id=7, lang=\"en\"");
    }
}
