use super::{Changes, Gateway, Row, RowKey, Value};
use crate::errors::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

/// A single `fetch_rows` call as seen by the memory backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub table: String,
    pub offset: u64,
    pub limit: Option<u64>,
}

/// A single successful `write_row` call.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub table: String,
    pub key: RowKey,
    pub changes: Changes,
}

#[derive(Default)]
struct Inner {
    tables: Vec<(String, Vec<Row>)>,
    fetches: Vec<FetchRequest>,
    writes: Vec<WriteRecord>,
    failing_writes: Vec<(String, RowKey)>,
    failing_tables: HashSet<String>,
    fetches_before_disconnect: Option<usize>,
    disconnected: bool,
}

/// An in-process backend holding ordered tables of rows.
///
/// Tables are listed in insertion order and rows are served in insertion
/// order, which makes offsets deterministic. Every fetch and write is logged,
/// and individual failures can be injected to exercise error paths.
#[derive(Default)]
pub struct MemoryGateway {
    inner: Mutex<Inner>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a table and returns the gateway for chaining.
    pub fn with_table(self, name: impl Into<String>, rows: Vec<Row>) -> Self {
        self.insert_table(name, rows);
        self
    }

    pub fn insert_table(&self, name: impl Into<String>, rows: Vec<Row>) {
        let name = name.into();
        let mut inner = self.lock();
        match inner.tables.iter_mut().find(|(t, _)| *t == name) {
            Some((_, existing)) => *existing = rows,
            None => inner.tables.push((name, rows)),
        }
    }

    /// Current contents of a table.
    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        self.lock()
            .tables
            .iter()
            .find(|(t, _)| t == table)
            .map(|(_, rows)| rows.clone())
    }

    /// Every `fetch_rows` request received so far, in order.
    pub fn fetch_log(&self) -> Vec<FetchRequest> {
        self.lock().fetches.clone()
    }

    /// Every successful write so far, in order.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    /// Restores a dropped connection and cancels any pending `disconnect_after_fetches`.
    pub fn reconnect(&self) {
        let mut inner = self.lock();
        inner.disconnected = false;
        inner.fetches_before_disconnect = None;
    }

    /// Makes the write of one specific row fail with a `WriteError`.
    pub fn fail_write(&self, table: impl Into<String>, key: RowKey) {
        self.lock().failing_writes.push((table.into(), key));
    }

    /// Makes every fetch of `table` fail with a `QueryError`.
    pub fn fail_fetches(&self, table: impl Into<String>) {
        self.lock().failing_tables.insert(table.into());
    }

    /// Drops the connection after `n` more successful fetches.
    pub fn disconnect_after_fetches(&self, n: usize) {
        self.lock().fetches_before_disconnect = Some(n);
    }

    /// Drops the connection now. Every later call fails with `ConnectionError`.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn check_connected(&self) -> Result<()> {
        if self.disconnected {
            return Err(Error::Connection("memory gateway disconnected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let inner = self.lock();
        inner.check_connected()?;
        Ok(inner.tables.iter().map(|(t, _)| t.clone()).collect())
    }

    async fn fetch_rows(&self, table: &str, offset: u64, limit: Option<u64>) -> Result<Vec<Row>> {
        let mut inner = self.lock();
        inner.check_connected()?;

        if let Some(remaining) = inner.fetches_before_disconnect {
            if remaining == 0 {
                inner.disconnected = true;
                return Err(Error::Connection("memory gateway disconnected".to_string()));
            }
            inner.fetches_before_disconnect = Some(remaining - 1);
        }

        inner.fetches.push(FetchRequest {
            table: table.to_string(),
            offset,
            limit,
        });

        if inner.failing_tables.contains(table) {
            return Err(Error::query(table, "injected fetch failure"));
        }

        let rows = inner
            .tables
            .iter()
            .find(|(t, _)| t == table)
            .map(|(_, rows)| rows)
            .ok_or_else(|| Error::query(table, "table doesn't exist"))?;

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(rows.len());
        let end = match limit {
            Some(l) => start.saturating_add(usize::try_from(l).unwrap_or(usize::MAX)).min(rows.len()),
            None => rows.len(),
        };
        Ok(rows[start..end].to_vec())
    }

    async fn write_row(&self, table: &str, key: &RowKey, changes: &Changes) -> Result<()> {
        let mut inner = self.lock();
        inner.check_connected()?;

        let write_error = |message: &str| Error::Write {
            table: table.to_string(),
            key: key.to_string(),
            message: message.to_string(),
        };

        if inner
            .failing_writes
            .iter()
            .any(|(t, k)| t == table && k == key)
        {
            return Err(write_error("injected write failure"));
        }

        let row = inner
            .tables
            .iter_mut()
            .find(|(t, _)| t == table)
            .and_then(|(_, rows)| rows.iter_mut().find(|r| &r.key == key))
            .ok_or_else(|| write_error("no row matched key"))?;

        for (column, value) in changes {
            match row.cells.iter_mut().find(|c| &c.column == column) {
                Some(cell) => cell.value = Value::Text(value.clone()),
                None => return Err(write_error(&format!("unknown column {column}"))),
            }
        }

        inner.writes.push(WriteRecord {
            table: table.to_string(),
            key: key.clone(),
            changes: changes.clone(),
        });
        Ok(())
    }
}
