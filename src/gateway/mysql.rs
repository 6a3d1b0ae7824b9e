use super::{Cell, Changes, ConnectionParams, Gateway, Row, RowKey, Value};
use crate::errors::{Error, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// MySQL has no "no limit" keyword; this is the documented stand-in.
const UNBOUNDED_LIMIT: u64 = u64::MAX;

const TEXT_TYPES: &[&str] = &[
    "char", "varchar", "tinytext", "text", "mediumtext", "longtext", "enum", "set", "json",
];

/// One row of `information_schema.COLUMNS`, as far as the gateway cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub column_key: String,
    pub nullable: bool,
}

/// The columns of one table that the gateway reads and addresses rows by.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableLayout {
    /// Identity columns, never rewritten: the primary key, or else the first
    /// NOT NULL single-column unique key. Empty when the table has neither.
    pub key: Vec<String>,
    /// Textual, non-key columns that substitution may rewrite.
    pub text_columns: Vec<String>,
}

impl TableLayout {
    /// Builds a layout from the table's columns in ordinal order.
    pub fn from_columns(columns: &[ColumnInfo]) -> Self {
        let mut key: Vec<String> = columns
            .iter()
            .filter(|c| c.column_key.eq_ignore_ascii_case("PRI"))
            .map(|c| c.name.clone())
            .collect();
        if key.is_empty() {
            key.extend(
                columns
                    .iter()
                    .find(|c| c.column_key.eq_ignore_ascii_case("UNI") && !c.nullable)
                    .map(|c| c.name.clone()),
            );
        }

        let text_columns = columns
            .iter()
            .filter(|c| !key.contains(&c.name))
            .filter(|c| TEXT_TYPES.contains(&c.data_type.to_ascii_lowercase().as_str()))
            .map(|c| c.name.clone())
            .collect();

        TableLayout { key, text_columns }
    }

    /// Columns the pages are sorted by. Empty for key-less tables, which are
    /// read in storage order since every other column may be rewritten.
    pub fn order_columns(&self) -> &[String] {
        &self.key
    }

    /// The columns used to find a row again on write-back.
    pub fn match_columns(&self) -> &[String] {
        if self.key.is_empty() {
            &self.text_columns
        } else {
            &self.key
        }
    }
}

/// Gateway over a MySQL (or MariaDB) server, backed by an `sqlx` pool.
pub struct MySqlGateway {
    pool: MySqlPool,
    layouts: Mutex<HashMap<String, Arc<TableLayout>>>,
}

impl MySqlGateway {
    /// Wraps an already-open pool. No credential checks are made.
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self {
            pool,
            layouts: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a gateway whose pool connects on first use.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect_lazy(params: &ConnectionParams) -> Result<Self> {
        params.validate()?;
        let pool = pool_options().connect_lazy_with(connect_options(params));
        Ok(Self::from_pool(pool))
    }

    /// Builds a gateway and opens a first connection to prove the server is reachable.
    pub async fn connect(params: &ConnectionParams) -> Result<Self> {
        params.validate()?;
        let pool = pool_options()
            .connect_with(connect_options(params))
            .await
            .map_err(|e| {
                Error::Connection(format!(
                    "failed to connect to MySQL at {}:{}: {e}",
                    params.host, params.port
                ))
            })?;
        Ok(Self::from_pool(pool))
    }

    /// The underlying pool, for callers that need to issue their own queries.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Closes the pool. In-flight and later calls fail with `ConnectionError`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn layout(&self, table: &str) -> Result<Arc<TableLayout>> {
        if let Some(layout) = self.cached_layout(table) {
            return Ok(layout);
        }

        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT CAST(COLUMN_NAME AS CHAR), CAST(DATA_TYPE AS CHAR), \
             CAST(COLUMN_KEY AS CHAR), CAST(IS_NULLABLE AS CHAR) \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, |m| Error::query(table, m)))?;

        if rows.is_empty() {
            return Err(Error::query(table, "table doesn't exist"));
        }
        let columns: Vec<ColumnInfo> = rows
            .into_iter()
            .map(|(name, data_type, column_key, nullable)| ColumnInfo {
                name,
                data_type,
                column_key,
                nullable: nullable.eq_ignore_ascii_case("YES"),
            })
            .collect();

        let layout = Arc::new(TableLayout::from_columns(&columns));
        debug!(
            table,
            key = ?layout.key,
            text_columns = layout.text_columns.len(),
            "Discovered table layout"
        );
        self.layouts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.to_string(), Arc::clone(&layout));
        Ok(layout)
    }

    fn cached_layout(&self, table: &str) -> Option<Arc<TableLayout>> {
        self.layouts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .cloned()
    }
}

#[async_trait]
impl Gateway for MySqlGateway {
    fn backend(&self) -> &str {
        "mysql"
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT CAST(TABLE_NAME AS CHAR) FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
             ORDER BY TABLE_NAME",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            classify(e, |m| Error::Query {
                table: None,
                message: m,
            })
        })?;

        Ok(tables.into_iter().map(|(name,)| name).collect())
    }

    async fn fetch_rows(&self, table: &str, offset: u64, limit: Option<u64>) -> Result<Vec<Row>> {
        let layout = self.layout(table).await?;
        let sql = select_sql(table, &layout, offset, limit);

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(e, |m| Error::query(table, m)))?;

        rows.iter()
            .map(|row| decode_row(row, &layout).map_err(|e| classify(e, |m| Error::query(table, m))))
            .collect()
    }

    async fn write_row(&self, table: &str, key: &RowKey, changes: &Changes) -> Result<()> {
        let write_error = |message: String| Error::Write {
            table: table.to_string(),
            key: key.to_string(),
            message,
        };

        if key.is_empty() {
            return Err(write_error("row has no addressable key".to_string()));
        }

        let sql = update_sql(table, changes, key);
        let mut query = sqlx::query(&sql);
        for value in changes.values() {
            query = query.bind(value.as_str());
        }
        for (_, value) in key.parts() {
            query = query.bind(bind_value(value));
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, write_error))?;

        if result.rows_affected() == 0 {
            return Err(write_error("no row matched key".to_string()));
        }
        Ok(())
    }
}

fn pool_options() -> MySqlPoolOptions {
    MySqlPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(30))
}

fn connect_options(params: &ConnectionParams) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .username(&params.username)
        .password(&params.password)
        .database(&params.database)
}

/// Sorts `sqlx` failures into connection-level (fatal) and operation-level errors.
fn classify(err: sqlx::Error, operation: impl FnOnce(String) -> Error) -> Error {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::Configuration(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::Connection(err.to_string()),
        other => operation(other.to_string()),
    }
}

/// Quotes an identifier with backticks, doubling any embedded backtick.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Builds the paged `SELECT` for one batch.
///
/// Every column is read through `CAST(… AS CHAR)` under a positional alias
/// (`k0`, `k1`, … for key columns, `t0`, `t1`, … for text columns), so any key
/// type round-trips through `RowKey` and JSON, ENUM and SET values decode as
/// text. `ORDER BY` names the qualified base columns so the sort runs on the
/// original types and can use the key's index.
pub fn select_sql(table: &str, layout: &TableLayout, offset: u64, limit: Option<u64>) -> String {
    let mut select: Vec<String> = layout
        .key
        .iter()
        .enumerate()
        .map(|(i, c)| format!("CAST({} AS CHAR) AS {}", quote_ident(c), key_alias(i)))
        .collect();
    select.extend(
        layout
            .text_columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("CAST({} AS CHAR) AS {}", quote_ident(c), text_alias(i))),
    );

    let mut sql = if select.is_empty() {
        format!("SELECT 1 FROM {}", quote_ident(table))
    } else {
        format!("SELECT {} FROM {}", select.join(", "), quote_ident(table))
    };

    let order: Vec<String> = layout
        .order_columns()
        .iter()
        .map(|c| format!("{}.{}", quote_ident(table), quote_ident(c)))
        .collect();
    if !order.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }

    sql.push_str(&format!(
        " LIMIT {} OFFSET {}",
        limit.unwrap_or(UNBOUNDED_LIMIT),
        offset
    ));
    sql
}

fn key_alias(index: usize) -> String {
    format!("`k{index}`")
}

fn text_alias(index: usize) -> String {
    format!("`t{index}`")
}

/// Builds the single-row `UPDATE` for a write-back.
///
/// Placeholders are the changed values in column order followed by the key values.
pub fn update_sql(table: &str, changes: &Changes, key: &RowKey) -> String {
    let set: Vec<String> = changes
        .keys()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect();
    let filter: Vec<String> = key
        .parts()
        .iter()
        .map(|(c, _)| format!("{} <=> ?", quote_ident(c)))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {} LIMIT 1",
        quote_ident(table),
        set.join(", "),
        filter.join(" AND ")
    )
}

fn bind_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Float(x) => Some(x.to_string()),
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}

fn decode_row(row: &MySqlRow, layout: &TableLayout) -> std::result::Result<Row, sqlx::Error> {
    let mut key = Vec::with_capacity(layout.key.len());
    for (i, column) in layout.key.iter().enumerate() {
        let value: Option<String> = row.try_get(format!("k{i}").as_str())?;
        key.push((column.clone(), Value::from(value)));
    }

    let mut cells = Vec::with_capacity(layout.text_columns.len());
    for (i, column) in layout.text_columns.iter().enumerate() {
        let value: Option<String> = row.try_get(format!("t{i}").as_str())?;
        cells.push(Cell::new(column.clone(), value));
    }

    if key.is_empty() {
        key = cells
            .iter()
            .filter(|c| layout.match_columns().contains(&c.column))
            .map(|c| (c.column.clone(), c.value.clone()))
            .collect();
    }

    Ok(Row::new(RowKey::new(key), cells))
}
