use thiserror::Error;

/// The primary error type for all operations in `dbsr`.
///
/// Configuration problems are caught before any I/O. Connection and query
/// failures are fatal to a run, while write failures are scoped to a single
/// row and only counted.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing setup, detected before the gateway is contacted.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The gateway cannot reach its backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A read against the backend failed.
    #[error("Query failed{}: {message}", table_suffix(.table))]
    Query {
        table: Option<String>,
        message: String,
    },

    /// Writing one row back failed.
    #[error("Write failed for {table} [{key}]: {message}")]
    Write {
        table: String,
        key: String,
        message: String,
    },

    /// A run ended in the `Failed` state.
    #[error("Execution failed: {message}")]
    Execution { message: String },

    /// An error that occurred during regex compilation.
    #[error("Pattern compilation failed: {0}")]
    Regex(#[from] regex::Error),

    /// An error that occurred while parsing a YAML job file.
    #[error("Config parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An error related to file system I/O.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error related to persisting a temporary file.
    #[error("Tempfile error: {0}")]
    TempFile(#[from] tempfile::PersistError),

    /// An error related to CSV serialization.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// An error related to JSON serialization.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A convenient type alias for `Result<T, dbsr::errors::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Builds a `Query` error scoped to a table.
    pub fn query(table: impl Into<String>, message: impl ToString) -> Self {
        Error::Query {
            table: Some(table.into()),
            message: message.to_string(),
        }
    }

    /// Returns `true` for errors that abort a whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Query { .. })
    }
}

fn table_suffix(table: &Option<String>) -> String {
    match table {
        Some(t) => format!(" on {t}"),
        None => String::new(),
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Configuration(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Configuration(s.to_string())
    }
}
