//! `dbsr` is a library for batched search/replace across the tables of a database.
//!
//! It provides the core logic for the `dbsr` command-line tool but can also be used
//! as a standalone library. The main components are:
//!
//! - `orchestrator`: `SearchReplaceBuilder` collects the configuration and builds
//!   an immutable `SearchReplace` job, which walks each table in bounded batches.
//! - `gateway`: the `Gateway` trait with a MySQL adapter (`sqlx`) and an
//!   in-memory adapter.
//! - `selection` and `range`: which tables to touch and which slice of them.
//! - `substitution`: literal and regex rewriting of a single cell.
//! - `report`: per-table counts and text/JSON/CSV rendering.
//! - `config`: YAML job files.
//!
//! ```no_run
//! use dbsr::gateway::ConnectionParams;
//! use dbsr::SearchReplace;
//!
//! # async fn demo() -> dbsr::Result<()> {
//! let mut builder = SearchReplace::builder();
//! builder
//!     .search("http://old.example", false)
//!     .replace("https://new.example", false)
//!     .bind_connection(&ConnectionParams::new("localhost", "wp", "secret", "wordpress"))?
//!     .include_all_tables(true)
//!     .exclude_tables(["wp_users"], false);
//! let report = builder.build()?.execute().await?;
//! println!("{} rows changed", report.total_changed());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod orchestrator;
pub mod range;
pub mod report;
pub mod selection;
pub mod substitution;

// Re-export main types for easier access by library users.
pub use errors::{Error, Result};
pub use gateway::{ConnectionParams, Gateway, MemoryGateway, MySqlGateway};
pub use orchestrator::{ErrorMode, RunObserver, SearchReplace, SearchReplaceBuilder};
pub use report::{ExecutionReport, ReportFormat, ReportFormatter, RunStatus};
pub use selection::TableSelection;
