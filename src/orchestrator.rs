//! The search/replace orchestrator.
//!
//! `SearchReplaceBuilder` is the configuration surface: search and replace
//! specs, the gateway binding, table selection, table and row ranges, batch
//! size. `build()` validates it and produces a `SearchReplace` job, which is
//! immutable and can be executed any number of times (one run at a time).
//!
//! A run resolves the table worklist, then walks each table in bounded
//! batches, rewriting textual cells through the configured `Substitution` and
//! writing back only rows that changed.

use crate::errors::{Error, Result};
use crate::gateway::{Changes, ConnectionParams, Gateway, MySqlGateway, Row, Value};
use crate::range::{self, BatchPlan, DEFAULT_BATCH_SIZE, Range};
use crate::report::{ExecutionReport, ResumePoint, RunStatus, TableReport};
use crate::selection::TableSelection;
use crate::substitution::{self, ReplaceSpec, SearchSpec, Substitution};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// How configuration errors reach the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorMode {
    /// A failed setter returns `Err`.
    #[default]
    Raise,
    /// A failed setter returns `Ok`, logs the message and keeps the prior value.
    Collect,
}

/// Errors gathered during validation and execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    pub errors: Vec<String>,
    pub validated: bool,
}

/// Every tunable of a job besides the search/replace pair and the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSettings {
    pub selection: TableSelection,
    pub table_range: Range,
    pub row_range: Range,
    pub batch_size: usize,
    pub table_concurrency: usize,
    pub dry_run: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            selection: TableSelection::default(),
            table_range: Range::default(),
            row_range: Range::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            table_concurrency: 1,
            dry_run: false,
        }
    }
}

/// Hooks for following a run as it progresses. All methods default to no-ops.
pub trait RunObserver: Send + Sync {
    fn run_started(&self, _tables: &[String]) {}
    fn table_started(&self, _table: &str) {}
    fn batch_processed(&self, _table: &str, _rows: usize) {}
    fn table_finished(&self, _report: &TableReport) {}
}

struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Fluent configuration for a `SearchReplace` job.
#[derive(Clone)]
pub struct SearchReplaceBuilder {
    search: Option<SearchSpec>,
    replace: Option<ReplaceSpec>,
    gateway: Option<Arc<dyn Gateway>>,
    substitution: Option<Arc<dyn Substitution>>,
    settings: JobSettings,
    error_mode: ErrorMode,
    /// Collect-mode rejections still outstanding, by setting.
    rejected: BTreeMap<&'static str, String>,
    state: ExecutionState,
}

impl Default for SearchReplaceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchReplaceBuilder {
    pub fn new() -> Self {
        Self {
            search: None,
            replace: None,
            gateway: None,
            substitution: None,
            settings: JobSettings::default(),
            error_mode: ErrorMode::default(),
            rejected: BTreeMap::new(),
            state: ExecutionState::default(),
        }
    }

    pub fn search(&mut self, term: impl Into<String>, is_pattern: bool) -> &mut Self {
        self.search = Some(SearchSpec::new(term, is_pattern));
        self
    }

    pub fn replace(&mut self, term: impl Into<String>, is_pattern: bool) -> &mut Self {
        self.replace = Some(ReplaceSpec::new(term, is_pattern));
        self
    }

    /// Binds an already-constructed gateway, replacing any previous one.
    pub fn bind_gateway(&mut self, gateway: Arc<dyn Gateway>) -> &mut Self {
        self.gateway = Some(gateway);
        self.rejected.remove("connection");
        self
    }

    /// Builds a MySQL gateway from discrete connection parameters.
    ///
    /// The pool connects lazily, so this performs no network I/O. It must be
    /// called from within a tokio runtime.
    pub fn bind_connection(&mut self, params: &ConnectionParams) -> Result<&mut Self> {
        let outcome = MySqlGateway::connect_lazy(params);
        self.settle(&["connection"], outcome, |b, gateway| {
            let gateway: Arc<dyn Gateway> = Arc::new(gateway);
            b.gateway = Some(gateway);
        })
    }

    pub fn include_all_tables(&mut self, flag: bool) -> &mut Self {
        self.settings.selection.set_include_all(flag);
        self
    }

    pub fn include_tables<I, S>(&mut self, names: I, overwrite: bool) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.selection.include(names, overwrite);
        self
    }

    pub fn exclude_tables<I, S>(&mut self, names: I, overwrite: bool) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.selection.exclude(names, overwrite);
        self
    }

    /// Clears the include and exclude lists; `include_all` is kept.
    pub fn reset_table_selection(&mut self) -> &mut Self {
        self.settings.selection.reset();
        self
    }

    pub fn table_range(&mut self, offset: i64, limit: Option<i64>) -> Result<&mut Self> {
        let outcome = Range::from_signed("table", offset, limit);
        self.settle(&["table range", "table offset", "table limit"], outcome, |b, r| {
            b.settings.table_range = r
        })
    }

    pub fn table_offset(&mut self, offset: i64) -> Result<&mut Self> {
        let outcome = range::non_negative("table offset", offset);
        self.settle(&["table offset"], outcome, |b, o| {
            b.settings.table_range.offset = o
        })
    }

    pub fn table_limit(&mut self, limit: Option<i64>) -> Result<&mut Self> {
        let outcome = limit
            .map(|l| range::non_negative("table limit", l))
            .transpose();
        self.settle(&["table limit"], outcome, |b, l| {
            b.settings.table_range.limit = l
        })
    }

    pub fn row_range(&mut self, offset: i64, limit: Option<i64>) -> Result<&mut Self> {
        let outcome = Range::from_signed("row", offset, limit);
        self.settle(&["row range", "row offset", "row limit"], outcome, |b, r| {
            b.settings.row_range = r
        })
    }

    pub fn row_offset(&mut self, offset: i64) -> Result<&mut Self> {
        let outcome = range::non_negative("row offset", offset);
        self.settle(&["row offset"], outcome, |b, o| {
            b.settings.row_range.offset = o
        })
    }

    pub fn row_limit(&mut self, limit: Option<i64>) -> Result<&mut Self> {
        let outcome = limit
            .map(|l| range::non_negative("row limit", l))
            .transpose();
        self.settle(&["row limit"], outcome, |b, l| {
            b.settings.row_range.limit = l
        })
    }

    pub fn batch_size(&mut self, size: i64) -> Result<&mut Self> {
        let outcome = range::positive_batch_size(size);
        self.settle(&["batch size"], outcome, |b, s| b.settings.batch_size = s)
    }

    /// How many tables may be processed at once. Rows within a table are always sequential.
    pub fn table_concurrency(&mut self, workers: usize) -> Result<&mut Self> {
        let outcome = if workers == 0 {
            Err(Error::Configuration("table concurrency must be at least 1".to_string()))
        } else {
            Ok(workers)
        };
        self.settle(&["table concurrency"], outcome, |b, w| {
            b.settings.table_concurrency = w
        })
    }

    pub fn dry_run(&mut self, flag: bool) -> &mut Self {
        self.settings.dry_run = flag;
        self
    }

    pub fn error_mode(&mut self, mode: ErrorMode) -> &mut Self {
        self.error_mode = mode;
        self
    }

    /// Uses a custom strategy instead of the one compiled from the search/replace specs.
    pub fn substitution(&mut self, strategy: Arc<dyn Substitution>) -> &mut Self {
        self.substitution = Some(strategy);
        self
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn search_spec(&self) -> Option<&SearchSpec> {
        self.search.as_ref()
    }

    pub fn replace_spec(&self) -> Option<&ReplaceSpec> {
        self.replace.as_ref()
    }

    pub fn gateway(&self) -> Option<&Arc<dyn Gateway>> {
        self.gateway.as_ref()
    }

    pub fn errors(&self) -> &[String] {
        &self.state.errors
    }

    pub fn is_validated(&self) -> bool {
        self.state.validated
    }

    /// Resolves the selection against the bound gateway (table range not applied).
    pub async fn resolved_tables(&self) -> Result<Vec<String>> {
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            Error::Configuration("cannot resolve tables: no database gateway bound".to_string())
        })?;
        resolve(gateway.as_ref(), &self.settings.selection).await
    }

    /// Checks prerequisites without contacting the gateway.
    ///
    /// Returns the problems found by this call (empty when the builder is
    /// ready) and appends new ones to the error log.
    pub fn validate(&mut self) -> Vec<String> {
        let mut problems: Vec<String> = self.rejected.values().cloned().collect();
        let mut fresh = Vec::new();

        if self.gateway.is_none() {
            fresh.push("database gateway not provided".to_string());
        }
        if !self.settings.selection.has_candidates() {
            fresh.push("no tables selected: include all tables or name some".to_string());
        }

        for message in fresh {
            self.log_once(&message);
            problems.push(message);
        }
        self.state.validated = problems.is_empty();
        problems
    }

    /// Clears the table selection lists, both ranges and the error log.
    ///
    /// Search/replace specs, the gateway, `include_all`, batch size and the
    /// other run options are kept.
    pub fn reset(&mut self) -> &mut Self {
        self.settings.selection.reset();
        self.settings.table_range = Range::default();
        self.settings.row_range = Range::default();
        self.rejected.clear();
        self.state = ExecutionState::default();
        self
    }

    /// Validates the configuration and produces an executable job.
    ///
    /// Any validation problem fails with `Error::Configuration`, in either
    /// error mode, so nothing runs against a half-configured job.
    pub fn build(&mut self) -> Result<SearchReplace> {
        let problems = self.validate();
        if !problems.is_empty() {
            return Err(Error::Configuration(problems.join("; ")));
        }

        let gateway = self
            .gateway
            .clone()
            .ok_or_else(|| Error::Configuration("database gateway not provided".to_string()))?;

        let substitution = match &self.substitution {
            Some(strategy) => Arc::clone(strategy),
            None => {
                let search = self
                    .search
                    .as_ref()
                    .ok_or_else(|| Error::Configuration("search term not set".to_string()))?;
                let replace = self
                    .replace
                    .as_ref()
                    .ok_or_else(|| Error::Configuration("replace term not set".to_string()))?;
                substitution::compile(search, replace)?
            }
        };

        Ok(SearchReplace {
            search: self.search.clone(),
            replace: self.replace.clone(),
            gateway,
            substitution,
            settings: self.settings.clone(),
            errors: Mutex::new(self.state.errors.clone()),
            running: AtomicBool::new(false),
        })
    }

    /// Applies a setter outcome according to the error mode.
    ///
    /// `settings[0]` names the setting a rejection is recorded under; a
    /// successful call clears outstanding rejections for every listed setting.
    fn settle<T>(
        &mut self,
        settings: &[&'static str],
        outcome: Result<T>,
        assign: impl FnOnce(&mut Self, T),
    ) -> Result<&mut Self> {
        match outcome {
            Ok(value) => {
                assign(self, value);
                for setting in settings {
                    self.rejected.remove(setting);
                }
                Ok(self)
            }
            Err(err) => match self.error_mode {
                ErrorMode::Raise => Err(err),
                ErrorMode::Collect => {
                    warn!(error = %err, "Rejected configuration value");
                    let message = err.to_string();
                    self.log_once(&message);
                    self.rejected.insert(settings[0], message);
                    Ok(self)
                }
            },
        }
    }

    fn log_once(&mut self, message: &str) {
        if !self.state.errors.iter().any(|logged| logged == message) {
            self.state.errors.push(message.to_string());
        }
    }
}

/// A validated, immutable search/replace job.
pub struct SearchReplace {
    search: Option<SearchSpec>,
    replace: Option<ReplaceSpec>,
    gateway: Arc<dyn Gateway>,
    substitution: Arc<dyn Substitution>,
    settings: JobSettings,
    errors: Mutex<Vec<String>>,
    running: AtomicBool,
}

/// Result of walking one table.
struct TableOutcome {
    report: TableReport,
    failure: Option<(Error, ResumePoint)>,
}

impl SearchReplace {
    pub fn builder() -> SearchReplaceBuilder {
        SearchReplaceBuilder::new()
    }

    pub fn search_spec(&self) -> Option<&SearchSpec> {
        self.search.as_ref()
    }

    pub fn replace_spec(&self) -> Option<&ReplaceSpec> {
        self.replace.as_ref()
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// The error log: validation messages plus row write failures and fatal errors from runs.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resolves the selection against the gateway (table range not applied).
    pub async fn resolved_tables(&self) -> Result<Vec<String>> {
        resolve(self.gateway.as_ref(), &self.settings.selection).await
    }

    /// The tables a run will process: the resolved list windowed by the table range.
    pub async fn worklist(&self) -> Result<Vec<String>> {
        let resolved = self.resolved_tables().await?;
        Ok(self.settings.table_range.apply(&resolved).to_vec())
    }

    pub async fn execute(&self) -> Result<ExecutionReport> {
        self.execute_with(&NoopObserver).await
    }

    /// Runs the job, reporting progress to `observer`.
    ///
    /// Returns `Err` only when the job is already running. Gateway failures
    /// end the run with a `Failed` report; use `into_result()` to turn that
    /// into an error.
    pub async fn execute_with(&self, observer: &dyn RunObserver) -> Result<ExecutionReport> {
        let _guard = RunGuard::acquire(&self.running)?;
        let started_at = Utc::now();

        info!(
            backend = self.gateway.backend(),
            substitution = %self.substitution.describe(),
            batch_size = self.settings.batch_size,
            dry_run = self.settings.dry_run,
            "Starting search/replace run"
        );

        let worklist = match self.worklist().await {
            Ok(tables) => tables,
            Err(err) => {
                error!(error = %err, "Failed to resolve tables");
                self.record(err.to_string());
                return Ok(self.finish(started_at, Vec::new(), Some((err, None))));
            }
        };

        if worklist.is_empty() {
            info!("No tables selected; nothing to do");
            return Ok(self.finish(started_at, Vec::new(), None));
        }

        observer.run_started(&worklist);

        let total = worklist.len();
        let pending: Vec<_> = worklist
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, table)| self.process_table(index, total, table, observer))
            .collect();
        let mut outcomes = stream::iter(pending).buffered(self.settings.table_concurrency.max(1));

        let mut tables = Vec::with_capacity(total);
        let mut failure = None;
        while let Some(outcome) = outcomes.next().await {
            observer.table_finished(&outcome.report);
            tables.push(outcome.report);
            if let Some((err, resume)) = outcome.failure {
                failure = Some((err, Some(resume)));
                break;
            }
        }

        Ok(self.finish(started_at, tables, failure))
    }

    async fn process_table(
        &self,
        index: usize,
        total: usize,
        name: String,
        observer: &dyn RunObserver,
    ) -> TableOutcome {
        let table = name.as_str();
        let mut report = TableReport::new(table);
        let mut plan = BatchPlan::new(self.settings.row_range, self.settings.batch_size);

        observer.table_started(table);
        info!(table, "Processing table");

        while let Some(request) = plan.next_request() {
            let mut rows = match self
                .gateway
                .fetch_rows(table, request.offset, Some(request.limit))
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    let resume = self.resume_point(index, total, plan.position());
                    return self.abort(report, err, resume);
                }
            };
            rows.truncate(usize::try_from(request.limit).unwrap_or(usize::MAX));
            debug!(
                table,
                offset = request.offset,
                limit = request.limit,
                rows = rows.len(),
                "Fetched batch"
            );

            for (position, row) in rows.iter().enumerate() {
                report.scanned += 1;
                let Some(changes) = self.changes_for(row) else {
                    continue;
                };

                if self.settings.dry_run {
                    report.changed += 1;
                    continue;
                }

                match self.gateway.write_row(table, &row.key, &changes).await {
                    Ok(()) => report.changed += 1,
                    Err(err) if err.is_fatal() => {
                        let row_offset = request.offset + position as u64;
                        let resume = self.resume_point(index, total, row_offset);
                        return self.abort(report, err, resume);
                    }
                    Err(err) => {
                        warn!(table, key = %row.key, error = %err, "Row write failed");
                        report.failed += 1;
                        self.record(err.to_string());
                    }
                }
            }

            plan.advance(rows.len());
            observer.batch_processed(table, rows.len());
        }

        info!(
            table,
            scanned = report.scanned,
            changed = report.changed,
            failed = report.failed,
            "Finished table"
        );
        TableOutcome {
            report,
            failure: None,
        }
    }

    /// The changed textual cells of a row, or `None` when nothing changed.
    fn changes_for(&self, row: &Row) -> Option<Changes> {
        let mut changes = Changes::new();
        for cell in &row.cells {
            if let Value::Text(text) = &cell.value {
                if let Cow::Owned(updated) = self.substitution.apply(text) {
                    if updated != *text {
                        changes.insert(cell.column.clone(), updated);
                    }
                }
            }
        }
        (!changes.is_empty()).then_some(changes)
    }

    fn abort(&self, report: TableReport, err: Error, resume: ResumePoint) -> TableOutcome {
        error!(table = %report.table, error = %err, "Aborting run");
        self.record(err.to_string());
        TableOutcome {
            report,
            failure: Some((err, resume)),
        }
    }

    /// Where to pick up after the `index`-th of `total` worklist tables failed
    /// before `row_offset`.
    ///
    /// The failed table resumes with the remainder of the row window; the
    /// tables after it resume with the original row window.
    fn resume_point(&self, index: usize, total: usize, row_offset: u64) -> ResumePoint {
        let tables = self.settings.table_range;
        let rows = self.settings.row_range;
        let table_offset = tables.offset + index as u64;
        let next = table_offset + 1;
        let remaining_tables = (index + 1 < total).then(|| {
            Range::new(
                next,
                tables.limit.map(|limit| (tables.offset + limit).saturating_sub(next)),
            )
        });
        ResumePoint {
            table_offset,
            row_offset,
            row_limit: rows
                .limit
                .map(|limit| (rows.offset + limit).saturating_sub(row_offset)),
            remaining_tables,
            row_range: rows,
        }
    }

    fn finish(
        &self,
        started_at: DateTime<Utc>,
        tables: Vec<TableReport>,
        failure: Option<(Error, Option<ResumePoint>)>,
    ) -> ExecutionReport {
        let (status, error, resume) = match failure {
            Some((err, resume)) => (RunStatus::Failed, Some(err.to_string()), resume),
            None => (RunStatus::Completed, None, None),
        };
        let report = ExecutionReport {
            status,
            tables,
            error,
            resume,
            dry_run: self.settings.dry_run,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            status = ?report.status,
            tables = report.tables.len(),
            scanned = report.total_scanned(),
            changed = report.total_changed(),
            failed = report.total_failed(),
            "Run finished"
        );
        report
    }

    fn record(&self, message: String) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

async fn resolve(gateway: &dyn Gateway, selection: &TableSelection) -> Result<Vec<String>> {
    let all_tables = if selection.include_all() {
        gateway.list_tables().await?
    } else {
        Vec::new()
    };
    Ok(selection.resolve(&all_tables))
}

/// Marks a job as running for as long as it is alive.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                Error::Configuration("busy: this job is already executing".to_string())
            })?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Cell, MemoryGateway, RowKey};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    const OLD: &str = "http://old.test";
    const NEW: &str = "https://new.test";

    fn rows(bodies: &[&str]) -> Vec<Row> {
        bodies
            .iter()
            .enumerate()
            .map(|(i, body)| {
                Row::new(
                    RowKey::single("id", i as i64 + 1),
                    vec![
                        Cell::new("body", *body),
                        Cell::new("views", Value::Integer(10)),
                    ],
                )
            })
            .collect()
    }

    fn linked(n: usize) -> Vec<Row> {
        let bodies: Vec<String> = (0..n).map(|i| format!("post {i} at {OLD}/p/{i}")).collect();
        let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
        rows(&refs)
    }

    fn site() -> Arc<MemoryGateway> {
        Arc::new(
            MemoryGateway::new()
                .with_table("wp_posts", linked(20))
                .with_table(
                    "wp_users",
                    rows(&["ann", &format!("bob {OLD}"), "cat"]),
                )
                .with_table("wp_options", rows(&[OLD, "siteurl"]))
                .with_table("wp_empty", Vec::new()),
        )
    }

    fn builder_for(gateway: &Arc<MemoryGateway>) -> SearchReplaceBuilder {
        let mut builder = SearchReplace::builder();
        builder
            .search(OLD, false)
            .replace(NEW, false)
            .bind_gateway(gateway.clone());
        builder
    }

    #[tokio::test]
    async fn test_resolution_uses_gateway_order_and_exclusions() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .exclude_tables(["wp_users"], false)
            .include_all_tables(true)
            .include_tables(["wp_users", "archive"], false);

        let tables = builder.resolved_tables().await.unwrap();
        assert_eq!(tables, vec!["wp_posts", "wp_options", "wp_empty", "archive"]);
    }

    #[tokio::test]
    async fn test_resolution_requires_gateway() {
        let mut builder = SearchReplace::builder();
        builder.include_all_tables(true);
        let err = builder.resolved_tables().await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_reset_selection_then_resolve_is_empty() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .include_tables(["wp_posts"], false)
            .exclude_tables(["wp_options"], false)
            .reset_table_selection();
        assert!(builder.resolved_tables().await.unwrap().is_empty());
    }

    #[test]
    fn test_validate_reports_missing_prerequisites() {
        let mut builder = SearchReplace::builder();
        let problems = builder.validate();
        assert_eq!(problems.len(), 2);
        assert!(!builder.is_validated());
        assert_eq!(builder.errors().len(), 2);
    }

    #[test]
    fn test_validate_does_not_contact_gateway() {
        let gw = site();
        gw.disconnect();
        let mut builder = builder_for(&gw);
        builder.include_all_tables(true);
        assert!(builder.validate().is_empty());
        assert!(builder.is_validated());
    }

    #[test]
    fn test_invalid_numbers_leave_configuration_unmodified() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder.batch_size(25).unwrap().table_range(2, Some(3)).unwrap();

        assert!(matches!(builder.batch_size(-1), Err(Error::Configuration(_))));
        assert!(matches!(builder.batch_size(0), Err(Error::Configuration(_))));
        assert!(matches!(builder.table_offset(-4), Err(Error::Configuration(_))));
        assert!(matches!(builder.row_range(0, Some(-1)), Err(Error::Configuration(_))));

        assert_eq!(builder.settings().batch_size, 25);
        assert_eq!(builder.settings().table_range, Range::new(2, Some(3)));
        assert_eq!(builder.settings().row_range, Range::default());
        assert!(builder.errors().is_empty());
    }

    #[test]
    fn test_collect_mode_logs_instead_of_raising() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .error_mode(ErrorMode::Collect)
            .include_all_tables(true)
            .batch_size(-1)
            .unwrap();

        assert_eq!(builder.settings().batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(builder.errors().len(), 1);

        let problems = builder.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("batch size"));
        assert!(matches!(builder.build(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_collect_mode_later_valid_value_clears_rejection() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .error_mode(ErrorMode::Collect)
            .include_all_tables(true)
            .batch_size(-1)
            .unwrap()
            .row_offset(-3)
            .unwrap();
        assert_eq!(builder.validate().len(), 2);

        builder.batch_size(10).unwrap();
        assert_eq!(builder.validate().len(), 1);

        // A whole-range setter supersedes rejected offset/limit setters.
        builder.row_range(3, None).unwrap();
        assert!(builder.validate().is_empty());
        assert_eq!(builder.settings().batch_size, 10);
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_repeated_validate_logs_each_problem_once() {
        let mut builder = SearchReplace::builder();
        builder.error_mode(ErrorMode::Collect).batch_size(0).unwrap();
        assert_eq!(builder.validate().len(), 3);
        assert_eq!(builder.validate().len(), 3);
        assert_eq!(builder.errors().len(), 3);
    }

    #[test]
    fn test_build_requires_search_and_replace() {
        let gw = site();
        let mut builder = SearchReplace::builder();
        builder.bind_gateway(gw.clone()).include_all_tables(true);
        assert!(matches!(builder.build(), Err(Error::Configuration(_))));

        builder.search("(broken", true).replace("x", false);
        assert!(matches!(builder.build(), Err(Error::Regex(_))));
    }

    #[tokio::test]
    async fn test_bind_connection_validates_params() {
        let mut builder = SearchReplace::builder();
        let err = builder
            .bind_connection(&ConnectionParams::new("localhost", "", "", "wp"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(builder.gateway().is_none());

        builder
            .bind_connection(&ConnectionParams::new("localhost", "wp", "", "wp"))
            .unwrap();
        assert_eq!(builder.gateway().unwrap().backend(), "mysql");
    }

    #[tokio::test]
    async fn test_row_range_batches_through_gateway() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .include_tables(["wp_posts"], false)
            .row_range(5, Some(10))
            .unwrap()
            .batch_size(3)
            .unwrap();

        let report = builder.build().unwrap().execute().await.unwrap();

        let requests: Vec<(u64, Option<u64>)> =
            gw.fetch_log().iter().map(|f| (f.offset, f.limit)).collect();
        assert_eq!(
            requests,
            vec![(5, Some(3)), (8, Some(3)), (11, Some(3)), (14, Some(1))]
        );
        assert_eq!(report.table("wp_posts").unwrap().scanned, 10);
        assert_eq!(report.table("wp_posts").unwrap().changed, 10);
    }

    #[tokio::test]
    async fn test_empty_table_completes_without_writes() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder.include_tables(["wp_empty"], false);

        let report = builder.build().unwrap().execute().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.table("wp_empty").unwrap(), &TableReport::new("wp_empty"));
        assert!(gw.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_row_write_failure_is_counted_not_fatal() {
        let gw = site();
        gw.insert_table("users", linked(12));
        gw.fail_write("users", RowKey::single("id", 7));

        let mut builder = builder_for(&gw);
        builder.include_tables(["users"], false).batch_size(5).unwrap();
        let job = builder.build().unwrap();
        let report = job.execute().await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        let users = report.table("users").unwrap();
        assert_eq!((users.scanned, users.changed, users.failed), (12, 11, 1));
        assert_eq!(job.errors().len(), 1);
        assert!(job.errors()[0].contains("id=7"));
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder.include_all_tables(true);
        let job = builder.build().unwrap();

        let first = job.execute().await.unwrap();
        assert_eq!(first.total_changed(), 20 + 1 + 1);
        assert_eq!(first.total_scanned(), 20 + 3 + 2);

        let second = job.execute().await.unwrap();
        assert_eq!(second.total_changed(), 0);
        assert_eq!(second.total_scanned(), first.total_scanned());
    }

    #[tokio::test]
    async fn test_only_changed_text_cells_are_written() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder.include_tables(["wp_users"], false);
        builder.build().unwrap().execute().await.unwrap();

        let writes = gw.write_log();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].key, RowKey::single("id", 2));
        assert_eq!(writes[0].changes.len(), 1);
        assert_eq!(writes[0].changes["body"], format!("bob {NEW}"));
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_writing() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder.include_tables(["wp_options"], false).dry_run(true);

        let report = builder.build().unwrap().execute().await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.total_changed(), 1);
        assert!(gw.write_log().is_empty());
        assert_eq!(
            gw.rows("wp_options").unwrap()[0].get("body"),
            Some(&Value::Text(OLD.to_string()))
        );
    }

    #[tokio::test]
    async fn test_connection_drop_fails_run_with_resume_point() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .include_tables(["wp_options", "wp_posts"], false)
            .batch_size(5)
            .unwrap();
        // wp_options takes one fetch, wp_posts gets two batches before the drop.
        gw.disconnect_after_fetches(3);

        let report = builder.build().unwrap().execute().await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("Connection"));
        assert_eq!(
            report.resume,
            Some(ResumePoint {
                table_offset: 1,
                row_offset: 10,
                row_limit: None,
                remaining_tables: None,
                row_range: Range::default(),
            })
        );
        assert_eq!(report.table("wp_posts").unwrap().scanned, 10);
        // Writes made before the drop stay applied.
        assert_eq!(gw.write_log().len(), 1 + 10);
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_resuming_in_two_steps_finishes_every_table() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder.include_all_tables(true).batch_size(5).unwrap();
        gw.disconnect_after_fetches(3);

        let first = builder.build().unwrap().execute().await.unwrap();
        let resume = first.resume.unwrap();
        assert_eq!(resume.table_offset, 0);
        assert_eq!(resume.row_offset, 15);
        assert_eq!(resume.remaining_tables, Some(Range::new(1, None)));
        gw.reconnect();

        let mut failed_table = builder_for(&gw);
        failed_table
            .include_all_tables(true)
            .batch_size(5)
            .unwrap()
            .table_range(resume.table_offset as i64, Some(1))
            .unwrap()
            .row_range(resume.row_offset as i64, resume.row_limit.map(|l| l as i64))
            .unwrap();
        let second = failed_table.build().unwrap().execute().await.unwrap();
        assert_eq!(second.total_changed(), 5);

        let rest = resume.remaining_tables.unwrap();
        let mut later_tables = builder_for(&gw);
        later_tables
            .include_all_tables(true)
            .table_range(rest.offset as i64, rest.limit.map(|l| l as i64))
            .unwrap()
            .row_range(resume.row_range.offset as i64, resume.row_range.limit.map(|l| l as i64))
            .unwrap();
        let third = later_tables.build().unwrap().execute().await.unwrap();
        assert_eq!(third.table("wp_users").unwrap().changed, 1);
        assert_eq!(third.table("wp_options").unwrap().changed, 1);

        let total = first.total_changed() + second.total_changed() + third.total_changed();
        assert_eq!(total, 22);

        let mut everything = builder_for(&gw);
        everything.include_all_tables(true);
        let last = everything.build().unwrap().execute().await.unwrap();
        assert_eq!(last.total_scanned(), 25);
        assert_eq!(last.total_changed(), 0);
    }

    #[tokio::test]
    async fn test_resume_point_carries_windows_forward() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .include_all_tables(true)
            .table_range(0, Some(3))
            .unwrap()
            .row_range(2, Some(12))
            .unwrap()
            .batch_size(5)
            .unwrap();
        // wp_posts reads rows 2..7 and 7..12, then the connection drops.
        gw.disconnect_after_fetches(2);

        let report = builder.build().unwrap().execute().await.unwrap();
        assert_eq!(
            report.resume,
            Some(ResumePoint {
                table_offset: 0,
                row_offset: 12,
                row_limit: Some(2),
                remaining_tables: Some(Range::new(1, Some(2))),
                row_range: Range::new(2, Some(12)),
            })
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_stops_later_tables() {
        let gw = site();
        gw.fail_fetches("wp_users");
        let mut builder = builder_for(&gw);
        builder.include_all_tables(true);

        let report = builder.build().unwrap().execute().await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        let names: Vec<&str> = report.tables.iter().map(|t| t.table.as_str()).collect();
        assert_eq!(names, vec!["wp_posts", "wp_users"]);
        assert_eq!(report.table("wp_posts").unwrap().changed, 20);
    }

    #[tokio::test]
    async fn test_listing_failure_fails_before_any_table() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder.include_all_tables(true);
        let job = builder.build().unwrap();
        gw.disconnect();

        let report = job.execute().await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.tables.is_empty());
        assert!(report.resume.is_none());
        assert!(gw.fetch_log().is_empty());
    }

    #[tokio::test]
    async fn test_table_range_windows_worklist() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder.include_all_tables(true).table_range(1, Some(2)).unwrap();
        let job = builder.build().unwrap();

        assert_eq!(job.worklist().await.unwrap(), vec!["wp_users", "wp_options"]);
        let report = job.execute().await.unwrap();
        assert_eq!(report.tables.len(), 2);
        assert_eq!(report.tables[0].table, "wp_users");
    }

    #[tokio::test]
    async fn test_row_range_is_reapplied_per_table() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .include_tables(["wp_users", "wp_posts"], false)
            .row_range(1, Some(1))
            .unwrap();

        builder.build().unwrap().execute().await.unwrap();
        let offsets: Vec<(String, u64)> = gw
            .fetch_log()
            .into_iter()
            .map(|f| (f.table, f.offset))
            .collect();
        assert_eq!(
            offsets,
            vec![("wp_users".to_string(), 1), ("wp_posts".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_empty_worklist_completes() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .include_tables(["wp_posts"], false)
            .exclude_tables(["wp_posts"], false);

        let report = builder.build().unwrap().execute().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.tables.is_empty());
        assert!(gw.fetch_log().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_tables_keep_worklist_order() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .include_all_tables(true)
            .table_concurrency(3)
            .unwrap()
            .batch_size(4)
            .unwrap();

        let report = builder.build().unwrap().execute().await.unwrap();
        let names: Vec<&str> = report.tables.iter().map(|t| t.table.as_str()).collect();
        assert_eq!(names, vec!["wp_posts", "wp_users", "wp_options", "wp_empty"]);
        assert_eq!(report.total_changed(), 22);
    }

    #[tokio::test]
    async fn test_reset_restores_defaults_and_keeps_specs() {
        let gw = site();
        let mut builder = builder_for(&gw);
        builder
            .include_all_tables(true)
            .include_tables(["x"], false)
            .exclude_tables(["y"], false)
            .table_range(3, Some(4))
            .unwrap()
            .row_range(5, Some(6))
            .unwrap()
            .batch_size(7)
            .unwrap();
        builder.validate();
        builder.reset();

        let settings = builder.settings();
        assert!(settings.selection.included().is_empty());
        assert!(settings.selection.excluded().is_empty());
        assert!(settings.selection.include_all());
        assert_eq!(settings.table_range, Range::default());
        assert_eq!(settings.row_range, Range::default());
        assert_eq!(settings.batch_size, 7);
        assert_eq!(builder.search_spec().unwrap().term, OLD);
        assert!(builder.gateway().is_some());
        assert!(builder.errors().is_empty());
        assert!(!builder.is_validated());
    }

    #[tokio::test]
    async fn test_custom_substitution() {
        struct Upper;
        impl Substitution for Upper {
            fn apply<'a>(&self, input: &'a str) -> Cow<'a, str> {
                if input.chars().any(|c| c.is_lowercase()) {
                    Cow::Owned(input.to_uppercase())
                } else {
                    Cow::Borrowed(input)
                }
            }
            fn describe(&self) -> String {
                "uppercase".to_string()
            }
        }

        let gw = site();
        let mut builder = SearchReplace::builder();
        builder
            .bind_gateway(gw.clone())
            .include_tables(["wp_users"], false)
            .substitution(Arc::new(Upper));

        let report = builder.build().unwrap().execute().await.unwrap();
        assert_eq!(report.total_changed(), 3);
        assert_eq!(
            gw.rows("wp_users").unwrap()[0].get("body"),
            Some(&Value::Text("ANN".to_string()))
        );
    }

    struct StallingGateway {
        inner: MemoryGateway,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Gateway for StallingGateway {
        fn backend(&self) -> &str {
            "stalling"
        }

        async fn list_tables(&self) -> Result<Vec<String>> {
            self.inner.list_tables().await
        }

        async fn fetch_rows(&self, table: &str, offset: u64, limit: Option<u64>) -> Result<Vec<Row>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.fetch_rows(table, offset, limit).await
        }

        async fn write_row(&self, table: &str, key: &RowKey, changes: &Changes) -> Result<()> {
            self.inner.write_row(table, key, changes).await
        }
    }

    #[tokio::test]
    async fn test_second_execute_while_running_is_busy() {
        let gw = Arc::new(StallingGateway {
            inner: MemoryGateway::new().with_table("t", rows(&[OLD])),
            entered: Notify::new(),
            release: Notify::new(),
        });

        let mut builder = SearchReplace::builder();
        builder
            .search(OLD, false)
            .replace(NEW, false)
            .bind_gateway(gw.clone())
            .include_tables(["t"], false);
        let job = Arc::new(builder.build().unwrap());

        let first = {
            let job = Arc::clone(&job);
            tokio::spawn(async move { job.execute().await })
        };
        gw.entered.notified().await;

        let err = job.execute().await.unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("busy")));

        gw.release.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.total_changed(), 1);

        // The guard is released once the run ends.
        gw.release.notify_one();
        assert!(job.execute().await.is_ok());
    }
}
