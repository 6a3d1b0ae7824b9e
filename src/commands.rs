//! Handlers behind the `dbsr` subcommands.

use crate::cli::{ConnectionArgs, RunArgs, SelectionArgs};
use crate::config::{ConfigLoader, JobConfig};
use crate::errors::{Error, Result};
use crate::gateway::ConnectionParams;
use crate::orchestrator::{ErrorMode, RunObserver, SearchReplace, SearchReplaceBuilder};
use crate::report::{ExecutionReport, ReportFormat, ReportFormatter, TableReport};
use indicatif::{ProgressBar, ProgressStyle};
use std::env;
use std::io;
use tracing::info;

/// Executes the `run` command and prints or writes the report.
pub async fn run_job(args: RunArgs) -> Result<ExecutionReport> {
    let mut builder = SearchReplace::builder();
    if args.collect_errors {
        builder.error_mode(ErrorMode::Collect);
    }

    let job_config = load_job_config(&args.connection)?;
    configure(&mut builder, &job_config, &args.selection)?;

    match args.search {
        Some(term) => {
            builder.search(term, args.regex);
        }
        None if args.regex => {
            if let Some(term) = builder.search_spec().map(|s| s.term.clone()) {
                builder.search(term, true);
            }
        }
        None => {}
    }
    match args.replace {
        Some(term) => {
            builder.replace(term, args.expand);
        }
        None if args.expand => {
            if let Some(term) = builder.replace_spec().map(|r| r.term.clone()) {
                builder.replace(term, true);
            }
        }
        None => {}
    }

    if let Some(offset) = args.row_offset {
        builder.row_offset(offset)?;
    }
    if let Some(limit) = args.row_limit {
        builder.row_limit(Some(limit))?;
    }
    if let Some(size) = args.batch_size {
        builder.batch_size(size)?;
    }
    if let Some(workers) = args.concurrency {
        builder.table_concurrency(usize::try_from(workers).unwrap_or(usize::MAX))?;
    }
    if args.dry_run {
        builder.dry_run(true);
    }

    let job = builder.build()?;
    let observer = ProgressObserver::new(args.quiet);
    let report = job.execute_with(&observer).await?;
    observer.finish();

    let formatter = ReportFormatter::new(ReportFormat::from(args.format.as_str()));
    match &args.output {
        Some(path) => {
            formatter.write_report_file(path, &report)?;
            println!("Report written to {}", path.display());
        }
        None => {
            println!();
            formatter.write_report(&mut io::stdout().lock(), &report)?;
        }
    }

    Ok(report)
}

/// Executes the `tables` command: the worklist a run would process.
pub async fn list_tables(connection: ConnectionArgs, selection: SelectionArgs) -> Result<Vec<String>> {
    let mut builder = SearchReplace::builder();
    let job_config = load_job_config(&connection)?;
    configure(&mut builder, &job_config, &selection)?;

    let problems = builder.validate();
    if !problems.is_empty() {
        return Err(Error::Configuration(problems.join("; ")));
    }

    let resolved = builder.resolved_tables().await?;
    Ok(builder.settings().table_range.apply(&resolved).to_vec())
}

/// Loads the job file named by `--config` (if any) and folds the connection flags into it.
fn load_job_config(args: &ConnectionArgs) -> Result<JobConfig> {
    let mut job = match &args.config {
        Some(path) => {
            let working_dir = env::current_dir()?;
            let resolved = ConfigLoader::find_config(path, &working_dir)?;
            info!(path = %resolved.display(), "Using job file");
            ConfigLoader::load_job(&resolved)?
        }
        None => JobConfig::default(),
    };
    job.connection = merge_connection(job.connection.take(), args);
    Ok(job)
}

/// Flags override file values field by field.
fn merge_connection(base: Option<ConnectionParams>, args: &ConnectionArgs) -> Option<ConnectionParams> {
    let overridden = args.host.is_some()
        || args.port.is_some()
        || args.user.is_some()
        || args.password.is_some()
        || args.database.is_some();
    if base.is_none() && !overridden {
        return None;
    }

    let mut params = base.unwrap_or_else(|| ConnectionParams::new("localhost", "", "", ""));
    if let Some(host) = &args.host {
        params.host = host.clone();
    }
    if let Some(port) = args.port {
        params.port = port;
    }
    if let Some(user) = &args.user {
        params.username = user.clone();
    }
    if let Some(password) = &args.password {
        params.password = password.clone();
    }
    if let Some(database) = &args.database {
        params.database = database.clone();
    }
    Some(params)
}

/// Applies the job file, then the selection flags on top of it.
fn configure(
    builder: &mut SearchReplaceBuilder,
    job: &JobConfig,
    selection: &SelectionArgs,
) -> Result<()> {
    job.apply(builder)?;

    if selection.all_tables {
        builder.include_all_tables(true);
    }
    builder.include_tables(selection.tables.iter().cloned(), false);
    builder.exclude_tables(selection.exclude.iter().cloned(), false);
    if let Some(offset) = selection.table_offset {
        builder.table_offset(offset)?;
    }
    if let Some(limit) = selection.table_limit {
        builder.table_limit(Some(limit))?;
    }
    Ok(())
}

/// Draws one progress tick per finished table.
struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} tables {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl RunObserver for ProgressObserver {
    fn run_started(&self, tables: &[String]) {
        self.bar.set_length(tables.len() as u64);
    }

    fn table_started(&self, table: &str) {
        self.bar.set_message(table.to_string());
    }

    fn batch_processed(&self, _table: &str, _rows: usize) {
        self.bar.tick();
    }

    fn table_finished(&self, _report: &TableReport) {
        self.bar.inc(1);
    }
}
