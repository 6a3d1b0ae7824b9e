use crate::errors::{Error, Result};
use crate::range::Range;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Per-table counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub scanned: u64,
    pub changed: u64,
    pub failed: u64,
}

impl TableReport {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }
}

/// Where to pick a failed run back up.
///
/// The row range applies to every table, so resuming takes two runs: the
/// failing table alone from `row_offset`, then the tables after it with the
/// original row range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResumePoint {
    /// Index of the failing table in the resolved table list.
    pub table_offset: u64,
    /// First row of the failing table not yet processed.
    pub row_offset: u64,
    /// Rows of the failing table still inside the configured row limit.
    pub row_limit: Option<u64>,
    /// Table window covering the tables after the failing one; `None` when it was the last.
    pub remaining_tables: Option<Range>,
    /// The row range of the failed run.
    pub row_range: Range,
}

impl ResumePoint {
    /// Command-line flags for each resume run, in order.
    pub fn resume_flags(&self) -> Vec<String> {
        let mut first = format!(
            "--table-offset {} --table-limit 1 --row-offset {}",
            self.table_offset, self.row_offset
        );
        if let Some(limit) = self.row_limit {
            first.push_str(&format!(" --row-limit {limit}"));
        }

        let mut steps = vec![first];
        if let Some(tables) = self.remaining_tables {
            let mut rest = format!("--table-offset {}", tables.offset);
            if let Some(limit) = tables.limit {
                rest.push_str(&format!(" --table-limit {limit}"));
            }
            if self.row_range.offset > 0 {
                rest.push_str(&format!(" --row-offset {}", self.row_range.offset));
            }
            if let Some(limit) = self.row_range.limit {
                rest.push_str(&format!(" --row-limit {limit}"));
            }
            steps.push(rest);
        }
        steps
    }
}

/// The outcome of one `execute` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub status: RunStatus,
    pub tables: Vec<TableReport>,
    pub error: Option<String>,
    pub resume: Option<ResumePoint>,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn total_scanned(&self) -> u64 {
        self.tables.iter().map(|t| t.scanned).sum()
    }

    pub fn total_changed(&self) -> u64 {
        self.tables.iter().map(|t| t.changed).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.tables.iter().map(|t| t.failed).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Turns a failed run into `Error::Execution`, for callers that want `?`.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            RunStatus::Completed => Ok(self),
            RunStatus::Failed => Err(Error::Execution {
                message: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "run failed".to_string()),
            }),
        }
    }
}

/// Output formats for an `ExecutionReport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// A human-readable summary table.
    Text,
    /// JSON, suitable for machine processing.
    Json,
    /// One CSV record per table.
    Csv,
}

impl From<&str> for ReportFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => ReportFormat::Json,
            "csv" => ReportFormat::Csv,
            _ => ReportFormat::Text,
        }
    }
}

/// Renders execution reports.
pub struct ReportFormatter {
    format: ReportFormat,
    tool_name: String,
    tool_version: String,
}

impl ReportFormatter {
    pub fn new(format: ReportFormat) -> Self {
        Self {
            format,
            tool_name: "dbsr".to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Writes the formatted report to a given writer.
    pub fn write_report<W: Write>(&self, writer: &mut W, report: &ExecutionReport) -> Result<()> {
        let output = self.render(report)?;
        writer.write_all(output.as_bytes())?;
        Ok(())
    }

    /// Writes the formatted report to `path` atomically.
    pub fn write_report_file(&self, path: &Path, report: &ExecutionReport) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut temp_file = NamedTempFile::new_in(parent)?;
        self.write_report(&mut temp_file, report)?;
        temp_file.persist(path)?;
        Ok(())
    }

    pub fn render(&self, report: &ExecutionReport) -> Result<String> {
        match self.format {
            ReportFormat::Text => Ok(self.format_text(report)),
            ReportFormat::Json => self.format_json(report),
            ReportFormat::Csv => self.format_csv(report),
        }
    }

    fn format_text(&self, report: &ExecutionReport) -> String {
        let width = report
            .tables
            .iter()
            .map(|t| t.table.len())
            .max()
            .unwrap_or(0)
            .max("Table".len());

        let mut output = String::new();
        output.push_str(&format!(
            "{:<width$}  {:>10}  {:>10}  {:>8}\n",
            "Table", "Scanned", "Changed", "Failed"
        ));
        for t in &report.tables {
            output.push_str(&format!(
                "{:<width$}  {:>10}  {:>10}  {:>8}\n",
                t.table, t.scanned, t.changed, t.failed
            ));
        }

        output.push_str(&format!("{}\n", "-".repeat(50)));
        output.push_str(&format!("Tables        : {}\n", report.tables.len()));
        output.push_str(&format!("Rows scanned  : {}\n", report.total_scanned()));
        if report.dry_run {
            output.push_str(&format!("Rows to change: {} (dry run)\n", report.total_changed()));
        } else {
            output.push_str(&format!("Rows changed  : {}\n", report.total_changed()));
        }
        output.push_str(&format!("Rows failed   : {}\n", report.total_failed()));
        output.push_str(&format!("Status        : {:?}\n", report.status));
        if let Some(error) = &report.error {
            output.push_str(&format!("Error         : {error}\n"));
        }
        if let Some(resume) = &report.resume {
            for (step, flags) in resume.resume_flags().iter().enumerate() {
                let label = if step == 0 { "Resume with" } else { "Then" };
                output.push_str(&format!("{label:<14}: {flags}\n"));
            }
        }
        output
    }

    fn format_json(&self, report: &ExecutionReport) -> Result<String> {
        #[derive(Serialize)]
        struct JsonOutput<'a> {
            tool: ToolInfo<'a>,
            total_scanned: u64,
            total_changed: u64,
            total_failed: u64,
            #[serde(flatten)]
            report: &'a ExecutionReport,
        }

        #[derive(Serialize)]
        struct ToolInfo<'a> {
            name: &'a str,
            version: &'a str,
        }

        let output = JsonOutput {
            tool: ToolInfo {
                name: &self.tool_name,
                version: &self.tool_version,
            },
            total_scanned: report.total_scanned(),
            total_changed: report.total_changed(),
            total_failed: report.total_failed(),
            report,
        };
        Ok(serde_json::to_string_pretty(&output)?)
    }

    fn format_csv(&self, report: &ExecutionReport) -> Result<String> {
        use csv::Writer;

        let mut wtr = Writer::from_writer(vec![]);
        wtr.write_record(["Table", "Scanned", "Changed", "Failed"])?;
        for t in &report.tables {
            wtr.write_record(&[
                t.table.clone(),
                t.scanned.to_string(),
                t.changed.to_string(),
                t.failed.to_string(),
            ])?;
        }

        let data = wtr
            .into_inner()
            .map_err(|e| format!("CSV writer error: {}", e))?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }
}
