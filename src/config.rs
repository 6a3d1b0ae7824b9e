use crate::errors::{Error, Result};
use crate::gateway::ConnectionParams;
use crate::orchestrator::SearchReplaceBuilder;
use crate::substitution::{ReplaceSpec, SearchSpec};
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Directory name used under the platform config dir.
const APP_DIR: &str = "dbsr";

/// A search/replace job described in YAML.
///
/// Every section is optional. Values are pushed through the builder setters by
/// [`JobConfig::apply`], so they are validated exactly like programmatic input.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub connection: Option<ConnectionParams>,
    pub search: Option<SearchSpec>,
    pub replace: Option<ReplaceSpec>,
    pub tables: Option<TablesConfig>,
    pub table_range: Option<RangeConfig>,
    pub row_range: Option<RangeConfig>,
    pub batch_size: Option<i64>,
    pub concurrency: Option<i64>,
    pub dry_run: Option<bool>,
}

/// The `tables:` section.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TablesConfig {
    pub all: Option<bool>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// A `table_range:` or `row_range:` section. Signed so negatives are reported, not misparsed.
#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
}

impl JobConfig {
    /// Applies every present field to `builder`, or none of them if any is rejected.
    ///
    /// A connection section binds a lazily connecting MySQL gateway, which
    /// requires a tokio runtime.
    pub fn apply(&self, builder: &mut SearchReplaceBuilder) -> Result<()> {
        let mut staged = builder.clone();
        self.apply_to(&mut staged)?;
        *builder = staged;
        Ok(())
    }

    fn apply_to(&self, builder: &mut SearchReplaceBuilder) -> Result<()> {
        if let Some(search) = &self.search {
            builder.search(search.term.clone(), search.is_pattern);
        }
        if let Some(replace) = &self.replace {
            builder.replace(replace.term.clone(), replace.is_pattern);
        }
        if let Some(connection) = &self.connection {
            builder.bind_connection(connection)?;
        }
        if let Some(tables) = &self.tables {
            if let Some(all) = tables.all {
                builder.include_all_tables(all);
            }
            builder.include_tables(tables.include.iter().cloned(), false);
            builder.exclude_tables(tables.exclude.iter().cloned(), false);
        }
        if let Some(range) = self.table_range {
            builder.table_range(range.offset, range.limit)?;
        }
        if let Some(range) = self.row_range {
            builder.row_range(range.offset, range.limit)?;
        }
        if let Some(size) = self.batch_size {
            builder.batch_size(size)?;
        }
        if let Some(workers) = self.concurrency {
            let workers = usize::try_from(workers).map_err(|_| {
                Error::Configuration(format!("concurrency must not be negative (got {workers})"))
            })?;
            builder.table_concurrency(workers)?;
        }
        if let Some(dry_run) = self.dry_run {
            builder.dry_run(dry_run);
        }
        Ok(())
    }
}

/// Parses a non-negative whole number from user input.
///
/// Used as the clap value parser for numeric flags, so `abc` and `-1` are
/// rejected before a builder is ever touched.
pub fn parse_count(input: &str) -> Result<i64> {
    let value: i64 = input
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("'{input}' is not a whole number")))?;
    if value < 0 {
        return Err(Error::Configuration(format!(
            "'{input}' must not be negative"
        )));
    }
    Ok(value)
}

/// Locates and loads job files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Finds a job file by searching a prioritized list of locations.
    ///
    /// The search order is:
    /// 1. `config_path` itself (absolute, or relative to the current directory).
    /// 2. A path relative to `working_dir`.
    /// 3. The platform config directory, e.g. `~/.config/dbsr/`.
    /// 4. Next to the executable, then its parent (for `target/release` builds).
    pub fn find_config(config_path: &Path, working_dir: &Path) -> Result<PathBuf> {
        if config_path.exists() {
            return Ok(config_path.to_path_buf());
        }

        let mut tried = vec![config_path.display().to_string()];
        if config_path.is_absolute() {
            return Err(not_found(config_path, &tried));
        }

        let mut candidates = vec![working_dir.join(config_path)];
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join(APP_DIR).join(config_path));
        }
        if let Ok(exe_path) = env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                candidates.push(exe_dir.join(config_path));
                if let Some(parent) = exe_dir.parent() {
                    candidates.push(parent.join(config_path));
                }
            }
        }

        for candidate in candidates {
            if candidate.exists() {
                return Ok(candidate);
            }
            tried.push(candidate.display().to_string());
        }

        Err(not_found(config_path, &tried))
    }

    /// Loads a `JobConfig` from a YAML file.
    pub fn load_job(path: &Path) -> Result<JobConfig> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }
}

fn not_found(config_path: &Path, tried: &[String]) -> Error {
    format!(
        "Config file '{}' not found. Searched in:\n  - {}",
        config_path.display(),
        tried.join("\n  - ")
    )
    .into()
}
