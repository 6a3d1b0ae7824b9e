use crate::config::parse_count;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

/// Bulk search/replace across the tables of a database.
///
/// `dbsr` walks each selected table in bounded batches, rewrites matching text
/// in every textual column and writes back only the rows that changed.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Batched search/replace across database tables",
    long_about = "dbsr - Rewrite text across the tables of a MySQL database, in batches.

Designed for site migrations and bulk fixes with:
  • Include/exclude table selection
  • Table and row windows for partial or resumed runs
  • Bounded batches per round-trip
  • Dry runs that count without writing

QUICK EXAMPLES:
  dbsr run --database wp --user wp --all-tables --search http://old --replace https://new
  dbsr run --config job.yaml --dry-run
  dbsr tables --database wp --user wp --all-tables --exclude wp_users

For detailed help on any command, use: dbsr <command> --help"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

/// Connection flags. Each one overrides the `connection:` section of a job file.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Database server host.
    #[arg(long, env = "DBSR_HOST")]
    pub host: Option<String>,

    /// Database server port (3306 when unset).
    #[arg(long, env = "DBSR_PORT")]
    pub port: Option<u16>,

    /// Database user name.
    #[arg(short, long, env = "DBSR_USER")]
    pub user: Option<String>,

    /// Database password.
    #[arg(long, env = "DBSR_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Name of the database (schema) to process.
    #[arg(short, long, env = "DBSR_DATABASE")]
    pub database: Option<String>,

    /// Path to a YAML job file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Table selection and table window flags.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// Process every table in the database.
    #[arg(short = 'a', long)]
    pub all_tables: bool,

    /// A comma-separated list of tables to process.
    #[arg(short = 't', long, value_delimiter = ',')]
    pub tables: Vec<String>,

    /// A comma-separated list of tables to skip. Exclusion always wins.
    #[arg(short = 'e', long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Skip this many tables of the resolved list.
    #[arg(long, value_parser = parse_count)]
    pub table_offset: Option<i64>,

    /// Process at most this many tables.
    #[arg(long, value_parser = parse_count)]
    pub table_limit: Option<i64>,
}

/// Flags of the `run` command.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(flatten)]
    pub selection: SelectionArgs,

    /// The text (or regex, with --regex) to search for.
    #[arg(short, long)]
    pub search: Option<String>,

    /// The text to put in place of each match.
    #[arg(short, long)]
    pub replace: Option<String>,

    /// Treat the search term as a regular expression.
    #[arg(long)]
    pub regex: bool,

    /// Expand `$1`/`${name}` capture references in the replacement (regex only).
    #[arg(long)]
    pub expand: bool,

    /// Start at this row of every table.
    #[arg(long, value_parser = parse_count)]
    pub row_offset: Option<i64>,

    /// Process at most this many rows of every table.
    #[arg(long, value_parser = parse_count)]
    pub row_limit: Option<i64>,

    /// Rows fetched per round-trip.
    #[arg(short, long, value_parser = parse_count)]
    pub batch_size: Option<i64>,

    /// Number of tables processed at once.
    #[arg(short = 'w', long, value_parser = parse_count, env = "DBSR_CONCURRENCY")]
    pub concurrency: Option<i64>,

    /// Count the rows that would change without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Report every invalid setting at once instead of stopping at the first.
    #[arg(long)]
    pub collect_errors: bool,

    /// The output format for the report (`text`, `json`, `csv`).
    #[arg(short = 'f', long = "format", default_value = "text")]
    pub format: String,

    /// Path to the output file. If omitted, the report is written to standard output.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Hide the progress bar.
    #[arg(short, long)]
    pub quiet: bool,
}

/// The set of available commands for the `dbsr` CLI.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Search and replace text across the selected tables
    ///
    /// EXAMPLES:
    ///   dbsr run -d wp -u wp -a -s http://old.test -r https://new.test
    ///   dbsr run -d wp -u wp -t wp_posts,wp_postmeta -s foo -r bar --dry-run
    ///   dbsr run -d wp -u wp -a --regex -s '(\w+)@old\.test' -r '$1@new.test' --expand
    ///   dbsr run -c job.yaml --table-offset 3 --table-limit 1 --row-offset 1200   # finish a failed table
    ///   dbsr run -c job.yaml --table-offset 4                                     # then the rest
    ///
    /// Job files use YAML format:
    ///   connection: { host: localhost, username: wp, database: wp }
    ///   search:  { term: 'http://old.test' }
    ///   replace: { term: 'https://new.test' }
    ///   tables:  { all: true, exclude: [wp_users] }
    ///   batch_size: 500
    Run(RunArgs),

    /// List the tables a run would process, one per line
    ///
    /// EXAMPLES:
    ///   dbsr tables -d wp -u wp -a
    ///   dbsr tables -d wp -u wp -a -e wp_users --table-offset 2 --table-limit 5
    Tables {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[command(flatten)]
        selection: SelectionArgs,
    },
}

/// Parses command-line arguments and returns the populated `Args` struct.
pub fn parse_args() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let args = Args::try_parse_from([
            "dbsr",
            "run",
            "-d",
            "wp",
            "-u",
            "admin",
            "--tables",
            "wp_posts,wp_options",
            "--exclude",
            "wp_users",
            "-s",
            "http://old",
            "-r",
            "https://new",
            "--row-offset",
            "40",
            "--batch-size",
            "10",
            "--dry-run",
        ])
        .unwrap();

        let Commands::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.connection.database.as_deref(), Some("wp"));
        assert_eq!(run.selection.tables, vec!["wp_posts", "wp_options"]);
        assert_eq!(run.selection.exclude, vec!["wp_users"]);
        assert_eq!(run.search.as_deref(), Some("http://old"));
        assert_eq!(run.row_offset, Some(40));
        assert_eq!(run.batch_size, Some(10));
        assert!(run.dry_run);
        assert_eq!(run.format, "text");
    }

    #[test]
    fn test_numeric_flags_reject_bad_input() {
        for bad in ["abc", "-1"] {
            let parsed = Args::try_parse_from(["dbsr", "run", "--batch-size", bad]);
            assert!(parsed.is_err(), "accepted {bad}");
        }
        let parsed = Args::try_parse_from(["dbsr", "tables", "--table-limit", "x"]);
        assert!(parsed.is_err());
    }
}
