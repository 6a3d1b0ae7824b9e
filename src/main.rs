//! The main entry point for the `dbsr` command-line application.
//!
//! This file parses command-line arguments, installs logging and dispatches
//! to the command handlers in the `dbsr` library.

use dbsr::cli::{self, Commands};
use dbsr::commands;
use dbsr::errors::Result;
use std::env;
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let args_vec: Vec<String> = env::args().collect();
    if args_vec.len() == 1 {
        println!("Batched search/replace across database tables\n");
        println!("QUICK START EXAMPLES:");
        println!("  dbsr tables -d wp -u wp -a                             # List every table");
        println!("  dbsr run -d wp -u wp -a -s http://old -r https://new   # Rewrite all tables");
        println!("  dbsr run -d wp -u wp -a -s old -r new --dry-run        # Preview changes");
        println!("  dbsr run -c job.yaml --table-offset 4                  # Start at the fifth table\n");
        println!("Run 'dbsr --help' for full command list");
        println!("Run 'dbsr <command> --help' for detailed command help");
        process::exit(0);
    }

    if args_vec.len() == 2 && args_vec[1] == "run" {
        eprintln!("Error: Missing search/replace and connection arguments\n");
        eprintln!("USAGE EXAMPLES:");
        eprintln!("  dbsr run -d wp -u wp -a -s http://old -r https://new");
        eprintln!("  dbsr run -d wp -u wp -t wp_posts -s foo -r bar --dry-run");
        eprintln!("  dbsr run -c job.yaml");
        eprintln!("\nFor more options: dbsr run --help");
        process::exit(1);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbsr=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = cli::parse_args();

    match args.command {
        Commands::Run(run) => {
            let report = commands::run_job(run).await?;
            if !report.is_completed() {
                process::exit(1);
            }
        }
        Commands::Tables {
            connection,
            selection,
        } => {
            for table in commands::list_tables(connection, selection).await? {
                println!("{table}");
            }
        }
    }

    Ok(())
}
