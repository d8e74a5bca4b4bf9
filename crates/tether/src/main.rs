//! tether - keep a PostgreSQL connection alive, bulk load CSV files and
//! verify table contents.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tether_core::logging::{init_logging, LogConfig};
use tether_core::services::tabular;
use tether_core::{
    BulkLoader, ConnectionConfig, ConnectionManager, MismatchPolicy, TetherError, Verifier,
};

/// Exit status for configuration problems detected before connecting.
const EXIT_CONFIG: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Env file to load instead of ./.env
    #[arg(long, global = true, env = "TETHER_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// JSON configuration file; takes precedence over the environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info,tether_core=debug`
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect once and ping
    Ping,
    /// Load a CSV file (header row skipped) into a table in one transaction
    Load {
        /// Target table, optionally schema-qualified
        #[arg(long)]
        table: String,
        /// Comma-separated target columns, in CSV field order
        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<String>,
        /// CSV file to load
        file: PathBuf,
    },
    /// Compare a CSV file (header row skipped) with a query result by position
    Verify {
        /// Query producing rows in the CSV's order
        #[arg(long)]
        query: String,
        /// Report every mismatch instead of stopping at the first
        #[arg(long)]
        aggregate: bool,
        /// CSV file with the expected rows
        file: PathBuf,
    },
    /// Connect and keep the connection alive until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::default();
    if let Some(filter) = &cli.log {
        log_config = log_config.with_filter(filter.clone());
    }
    let _logging_guard = init_logging(log_config);

    let manager = match load_config(&cli).and_then(ConnectionManager::new) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let result = run(cli.command, &manager).await;
    manager.disconnect().await;

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            if let Some(hint) = e.downcast_ref::<TetherError>().and_then(TetherError::hint) {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<ConnectionConfig, TetherError> {
    if let Some(path) = &cli.config {
        return ConnectionConfig::from_json_file(path);
    }
    match &cli.env_file {
        Some(path) => ConnectionConfig::from_env_file(path),
        None => ConnectionConfig::from_env(),
    }
}

async fn run(command: Command, manager: &Arc<ConnectionManager>) -> anyhow::Result<ExitCode> {
    match command {
        Command::Ping => {
            let handle = manager.connect().await?;
            manager.ping().await?;
            println!("ok (connection {})", handle.generation());
        }
        Command::Load { table, columns, file } => {
            let handle = manager.connect().await?;
            let summary = BulkLoader::load_csv(&handle, &file, &table, columns.as_slice())
                .await
                .with_context(|| format!("Loading {} into {table}", file.display()))?;
            println!(
                "loaded {} rows into {} in {}ms",
                summary.rows, summary.table, summary.elapsed_ms
            );
        }
        Command::Verify { query, aggregate, file } => {
            let source = tabular::read_records(&file, false)?;
            let handle = manager.connect().await?;
            let policy =
                if aggregate { MismatchPolicy::Aggregate } else { MismatchPolicy::FailFast };
            let result = Verifier::new()
                .with_policy(policy)
                .compare_query(&handle, &source, &query)
                .await?;
            println!("{result}");
            if !result.is_match() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Watch => {
            if let Err(e) = manager.connect().await {
                tracing::warn!(
                    error = %e,
                    "Initial connect failed; the monitor will keep retrying"
                );
            }
            manager.start_monitoring()?;
            tracing::info!(
                interval_ms = manager.config().monitor.interval_ms,
                "Watching connection; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await?;
            tracing::info!(
                reconnect_attempts = manager.reconnect_attempts(),
                "Stopping"
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}
