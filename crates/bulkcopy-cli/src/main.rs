//! bulkcopy CLI - bulk insert, update, delete and merge from JSON files.

mod input;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use bulkcopy::{
    BulkConnection, BulkError, BulkOperation, BulkOptions, BulkRepositoryExt, BulkRequest, Config,
    IdentityBehavior, MergeCommandType, PseudoTableType, Repository, RepositoryImpl, Transaction,
};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "bulkcopy")]
#[command(about = "Bulk insert, update, delete and merge for PostgreSQL and SQL Server")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load rows from a JSON or JSON-lines file
    Load {
        /// Operation to run
        #[arg(long, value_enum)]
        operation: Operation,

        /// Input file; the file stem is the table name unless --table is given
        #[arg(long)]
        file: PathBuf,

        /// Target table (optionally schema-qualified)
        #[arg(long)]
        table: Option<String>,

        /// Match column for update, delete and merge (repeatable)
        #[arg(long = "qualifier")]
        qualifiers: Vec<String>,

        /// Column mapping SOURCE=TARGET (repeatable)
        #[arg(long = "map", value_parser = parse_mapping)]
        mappings: Vec<(String, String)>,

        /// Rows per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Write identity column values from the input
        #[arg(long)]
        keep_identity: bool,

        /// Merge statement style
        #[arg(long, value_enum, default_value = "default")]
        merge_command: MergeStyle,

        /// Pseudo-table kind for update, delete and merge
        #[arg(long, value_enum)]
        pseudo_table: Option<PseudoKind>,

        /// Command timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Run inside a transaction and roll back on failure
        #[arg(long)]
        transaction: bool,
    },

    /// Delete rows by primary key values from a JSON array file
    DeleteKeys {
        /// Target table (optionally schema-qualified)
        #[arg(long)]
        table: String,

        /// JSON array of key values
        #[arg(long)]
        file: PathBuf,

        /// Command timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Test the database connection
    HealthCheck,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Operation {
    Insert,
    Update,
    Delete,
    Merge,
}

impl From<Operation> for BulkOperation {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Insert => BulkOperation::Insert,
            Operation::Update => BulkOperation::Update,
            Operation::Delete => BulkOperation::Delete,
            Operation::Merge => BulkOperation::Merge,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MergeStyle {
    Default,
    InsertAndUpdate,
    OnConflictDoUpdate,
}

impl From<MergeStyle> for MergeCommandType {
    fn from(style: MergeStyle) -> Self {
        match style {
            MergeStyle::Default => MergeCommandType::Default,
            MergeStyle::InsertAndUpdate => MergeCommandType::InsertAndUpdate,
            MergeStyle::OnConflictDoUpdate => MergeCommandType::OnConflictDoUpdate,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PseudoKind {
    Temporary,
    Physical,
}

impl From<PseudoKind> for PseudoTableType {
    fn from(kind: PseudoKind) -> Self {
        match kind {
            PseudoKind::Temporary => PseudoTableType::Temporary,
            PseudoKind::Physical => PseudoTableType::Physical,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), BulkError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Load {
            operation,
            file,
            table,
            qualifiers,
            mappings,
            batch_size,
            keep_identity,
            merge_command,
            pseudo_table,
            timeout,
            transaction,
        } => {
            let data = input::read_table(&file)?;
            info!("Read {} rows from {:?}", data.len(), file);

            let cancel = setup_signal_handler();
            let mut options = BulkOptions::new()
                .merge_command(merge_command.into())
                .cancel_with(cancel);
            if let Some(table) = table {
                options = options.table(table);
            }
            for column in qualifiers {
                options = options.qualifier(column);
            }
            for (source, target) in mappings {
                options = options.mapping(source, target);
            }
            if let Some(rows) = batch_size {
                options = options.batch_size(rows);
            }
            if keep_identity {
                options = options.identity(IdentityBehavior::KeepIdentity);
            }
            if let Some(kind) = pseudo_table {
                options = options.pseudo_table(kind.into());
            }
            if let Some(secs) = timeout {
                options = options.timeout(Duration::from_secs(secs));
            }

            let repo = RepositoryImpl::connect(&config).await?;
            let request = BulkRequest::table(operation.into(), &data, options);
            let target = request
                .options
                .table_name
                .clone()
                .or_else(|| data.name.clone())
                .unwrap_or_default();

            let started = Instant::now();
            let rows = if transaction {
                run_in_transaction(&repo, request).await?
            } else {
                repo.bulk(None, request).await?
            };
            report(cli.output_json, operation.into(), &target, rows, started)?;
        }
        Commands::DeleteKeys {
            table,
            file,
            timeout,
        } => {
            let keys = input::read_keys(&file)?;
            let mut options = BulkOptions::new()
                .table(table.clone())
                .cancel_with(setup_signal_handler());
            if let Some(secs) = timeout {
                options = options.timeout(Duration::from_secs(secs));
            }

            let repo = RepositoryImpl::connect(&config).await?;
            let started = Instant::now();
            let rows = repo.bulk(None, BulkRequest::delete_by_keys(keys, options)).await?;
            report(cli.output_json, BulkOperation::DeleteByKey, &table, rows, started)?;
        }
        Commands::HealthCheck => {
            let repo = RepositoryImpl::connect(&config).await?;
            let result = repo.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  {} ({}): {} ({}ms)",
                    result.dialect,
                    result.target,
                    if result.connected { "OK" } else { "FAILED" },
                    result.latency_ms
                );
                if let Some(ref version) = result.version {
                    println!("    Version: {}", version);
                }
                if let Some(ref err) = result.error {
                    println!("    Error: {}", err);
                }
            }

            if !result.connected {
                return Err(BulkError::pool(
                    result.error.unwrap_or_else(|| "not connected".into()),
                    "health check",
                ));
            }
        }
    }
    Ok(())
}

/// Run `request` on one connection inside BEGIN/COMMIT, rolling back on error.
async fn run_in_transaction(repo: &RepositoryImpl, request: BulkRequest<'_>) -> Result<u64, BulkError> {
    let mut conn = repo.create_connection().await?;
    let mut tx = Transaction::begin(&mut conn).await?;

    let outcome = match repo.bulk(Some(&mut tx), request).await {
        Ok(rows) => tx.commit().await.map(|()| rows),
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback failed: {}", rollback_err);
            }
            Err(e)
        }
    };

    if let Err(close_err) = conn.close().await {
        warn!("Failed to close connection: {}", close_err);
    }
    outcome
}

fn report(
    json: bool,
    operation: BulkOperation,
    table: &str,
    rows: u64,
    started: Instant,
) -> Result<(), BulkError> {
    let elapsed = started.elapsed().as_secs_f64();
    if json {
        let result = serde_json::json!({
            "operation": operation.as_str(),
            "table": table,
            "rows_affected": rows,
            "duration_seconds": elapsed,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("\nBulk {} completed!", operation);
        println!("  Table: {}", table);
        println!("  Rows affected: {}", rows);
        println!("  Duration: {:.2}s", elapsed);
    }
    Ok(())
}

fn parse_mapping(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((source, target)) if !source.is_empty() && !target.is_empty() => {
            Ok((source.to_string(), target.to_string()))
        }
        _ => Err(format!("expected SOURCE=TARGET, got '{}'", s)),
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
///
/// The running worker is dropped at whatever statement it is awaiting. The
/// driver then cancels that statement server-side (PostgreSQL) or discards
/// the connection (SQL Server) before the error is returned.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, label) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Cancelling bulk operation...", label);
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", label, e),
        }
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Cancelling bulk operation...");
            token.cancel();
        }
    });

    cancel_token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mapping() {
        assert_eq!(
            parse_mapping("CustomerId=customer_id").unwrap(),
            ("CustomerId".to_string(), "customer_id".to_string())
        );
        assert!(parse_mapping("no_separator").is_err());
        assert!(parse_mapping("=target").is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
