use std::path::PathBuf;

use clap::Parser;

use riskdash_core::error::{ConfigError, DashError, ErrorKind, StoreError};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "riskdash",
    version,
    about = "Cache-or-compute AI enrichments over risk datasets"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (default: ./riskdash.toml when present)
    #[arg(long, global = true, env = "RISKDASH_CONFIG")]
    config: Option<PathBuf>,

    /// Postgres connection string; falls back to SQLite when unreachable
    #[arg(long, global = true, env = "RISKDASH_DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// SQLite database file
    #[arg(long, global = true, env = "RISKDASH_SQLITE_PATH")]
    sqlite_path: Option<PathBuf>,
}

/// Classify an error into an exit code.
///
///   0  success
///   1  general/unknown error
///   2  configuration error or invalid argument
///   3  record not found
///   4  storage error
///   5  compute function failed
///   10 partial success (bulk or ingest finished with failures)
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<commands::PartialRun>().is_some() {
            return 10;
        }
        if let Some(e) = cause.downcast_ref::<DashError>() {
            return match e.kind() {
                ErrorKind::InvalidArgument | ErrorKind::Configuration => 2,
                ErrorKind::NotFound => 3,
                ErrorKind::StorageFailure => 4,
                ErrorKind::ComputeFailure => 5,
                ErrorKind::Batch | ErrorKind::Io => 1,
            };
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return 2;
        }
        if cause.downcast_ref::<StoreError>().is_some() {
            return 4;
        }
    }
    1
}

fn main() {
    let cli = Cli::parse();

    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    let global = commands::GlobalOpts {
        quiet: cli.quiet,
        config: cli.config,
        database_url: cli.database_url,
        sqlite_path: cli.sqlite_path,
    };

    match runtime.block_on(commands::run(cli.command, &global)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}
