pub mod bulk;
pub mod clear;
pub mod export;
pub mod ingest;
pub mod init;
pub mod resolve;
pub mod results;
pub mod status;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;

use riskdash_core::compute::ComputeRegistry;
use riskdash_core::config::DashConfig;
use riskdash_core::resolver::FunctionResolver;
use riskdash_core::store::Database;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "riskdash.toml";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to the database and create every table
    Init(init::InitArgs),
    /// Load records from a JSON or JSON-lines file into a dataset
    Ingest(ingest::IngestArgs),
    /// Return the cached result for one record, computing it on a miss
    Resolve(resolve::ResolveArgs),
    /// Show every cached result for one record
    Results(results::ResultsArgs),
    /// Delete cached results
    Clear(clear::ClearArgs),
    /// Compute one function across a dataset (resumable)
    Bulk(bulk::BulkArgs),
    /// Write a function's cached results to a JSON-lines file
    Export(export::ExportArgs),
    /// Show cache coverage per dataset and function
    Status(status::StatusArgs),
}

/// Options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub quiet: bool,
    pub config: Option<PathBuf>,
    pub database_url: Option<String>,
    pub sqlite_path: Option<PathBuf>,
}

/// A run that finished but left some items unprocessed or failed.
#[derive(Debug)]
pub struct PartialRun(pub String);

impl fmt::Display for PartialRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PartialRun {}

pub async fn run(cmd: Command, global: &GlobalOpts) -> anyhow::Result<()> {
    match cmd {
        Command::Init(args) => init::run(args, global).await,
        Command::Ingest(args) => ingest::run(args, global).await,
        Command::Resolve(args) => resolve::run(args, global).await,
        Command::Results(args) => results::run(args, global).await,
        Command::Clear(args) => clear::run(args, global).await,
        Command::Bulk(args) => bulk::run(args, global).await,
        Command::Export(args) => export::run(args, global).await,
        Command::Status(args) => status::run(args, global).await,
    }
}

/// Load the config file (explicit path, else `./riskdash.toml` if present,
/// else defaults) and apply command-line overrides.
pub fn load_config(global: &GlobalOpts) -> anyhow::Result<DashConfig> {
    let mut config = match &global.config {
        Some(path) => DashConfig::load(path)
            .with_context(|| format!("Cannot load config: {}", path.display()))?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.exists() {
                DashConfig::load(default)
                    .with_context(|| format!("Cannot load config: {}", default.display()))?
            } else {
                DashConfig::default()
            }
        }
    };

    if let Some(url) = &global.database_url {
        config.database.url.clone_from(url);
    }
    if let Some(path) = &global.sqlite_path {
        config.database.sqlite_path.clone_from(path);
    }
    config.validate().context("Invalid config")?;
    Ok(config)
}

pub async fn open_database(config: &DashConfig) -> anyhow::Result<Arc<Database>> {
    let db = Database::connect(&config.database)
        .await
        .context("Cannot open database")?;
    Ok(Arc::new(db))
}

/// Resolver over the configured database with the built-in compute functions.
pub async fn open_resolver(config: &DashConfig) -> anyhow::Result<FunctionResolver> {
    let db = open_database(config).await?;
    Ok(FunctionResolver::with_config(
        db,
        ComputeRegistry::with_mock_functions(),
        &config.resolver,
    ))
}

/// Close the database once every other handle has been dropped.
pub async fn shutdown(db: Arc<Database>) {
    match Arc::try_unwrap(db) {
        Ok(db) => {
            if let Err(e) = db.close().await {
                tracing::debug!(error = %e, "database close failed");
            }
        }
        Err(_) => tracing::debug!("database still shared, skipping close"),
    }
}

/// Shut down a resolver's database.
pub async fn finish(resolver: FunctionResolver) {
    let db = Arc::clone(resolver.database());
    drop(resolver);
    shutdown(db).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("riskdash.toml");
        std::fs::write(&path, "[database]\nsqlite_path = \"from-file.db\"\n[batch]\nchunk_size = 7\n")
            .unwrap();

        let global = GlobalOpts {
            config: Some(path),
            sqlite_path: Some(PathBuf::from("override.db")),
            ..GlobalOpts::default()
        };
        let config = load_config(&global).unwrap();
        assert_eq!(config.database.sqlite_path, PathBuf::from("override.db"));
        assert_eq!(config.batch.chunk_size, 7);
    }

    #[test]
    fn explicit_missing_config_fails() {
        let global = GlobalOpts {
            config: Some(PathBuf::from("/no/such/riskdash.toml")),
            ..GlobalOpts::default()
        };
        let err = load_config(&global).unwrap_err();
        assert!(format!("{err:#}").contains("Cannot load config"));
    }
}
