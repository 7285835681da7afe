use std::path::PathBuf;

use clap::Args;

use riskdash_core::datasets::Dataset;
use riskdash_core::ingest::ingest_file;
use riskdash_core::store::RawRecordStore;

use super::{GlobalOpts, PartialRun};

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Dataset name (controls, internal_loss, external_loss, issues)
    pub dataset: String,

    /// JSON array or JSON-lines file of records
    pub file: PathBuf,
}

pub async fn run(args: IngestArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let dataset: Dataset = args.dataset.parse()?;
    let config = super::load_config(global)?;
    let db = super::open_database(&config).await?;

    let raw = RawRecordStore::new(std::sync::Arc::clone(&db));
    let report = ingest_file(&raw, dataset, &args.file).await?;
    drop(raw);
    super::shutdown(db).await;

    if !global.quiet {
        println!(
            "Ingested {dataset}: {} new, {} already present, {} failed",
            report.successful, report.skipped, report.failed
        );
        for error in &report.errors {
            println!("  {error}");
        }
    }

    if report.failed > 0 {
        return Err(PartialRun(format!(
            "{} of {} records could not be ingested",
            report.failed, report.total
        ))
        .into());
    }
    Ok(())
}
