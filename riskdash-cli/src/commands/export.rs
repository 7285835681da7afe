use std::path::PathBuf;

use clap::Args;

use riskdash_core::datasets::Dataset;
use riskdash_core::export::{default_export_path, export_function};
use riskdash_core::progress::{IndicatifReporter, NoopReporter, ProgressReporter};

use super::GlobalOpts;

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Dataset name
    pub dataset: String,

    /// AI function name
    pub function: String,

    /// Output path (default: ./<dataset>_<function>_export.jsonl)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

pub async fn run(args: ExportArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let dataset: Dataset = args.dataset.parse()?;
    dataset.require_function(&args.function)?;
    let output = args
        .output
        .unwrap_or_else(|| default_export_path(dataset, &args.function));

    let config = super::load_config(global)?;
    let resolver = super::open_resolver(&config).await?;

    let bar;
    let reporter: &dyn ProgressReporter = if global.quiet {
        &NoopReporter
    } else {
        bar = IndicatifReporter::new();
        &bar
    };
    let outcome = export_function(
        resolver.raw(),
        resolver.cache(),
        dataset,
        &args.function,
        &output,
        reporter,
    )
    .await;
    super::finish(resolver).await;

    let report = outcome?;
    if !global.quiet {
        println!("Wrote {} rows to '{}'.", report.rows, report.path.display());
        if report.missing > 0 {
            println!("{} rows were missing data for '{}'.", report.missing, args.function);
        }
    }
    Ok(())
}
