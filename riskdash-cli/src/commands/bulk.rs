use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use riskdash_core::batch::{
    BatchJob, BatchOptions, BatchProcessor, BatchStatus, ReporterObserver, run_resumable,
};
use riskdash_core::datasets::Dataset;
use riskdash_core::progress::{IndicatifReporter, ProgressReporter};

use super::{GlobalOpts, PartialRun};

/// Error lines echoed after a run with failures.
const SHOWN_ERRORS: usize = 10;

#[derive(Args, Debug)]
pub struct BulkArgs {
    /// Dataset name
    pub dataset: String,

    /// AI function name
    pub function: String,

    /// Records per chunk (default: batch.chunk_size)
    #[arg(long, value_parser = positive)]
    pub chunk_size: Option<usize>,

    /// Concurrent chunks (default: batch.max_workers)
    #[arg(long, value_parser = positive)]
    pub workers: Option<usize>,

    /// Recompute records that already have a cached result
    #[arg(long)]
    pub refresh: bool,

    /// Directory for resume files (default: batch.resume_dir)
    #[arg(long)]
    pub resume_dir: Option<PathBuf>,
}

fn positive(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

pub async fn run(args: BulkArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let dataset: Dataset = args.dataset.parse()?;
    dataset.require_function(&args.function)?;

    let config = super::load_config(global)?;
    let mut options = BatchOptions::from(&config.batch);
    if let Some(n) = args.chunk_size {
        options.chunk_size = n;
    }
    if let Some(n) = args.workers {
        options.max_workers = n;
    }
    let resume_dir = args
        .resume_dir
        .unwrap_or_else(|| config.batch.resume_dir.clone());

    let resolver = Arc::new(super::open_resolver(&config).await?);
    let processor = BatchProcessor::new(Arc::clone(&resolver), options);

    let cancel = processor.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight chunks");
            cancel.cancel();
        }
    });

    let reporter = if global.quiet {
        IndicatifReporter::hidden()
    } else {
        IndicatifReporter::new()
    };
    let observer = ReporterObserver::new(&reporter, format!("{dataset}:{}", args.function));
    let job = BatchJob::new(dataset, args.function.clone()).refresh(args.refresh);

    let outcome = run_resumable(&processor, job, &resume_dir, &observer).await;
    reporter.finish();
    let db = Arc::clone(resolver.database());
    drop(processor);
    drop(resolver);
    super::shutdown(db).await;

    let report = outcome?;
    if !global.quiet {
        match report.status {
            BatchStatus::NothingToDo => {
                println!("Nothing to process for {dataset}:{}", args.function);
                return Ok(());
            }
            BatchStatus::Cancelled => println!("Interrupted. Progress saved; rerun to resume."),
            BatchStatus::Completed => {}
        }
        println!(
            "Processed {}/{} items ({} successful, {} failed, {} skipped)",
            report.processed, report.total, report.successful, report.failed, report.skipped
        );
        match report.rate {
            Some(rate) => println!("Elapsed {:.2}s ({rate:.1} items/s)", report.elapsed_secs),
            None => println!("Elapsed {:.2}s (rate N/A)", report.elapsed_secs),
        }
        for error in report.errors.iter().take(SHOWN_ERRORS) {
            println!("  {error}");
        }
    }

    match report.status {
        BatchStatus::Cancelled => Err(PartialRun(format!(
            "bulk run interrupted after {} of {} items",
            report.processed, report.total
        ))
        .into()),
        BatchStatus::Completed if report.has_failures() => Err(PartialRun(format!(
            "{} of {} items failed",
            report.failed, report.total
        ))
        .into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_rejects_zero() {
        assert_eq!(positive("3"), Ok(3));
        assert!(positive("0").is_err());
        assert!(positive("x").is_err());
    }
}
