use clap::Args;

use riskdash_core::datasets::Dataset;
use riskdash_core::store::Dialect;

use super::GlobalOpts;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only this dataset (default: all)
    pub dataset: Option<String>,
}

pub async fn run(args: StatusArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let datasets: Vec<Dataset> = match &args.dataset {
        Some(name) => vec![name.parse()?],
        None => Dataset::ALL.to_vec(),
    };

    let config = super::load_config(global)?;
    let resolver = super::open_resolver(&config).await?;

    let mut coverages = Vec::with_capacity(datasets.len());
    let mut failure = None;
    for dataset in datasets {
        match resolver.coverage(dataset).await {
            Ok(coverage) => coverages.push(coverage),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    let backend = resolver.database().backend_kind();
    super::finish(resolver).await;
    if let Some(e) = failure {
        return Err(e.into());
    }

    println!(
        "riskdash status ({})",
        match backend {
            Dialect::Sqlite => format!("sqlite: {}", config.database.sqlite_path.display()),
            Dialect::Postgres => "postgres".to_string(),
        }
    );
    for coverage in &coverages {
        println!();
        println!("  {}: {} records", coverage.dataset, coverage.total);
        for f in &coverage.functions {
            println!(
                "    {:<20} {:>7} computed {:>7} pending {:>6.1}%",
                f.function, f.computed, f.pending, f.percentage
            );
        }
    }
    Ok(())
}
