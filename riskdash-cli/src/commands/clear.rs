use clap::Args;

use riskdash_core::datasets::Dataset;

use super::GlobalOpts;

#[derive(Args, Debug)]
pub struct ClearArgs {
    /// Dataset name
    pub dataset: String,

    /// Only this AI function (default: all of the dataset's functions)
    #[arg(long)]
    pub function: Option<String>,

    /// Only this record (default: every record)
    #[arg(long)]
    pub id: Option<String>,
}

pub async fn run(args: ClearArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let dataset: Dataset = args.dataset.parse()?;
    let config = super::load_config(global)?;
    let resolver = super::open_resolver(&config).await?;
    let outcome = resolver
        .clear_cache(dataset, args.function.as_deref(), args.id.as_deref())
        .await;
    super::finish(resolver).await;

    let cleared = outcome?;
    if !global.quiet {
        println!("Cleared {cleared} cached result{}", if cleared == 1 { "" } else { "s" });
    }
    Ok(())
}
