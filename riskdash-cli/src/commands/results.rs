use clap::Args;
use serde_json::{Map, Value};

use riskdash_core::datasets::Dataset;

use super::GlobalOpts;

#[derive(Args, Debug)]
pub struct ResultsArgs {
    /// Dataset name
    pub dataset: String,

    /// Record identifier
    pub id: String,
}

pub async fn run(args: ResultsArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let dataset: Dataset = args.dataset.parse()?;
    let config = super::load_config(global)?;
    let resolver = super::open_resolver(&config).await?;
    let outcome = resolver.get_all_results(dataset, &args.id).await;
    super::finish(resolver).await;

    let mut out = Map::new();
    for (function, entry) in outcome? {
        let value = match entry {
            Some(entry) => serde_json::to_value(entry)?,
            None => Value::Null,
        };
        out.insert(function, value);
    }
    println!("{}", serde_json::to_string_pretty(&Value::Object(out))?);
    Ok(())
}
