use anyhow::Context;
use clap::Args;
use serde_json::{Map, Value};

use riskdash_core::resolver::ResolveRequest;

use super::GlobalOpts;

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Dataset name
    pub dataset: String,

    /// AI function name
    pub function: String,

    /// Record identifier
    pub id: String,

    /// Recompute even when a cached result exists
    #[arg(long)]
    pub refresh: bool,

    /// JSON object overlaid on the record context
    #[arg(long)]
    pub context: Option<String>,
}

pub async fn run(args: ResolveArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let mut request = ResolveRequest::parse(&args.dataset, &args.function, &args.id)?
        .refresh(args.refresh);
    if let Some(text) = &args.context {
        request = request.with_context(parse_context(text)?);
    }

    let config = super::load_config(global)?;
    let resolver = super::open_resolver(&config).await?;
    let outcome = resolver.resolve(&request).await;
    super::finish(resolver).await;

    let resolved = outcome?;
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}

fn parse_context(text: &str) -> anyhow::Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(text).context("--context is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(riskdash_core::error::DashError::InvalidArgument(
            "--context must be a JSON object".into(),
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_must_be_object() {
        assert_eq!(parse_context(r#"{"a": 1}"#).unwrap()["a"], 1);
        assert!(parse_context("[1]").is_err());
        assert!(parse_context("{").is_err());
    }
}
