use clap::Args;

use riskdash_core::config::redact_dsn;
use riskdash_core::store::Dialect;
use riskdash_core::store::schema::all_tables;

use super::GlobalOpts;

#[derive(Args, Debug)]
pub struct InitArgs {}

pub async fn run(_args: InitArgs, global: &GlobalOpts) -> anyhow::Result<()> {
    let config = super::load_config(global)?;
    let db = super::open_database(&config).await?;

    if !global.quiet {
        match db.backend_kind() {
            Dialect::Postgres => println!(
                "Backend: postgres ({}, schema {})",
                redact_dsn(&config.database.url),
                config.database.schema
            ),
            Dialect::Sqlite => println!(
                "Backend: sqlite ({})",
                config.database.sqlite_path.display()
            ),
        }
        println!("Tables:  {} ensured", all_tables().len());
    }

    super::shutdown(db).await;
    Ok(())
}
