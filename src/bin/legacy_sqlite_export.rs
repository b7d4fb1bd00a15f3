use anyhow::Result;
use clap::Parser;
use eggturtle_migrate::cli::export::{run_sqlite, ExportSqliteArgs};

#[derive(Parser, Debug)]
#[command(name = "legacy_sqlite_export", version, about = "Export a legacy SQLite database into a payload file")]
struct Cli {
    #[command(flatten)]
    args: ExportSqliteArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    eggturtle_migrate::util::env::bootstrap_cli("legacy_sqlite_export");
    let cli = Cli::parse();
    run_sqlite(&cli.args.resolve()?).await?;
    Ok(())
}
