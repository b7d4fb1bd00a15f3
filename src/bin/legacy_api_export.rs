use anyhow::Result;
use clap::Parser;
use eggturtle_migrate::cli::export::{run_api, ExportApiArgs};

#[derive(Parser, Debug)]
#[command(name = "legacy_api_export", version, about = "Export the legacy HTTP API into a payload file")]
struct Cli {
    #[command(flatten)]
    args: ExportApiArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    eggturtle_migrate::util::env::bootstrap_cli("legacy_api_export");
    let cli = Cli::parse();
    run_api(&cli.args.resolve()?).await?;
    Ok(())
}
