use anyhow::Result;
use clap::Parser;
use eggturtle_migrate::cli::import::{run, ImportArgs};

#[derive(Parser, Debug)]
#[command(name = "payload_import", version, about = "Import a payload file into the target tenant")]
struct Cli {
    #[command(flatten)]
    args: ImportArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    eggturtle_migrate::util::env::bootstrap_cli("payload_import");
    let cli = Cli::parse();
    run(&cli.args.resolve()?).await?;
    Ok(())
}
