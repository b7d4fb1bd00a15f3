use anyhow::Result;
use clap::Parser;
use eggturtle_migrate::cli::merge_breeders::{run, MergeBreedersArgs};

#[derive(Parser, Debug)]
#[command(name = "merge_breeders", version, about = "Fold legacy breeders tables into products")]
struct Cli {
    #[command(flatten)]
    args: MergeBreedersArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    eggturtle_migrate::util::env::bootstrap_cli("merge_breeders");
    let cli = Cli::parse();
    run(&cli.args.resolve()?).await?;
    Ok(())
}
