use anyhow::Result;
use clap::{Parser, Subcommand};
use eggturtle_migrate::cli::export::{self, ExportApiArgs, ExportSqliteArgs};
use eggturtle_migrate::cli::import::{self, ImportArgs, ImportRun};
use eggturtle_migrate::cli::merge_breeders::{self, MergeBreedersArgs};
use eggturtle_migrate::util::env as env_util;

#[derive(Parser, Debug)]
#[command(
    name = "eggturtle-migrate",
    version,
    about = "Legacy single-tenant to multi-tenant migration"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export the legacy HTTP API into a payload file
    ExportApi(ExportApiArgs),
    /// Export a legacy SQLite database into a payload file
    ExportSqlite(ExportSqliteArgs),
    /// Import a payload file into the target tenant
    Import(ImportArgs),
    /// Fold legacy breeders tables into products inside the target
    MergeBreeders(MergeBreedersArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::bootstrap_cli("eggturtle-migrate");
    let cli = Cli::parse();

    match cli.command {
        Command::ExportApi(args) => {
            export::run_api(&args.resolve()?).await?;
        }
        Command::ExportSqlite(args) => {
            export::run_sqlite(&args.resolve()?).await?;
        }
        Command::Import(args) => {
            if let ImportRun::Written(written) = import::run(&args.resolve()?).await? {
                if !written.report.verification.all_pass() {
                    tracing::warn!(report = %written.json_path.display(), "verification has CHECK entries");
                }
            }
        }
        Command::MergeBreeders(args) => {
            merge_breeders::run(&args.resolve()?).await?;
        }
    }
    Ok(())
}
