use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "badge-cli")]
#[command(about = "Sync the Twitch global badge snapshot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape, reconcile and save the snapshot (default).
    Sync {
        /// Reconcile and report without writing or notifying.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the badges parsed from a saved listing page.
    Parse { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("badge=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            info!(source = badge_core::SOURCE_URL, dry_run, "badge sync starting");
            let summary = badge_sync::run_sync_once_from_env(dry_run).await?;
            let o = &summary.outcome;
            println!(
                "sync complete: via={:?} scraped={} checked={} repaired={} new_sets={} new_versions={} saved={} output={}",
                summary.via,
                summary.scraped,
                o.checked,
                o.repaired,
                o.added_sets,
                o.added_versions,
                summary.saved,
                summary.output_path
            );
        }
        Commands::Parse { file } => {
            let badges = badge_adapters::parse_badges_from_file(&file)?;
            println!("{}", serde_json::to_string_pretty(&badges)?);
        }
    }

    Ok(())
}
