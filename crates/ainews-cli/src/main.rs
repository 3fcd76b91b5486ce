use std::process::ExitCode;

use ainews_sync::{inspect_copies, repair_entities, CollectPipeline, CollectorConfig, Synchronizer};
use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ainews")]
#[command(about = "Collects AI news from RSS feeds into CSV stores")]
struct Cli {
    /// Print results as JSON instead of a one-line summary.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every feed once and merge new articles into the primary store.
    Collect {
        /// Skip mirroring the primary store into the other copies.
        #[arg(long)]
        no_sync: bool,
    },
    /// Make every CSV copy identical to the union of all copies.
    Sync,
    /// Decode HTML entities left in stored titles and descriptions.
    FixEntities,
    /// Show size, row count and digest of each CSV copy.
    Status,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = CollectorConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Collect { no_sync: false }) {
        Commands::Collect { no_sync } => {
            let config = CollectorConfig {
                sync_after_collect: config.sync_after_collect && !no_sync,
                ..config
            };
            let summary = CollectPipeline::new(config)?.run_once().await?;
            if cli.json {
                return print_json(&summary);
            }
            println!(
                "collect complete: run_id={} feeds={} failed={} new={} duplicates={} stored={}",
                summary.run_id,
                summary.feeds_attempted,
                summary.feeds_failed,
                summary.new_articles,
                summary.duplicates_skipped,
                summary.stored_articles
            );
            if let Some(sync) = &summary.sync {
                println!(
                    "sync: articles={} copies={} converged={}",
                    sync.articles,
                    sync.copies.len(),
                    sync.converged()
                );
            }
        }
        Commands::Sync => {
            let report = Synchronizer::new(config.store_paths()).synchronize().await?;
            if cli.json {
                return print_json(&report);
            }
            println!(
                "sync complete: articles={} copies={} converged={} digest={}",
                report.articles,
                report.copies.len(),
                report.converged(),
                report.digest.as_deref().unwrap_or("-")
            );
        }
        Commands::FixEntities => {
            let repairs = repair_entities(&config.store_paths()).await?;
            if cli.json {
                return print_json(&repairs);
            }
            for repair in &repairs {
                println!("{}: fixed {} fields", repair.path, repair.fields_fixed);
            }
        }
        Commands::Status => {
            let statuses = inspect_copies(&config.store_paths()).await?;
            if cli.json {
                return print_json(&statuses);
            }
            for status in &statuses {
                if !status.exists {
                    println!("{}: missing", status.path);
                    continue;
                }
                println!(
                    "{}: {} articles, {} bytes, newest={} sha256={}",
                    status.path,
                    status.articles,
                    status.bytes,
                    status.newest_date.as_deref().unwrap_or("-"),
                    status.sha256.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("ainews failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}
