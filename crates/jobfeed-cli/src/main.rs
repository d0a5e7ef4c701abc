use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobfeed_sync::{build_scheduler, IngestPipeline, PipelineConfig, RunMode, SearchRegistry, SyncRunSummary};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobfeed")]
#[command(about = "Scrape job listings, geocode them and publish the feed files")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Listings file served to the map front end.
    #[arg(long, global = true, env = "JOBFEED_JOBS_FILE")]
    jobs_file: Option<PathBuf>,

    #[arg(long, global = true, env = "JOBFEED_CACHE_FILE")]
    cache_file: Option<PathBuf>,

    /// YAML search registry (source, keyword, locations).
    #[arg(long, global = true, env = "JOBFEED_TARGETS_FILE")]
    targets_file: Option<PathBuf>,

    /// Commit and push the feed files at checkpoints.
    #[arg(long, global = true)]
    git_sync: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl, geocode and save (default).
    Sync,
    /// Crawl and save without geocoding.
    Crawl,
    /// Geocode listings already on disk.
    Geocode,
    /// Run `sync` on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!(error = ?err, "jobfeed failed");
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = PipelineConfig::from_env();
    if let Some(path) = cli.jobs_file {
        config.jobs_file = path;
    }
    if let Some(path) = cli.cache_file {
        config.cache_file = path;
    }
    if let Some(path) = cli.targets_file {
        config.targets_file = path;
    }
    config.git_sync_enabled |= cli.git_sync;

    let registry = SearchRegistry::load(&config.targets_file).await?;
    let crons = config.cron_expressions();
    let pipeline = IngestPipeline::new(config, registry)?;

    let mode = match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => RunMode::Full,
        Commands::Crawl => RunMode::CrawlOnly,
        Commands::Geocode => RunMode::GeocodeOnly,
        Commands::Schedule => return schedule(pipeline, &crons).await,
    };

    let summary = pipeline.run(mode).await?;
    print_summary(&summary);
    Ok(())
}

async fn schedule(pipeline: IngestPipeline, crons: &[String]) -> Result<()> {
    let mut sched = build_scheduler(Arc::new(pipeline), crons).await?;
    sched.start().await.context("starting scheduler")?;
    info!(?crons, "scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    if summary.nothing_to_do {
        println!("geocode complete: run_id={} nothing to do", summary.run_id);
        return;
    }
    println!(
        "run complete: run_id={} locations={} pages={} skipped={} new={} total={} geocoded={} deferred={} checkpoints={}",
        summary.run_id,
        summary.locations_crawled,
        summary.pages_fetched,
        summary.pages_skipped,
        summary.new_listings,
        summary.total_listings,
        summary.external_matches,
        summary.deferred_keys,
        summary.checkpoints
    );
}
