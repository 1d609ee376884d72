use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use steam_crawl::database_ops::db::connect_store;
use steam_crawl::database_ops::ledger::{FileLedger, ProgressLedger};
use steam_crawl::database_ops::steam::catalog::SteamCatalogClient;
use steam_crawl::database_ops::steam::details::{DetailFetcher, SteamDetailClient};
use steam_crawl::database_ops::steam::tags::SteamTagScraper;
use steam_crawl::logging::{init_tracing, DEFAULT_FILTER};
use steam_crawl::orchestrator::{CrawlContext, Orchestrator, RunSummary, Sources};
use steam_crawl::util::env;
use steam_crawl::util::journal::RunJournal;
use steam_crawl::CrawlerConfig;

#[derive(Parser, Debug)]
#[command(name = "steam-crawl", version, about = "Resumable Steam catalog crawler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Catalog entries per batch (overrides CRAWL_BATCH_SIZE)
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    /// Max catalog entries walked this invocation (overrides CRAWL_WINDOW_CAP)
    #[arg(long, global = true)]
    window_cap: Option<usize>,
    /// Directory holding the cursor and failure ledger (overrides CRAWL_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Do not replay the failure ledger after the main pass
    #[arg(long, global = true, default_value_t = false)]
    skip_retry_pass: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Resume from the saved cursor, walk one window, then retry failed ids
    Run,
    /// Only retry ids from the failure ledger
    Retry,
    /// Print the saved cursor and failure ledger; no network, no database
    Status,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);

    if command == Commands::Status {
        let state_dir = cli
            .state_dir
            .clone()
            .or_else(|| env::env_opt("CRAWL_STATE_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        return print_status(FileLedger::in_dir(state_dir)).await;
    }

    let mut config = CrawlerConfig::from_env()?;
    apply_overrides(&mut config, &cli);
    config.log_summary();

    let store = connect_store(&config.store, config.refresh, config.auto_migrate)
        .await
        .context("failed to connect to the record store")?;

    let journal = match &config.journal {
        Some(path) => RunJournal::open(path).await,
        None => RunJournal::disabled(),
    };
    let ctx = CrawlContext::new(store, Arc::new(config.ledger()), journal);

    let sources = match build_sources(&config) {
        Ok(sources) => sources,
        Err(err) => {
            let mut ctx = ctx;
            ctx.close().await;
            return Err(err);
        }
    };

    let mut orchestrator =
        Orchestrator::new(sources, config.classifier(), config.batch.clone(), ctx);
    let outcome = match command {
        Commands::Retry => orchestrator.retry_failed().await,
        _ => orchestrator.run().await,
    };
    orchestrator.shutdown().await;

    match outcome {
        Ok(summary) => {
            report(&summary);
            Ok(())
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "crawl aborted");
            Err(err)
        }
    }
}

fn apply_overrides(config: &mut CrawlerConfig, cli: &Cli) {
    if let Some(n) = cli.batch_size {
        config.batch.batch_size = n.max(1);
    }
    if let Some(n) = cli.window_cap {
        config.batch.window_cap = n;
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    if cli.skip_retry_pass {
        config.batch.retry_pass = false;
    }
}

fn build_sources(config: &CrawlerConfig) -> Result<Sources> {
    let client = config.endpoints.http_client()?;
    let language = config.language.canonical().to_string();
    let transport = SteamDetailClient::new(client.clone(), &config.endpoints, language.clone());
    Ok(Sources {
        catalog: Arc::new(SteamCatalogClient::new(client.clone(), &config.endpoints)),
        details: DetailFetcher::new(Arc::new(transport), config.retry.clone()),
        tags: Arc::new(SteamTagScraper::new(client, &config.endpoints, language)),
    })
}

async fn print_status(ledger: FileLedger) -> Result<()> {
    let cursor = ledger.load_cursor().await?;
    let failed = ledger.failed_ids().await?;
    println!("cursor: {cursor} ({})", ledger.cursor_path().display());
    println!(
        "failed ids: {} ({})",
        failed.len(),
        ledger.failures_path().display()
    );
    for id in failed.iter().take(20) {
        println!("  {id}");
    }
    if failed.len() > 20 {
        println!("  ... {} more", failed.len() - 20);
    }
    Ok(())
}

fn report(summary: &RunSummary) {
    info!(
        start = summary.start_cursor,
        end = summary.end_cursor,
        batches = summary.batches,
        stored = summary.main.stored,
        retried = summary.retry.attempted,
        recovered = summary.retry.stored,
        "run complete"
    );
    if summary.catalog_len > 0 && summary.end_cursor >= summary.catalog_len {
        info!(catalog = summary.catalog_len, "catalog fully walked");
    }
    if let Some(remaining) = summary.ledger_remaining.filter(|n| *n > 0) {
        warn!(remaining, "failed ids remain in the ledger");
    }
}
