mod catalog;
mod cli;
mod config;
mod display;
mod error;
mod item;
mod ledger;
mod library;
mod notify;
mod page;
mod parser;
mod pipeline;
mod queue;
mod storage;
mod types;

use anyhow::{bail, Context, Result};
use catalog::{CatalogService, HttpCatalog};
use clap::Parser;
use cli::{Cli, Command};
use colored::*;
use config::Settings;
use display::DownloadSummary;
use indicatif::MultiProgress;
use item::{ChartItem, ItemContext, VisibilityFilter};
use ledger::LibraryLedger;
use library::DirectoryLibrary;
use log::{error, info, warn};
use notify::{ConsoleNotifier, Notifier};
use page::ChartPage;
use pipeline::DownloadPipeline;
use queue::{Admission, DownloadQueue};
use std::sync::Arc;
use std::time::Instant;
use types::DownloadSource;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("Starting chart downloader");

    let cli = Cli::parse();
    let settings = Settings::from_cli(&cli)?;
    info!("CLI arguments parsed: parallelism={}", settings.parallelism);

    let entries = match parser::parse_catalog(&cli.catalog).await {
        Ok(entries) => {
            info!("Parsed {} entries from catalog", entries.len());
            entries
        }
        Err(e) => {
            error!("Failed to parse catalog: {}", e);
            eprintln!("{}", "Failed to parse catalog".red());
            return Err(e).context(format!("reading {}", cli.catalog.display()));
        }
    };

    let page = open_page(&settings, entries).await?;

    let outcome = match cli.command {
        Command::List => {
            page.wait_for_probes().await;
            display::print_listing(page.visible_items());
            Ok(())
        }
        Command::Download {
            all,
            source,
            track_refs,
        } => run_downloads(&page, all, source, &track_refs).await,
        Command::Delete { track_refs } => run_deletes(&page, &track_refs).await,
    };

    if let Err(e) = page.leave().await {
        error!("Library reload failed: {}", e);
        eprintln!("{}", "Library reload failed".red());
    }
    outcome
}

async fn open_page(
    settings: &Settings,
    entries: Vec<types::ChartCatalogEntry>,
) -> Result<ChartPage> {
    storage::ensure_dir(&settings.content_dir)
        .await
        .with_context(|| format!("creating {}", settings.content_dir.display()))?;
    let library = DirectoryLibrary::open(&settings.content_dir)
        .await
        .context("loading installed charts")?;

    let catalog: Arc<dyn CatalogService> = Arc::new(HttpCatalog::new());
    let notifier: Arc<dyn Notifier> = Arc::new(ConsoleNotifier);
    let pipeline = DownloadPipeline::new(
        Arc::clone(&catalog),
        settings.scratch_dir.clone(),
        settings.content_dir.clone(),
        Arc::clone(&notifier),
    );
    info!("Installing charts into {}", pipeline.content_dir().display());

    let ctx = Arc::new(ItemContext {
        queue: DownloadQueue::new(Arc::new(pipeline), settings.parallelism),
        catalog,
        library: Arc::new(library),
        ledger: Arc::new(LibraryLedger::new()),
        filter: Arc::new(VisibilityFilter::new(settings.not_owned_only)),
        notifier,
        content_dir: settings.content_dir.clone(),
    });

    let mut page = ChartPage::new(ctx);
    let added = page.add_entries(entries);
    info!("Listing {} charts", added);
    Ok(page)
}

async fn run_downloads(
    page: &ChartPage,
    all: bool,
    source: DownloadSource,
    track_refs: &[String],
) -> Result<()> {
    if !all && track_refs.is_empty() {
        bail!("name at least one track ref or pass --all");
    }
    page.wait_for_probes().await;

    let requested: Vec<Arc<ChartItem>> = if all {
        if !page.has_available() {
            println!("{}", "Nothing available to download".yellow());
            return Ok(());
        }
        page.download_all(source)
    } else {
        let mut requested = Vec::new();
        for track_ref in track_refs {
            let Some(item) = page.item(track_ref) else {
                warn!("{} is not in the catalog", track_ref);
                eprintln!("{} {}", "Unknown chart:".red(), track_ref);
                continue;
            };
            match item.request_download(source) {
                Ok(Admission::Started) => requested.push(Arc::clone(item)),
                Ok(Admission::Queued { position }) => {
                    info!("{} queued at position {}", track_ref, position);
                    requested.push(Arc::clone(item));
                }
                Err(e) => eprintln!("{} {}", "Skipped:".red(), e),
            }
        }
        requested
    };

    let start_time = Instant::now();
    let bars = MultiProgress::new();
    let trackers: Vec<_> = requested
        .into_iter()
        .map(|item| display::track_download(&bars, item))
        .collect();

    tokio::select! {
        _ = page.wait_for_downloads() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, dropping downloads that have not started");
            for item in page.items() {
                item.cancel_download();
            }
            let (active, queued) = page.queue_status();
            info!("{} downloads still running, {} queued", active, queued);
            page.wait_for_downloads().await;
        }
    }

    let mut summary = DownloadSummary::default();
    for tracker in futures::future::join_all(trackers).await {
        summary.reports.push(tracker.context("progress tracker panicked")?);
    }
    summary.total_duration = start_time.elapsed();
    display::print_summary(&summary);

    if summary.failed() > 0 {
        error!("{} downloads failed", summary.failed());
        bail!("Some downloads failed");
    }
    if !summary.reports.is_empty() {
        println!("\n{}", "All downloads completed successfully".green());
    }
    Ok(())
}

async fn run_deletes(page: &ChartPage, track_refs: &[String]) -> Result<()> {
    let mut failures = 0;
    for track_ref in track_refs {
        let Some(item) = page.item(track_ref) else {
            eprintln!("{} {}", "Unknown chart:".red(), track_ref);
            failures += 1;
            continue;
        };
        if !item.is_owned() {
            eprintln!("{} {} is not installed", "Skipped:".yellow(), track_ref);
            continue;
        }
        match item.request_delete().await {
            Ok(()) => println!("✓ {} deleted", track_ref.green()),
            Err(e) => {
                error!("Failed to delete {}: {}", track_ref, e);
                eprintln!("✗ {} - Error: {}", track_ref.red(), e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{} deletions failed", failures);
    }
    Ok(())
}
