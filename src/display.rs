use crate::item::ChartItem;
use crate::types::{format_size, DownloadState};
use colored::*;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const REFRESH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadReport {
    pub track_ref: String,
    pub installed: bool,
    pub bytes_downloaded: u64,
    pub duration: Duration,
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub reports: Vec<DownloadReport>,
    pub total_duration: Duration,
}

impl DownloadSummary {
    pub fn installed(&self) -> usize {
        self.reports.iter().filter(|r| r.installed).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.installed()
    }

    pub fn total_bytes(&self) -> u64 {
        self.reports.iter().map(|r| r.bytes_downloaded).sum()
    }
}

fn state_cell(state: &DownloadState) -> ColoredString {
    let label = format!("{:<12}", state.label());
    match state {
        DownloadState::Owned => label.green(),
        DownloadState::Available { .. } => label.cyan(),
        DownloadState::Unavailable => label.red(),
        DownloadState::Waiting | DownloadState::InProgress { .. } => label.yellow(),
    }
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

pub fn print_listing<'a>(items: impl Iterator<Item = &'a Arc<ChartItem>>) {
    println!(
        "{}",
        format!(
            "{:<12} {:<24} {:<40} {:>6} {:>5} {:>10}  {}",
            "STATE", "TRACK", "CHART", "LENGTH", "DIFF", "SIZE", "TYPE"
        )
        .bold()
    );
    let mut shown = 0;
    for item in items {
        let entry = item.entry();
        let state = item.state();
        let size = match &state {
            DownloadState::Available { size_bytes } => format_size(*size_bytes),
            _ => String::new(),
        };
        let kind = match item.probed_kind() {
            Some(kind) => kind.as_str().to_string(),
            None if !entry.is_downloadable() => "no link".to_string(),
            None => String::new(),
        };
        let mut title = format!("{} - {}", entry.name, entry.author);
        if let Some(charter) = &entry.charter {
            title.push_str(&format!(" ({})", charter));
        }
        let difficulty = if entry.is_rated {
            format!("{:.1}*", entry.difficulty)
        } else {
            format!("{:.1}", entry.difficulty)
        };
        println!(
            "{} {:<24} {:<40} {:>6} {:>5} {:>10}  {}",
            state_cell(&state),
            entry.track_ref,
            title,
            format_duration(entry.duration_seconds),
            difficulty,
            size,
            kind
        );
        shown += 1;
    }
    println!("\n{} charts (* rated)", shown);
}

fn create_progress_bar(track_ref: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(track_ref.to_string());
    pb
}

/// Mirrors an item's download progress onto a bar until it leaves
/// `InProgress`.
pub fn track_download(bars: &MultiProgress, item: Arc<ChartItem>) -> JoinHandle<DownloadReport> {
    let pb = bars.add(create_progress_bar(item.track_ref()));
    tokio::spawn(async move {
        let start_time = Instant::now();
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        let mut bytes_downloaded = 0;
        loop {
            ticker.tick().await;
            let state = item.state();
            let DownloadState::InProgress { progress } = &state else {
                let installed = state == DownloadState::Owned;
                if installed {
                    pb.finish_with_message(format!("{} installed", item.track_ref()));
                } else {
                    pb.finish_with_message(format!("{} failed", item.track_ref()));
                }
                return DownloadReport {
                    track_ref: item.track_ref().to_string(),
                    installed,
                    bytes_downloaded,
                    duration: start_time.elapsed(),
                };
            };
            bytes_downloaded = progress.downloaded();
            pb.set_length(progress.total());
            pb.set_position(bytes_downloaded);
            if let Some(fraction) = progress.fraction() {
                debug!("{}: {:.0}%", item.track_ref(), fraction * 100.0);
            }
        }
    })
}

pub fn print_summary(summary: &DownloadSummary) {
    let total = summary.reports.len().max(1) as f64;
    println!("\n{}", "Download Summary:".bold());
    println!("Total downloads: {} charts", summary.reports.len());
    println!(
        "Installed: {:.1}% ({} charts)",
        summary.installed() as f64 / total * 100.0,
        summary.installed().to_string().green()
    );
    println!(
        "Failed: {:.1}% ({} charts)",
        summary.failed() as f64 / total * 100.0,
        summary.failed().to_string().red()
    );
    println!("Total data transferred: {}", format_size(summary.total_bytes()));
    println!("Total duration: {:.2?}", summary.total_duration);

    if summary.installed() > 0 {
        println!("\n{}", "Installed:".green().bold());
        for report in summary.reports.iter().filter(|r| r.installed) {
            println!(
                "✓ {} ({} in {:.2?})",
                report.track_ref.green(),
                format_size(report.bytes_downloaded),
                report.duration
            );
        }
    }

    if summary.failed() > 0 {
        println!("\n{}", "Failed:".red().bold());
        for report in summary.reports.iter().filter(|r| !r.installed) {
            println!("✗ {}", report.track_ref.red());
        }
    }
}
