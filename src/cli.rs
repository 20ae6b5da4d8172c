use crate::types::DownloadSource;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Catalog listing (TSV) to browse
    #[arg(short, long)]
    pub catalog: PathBuf,

    /// Directory holding installed charts
    #[arg(long, default_value = "CustomSongs")]
    pub content_dir: PathBuf,

    /// Scratch directory for downloaded archives
    #[arg(long, default_value = "Downloads")]
    pub scratch_dir: PathBuf,

    /// Number of concurrent downloads
    #[arg(short, long, default_value = "4")]
    pub parallelism: usize,

    /// Hide charts that are already installed
    #[arg(long)]
    pub not_owned_only: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show every chart in the catalog and whether it can be downloaded
    List,

    /// Download charts by track ref, or every available chart with --all
    Download {
        /// Download everything that is available
        #[arg(long)]
        all: bool,

        /// Which catalog link to use
        #[arg(short, long, value_enum, default_value = "auto")]
        source: DownloadSource,

        /// Track refs to download
        track_refs: Vec<String>,
    },

    /// Delete installed charts by track ref
    Delete {
        #[arg(required = true)]
        track_refs: Vec<String>,
    },
}
