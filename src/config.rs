use crate::cli::Cli;
use crate::queue::MAX_CONCURRENT_DOWNLOADS;
use anyhow::{bail, Result};
use std::path::PathBuf;

/// Runtime settings resolved from the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    pub content_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub parallelism: usize,
    pub not_owned_only: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            content_dir: PathBuf::from("CustomSongs"),
            scratch_dir: PathBuf::from("Downloads"),
            parallelism: MAX_CONCURRENT_DOWNLOADS,
            not_owned_only: false,
        }
    }
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if cli.parallelism == 0 {
            bail!("--parallelism must be at least 1");
        }
        if cli.content_dir == cli.scratch_dir {
            bail!("content and scratch directories must differ");
        }
        Ok(Self {
            content_dir: cli.content_dir.clone(),
            scratch_dir: cli.scratch_dir.clone(),
            parallelism: cli.parallelism,
            not_owned_only: cli.not_owned_only,
        })
    }
}
