use crate::catalog::CatalogService;
use crate::error::{PipelineError, Stage};
use crate::notify::Notifier;
use crate::storage::{self, ScratchFile};
use crate::types::QueuedDownloadRequest;
use log::{debug, error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Transfer → persist → extract → cleanup for one admitted request.
pub struct DownloadPipeline {
    catalog: Arc<dyn CatalogService>,
    scratch_dir: PathBuf,
    content_dir: PathBuf,
    notifier: Arc<dyn Notifier>,
}

impl DownloadPipeline {
    pub fn new(
        catalog: Arc<dyn CatalogService>,
        scratch_dir: PathBuf,
        content_dir: PathBuf,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            catalog,
            scratch_dir,
            content_dir,
            notifier,
        }
    }

    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    /// Runs every stage and reports success. Failures are logged and
    /// surfaced as a notice; they never escape.
    pub async fn run(&self, request: &QueuedDownloadRequest) -> bool {
        let start_time = Instant::now();
        info!(
            "Starting download: {} from {}",
            request.track_ref, request.source_url
        );

        match self.execute(request).await {
            Ok(files) => {
                info!(
                    "Installed {} ({} files, {} bytes) in {:.2?}",
                    request.track_ref,
                    files,
                    request.progress.downloaded(),
                    start_time.elapsed()
                );
                true
            }
            Err(e) => {
                error!(
                    "Download failed for {} during {}: {}",
                    request.track_ref,
                    e.stage(),
                    e
                );
                self.notifier.notify(e.notice());
                false
            }
        }
    }

    async fn execute(&self, request: &QueuedDownloadRequest) -> Result<usize, PipelineError> {
        let data = self
            .catalog
            .fetch_archive(&request.source_url, &request.progress)
            .await
            .map_err(|e| PipelineError::Transfer(e.to_string()))?;
        if data.is_empty() {
            return Err(PipelineError::Transfer(format!(
                "empty response from {}",
                request.source_url
            )));
        }

        storage::ensure_dir(&self.scratch_dir)
            .await
            .map_err(PipelineError::at(Stage::CreateDir))?;

        let scratch = ScratchFile::new(self.scratch_dir.join(request.archive_name()));
        let installed = self.install(&scratch, data).await;
        scratch.remove().await;
        installed
    }

    async fn install(&self, scratch: &ScratchFile, data: Vec<u8>) -> Result<usize, PipelineError> {
        storage::write_bytes(scratch.path(), &data)
            .await
            .map_err(PipelineError::at(Stage::Write))?;
        drop(data);
        debug!("Wrote {}", scratch.path().display());

        storage::extract_archive(scratch.path(), &self.content_dir)
            .await
            .map_err(PipelineError::at(Stage::Extract))
    }
}
