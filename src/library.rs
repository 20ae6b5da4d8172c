use crate::error::ChartError;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Chart metadata file every installed chart folder carries.
pub const CHART_METADATA_FILE: &str = "song.tmb";

/// The host's index of installed charts.
#[async_trait]
pub trait LibraryIndex: Send + Sync {
    fn is_track_present(&self, track_ref: &str) -> bool;

    fn resolve_local_directory(&self, track_ref: &str) -> Option<PathBuf>;

    /// Re-scans installed content. Returns the number of tracks found.
    async fn reload(&self) -> Result<usize, ChartError>;
}

#[derive(Debug, Deserialize)]
struct ChartMetadata {
    #[serde(rename = "trackRef")]
    track_ref: String,
}

/// Library backed by the folders of a content directory.
pub struct DirectoryLibrary {
    content_dir: PathBuf,
    tracks: RwLock<HashMap<String, PathBuf>>,
}

impl DirectoryLibrary {
    pub async fn open(content_dir: &Path) -> Result<Self, ChartError> {
        let library = Self {
            content_dir: content_dir.to_path_buf(),
            tracks: RwLock::new(HashMap::new()),
        };
        library.reload().await?;
        Ok(library)
    }

    async fn scan(&self) -> Result<HashMap<String, PathBuf>, ChartError> {
        let mut tracks = HashMap::new();
        if !tokio::fs::try_exists(&self.content_dir).await? {
            return Ok(tracks);
        }

        let mut dir = tokio::fs::read_dir(&self.content_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let folder = entry.path();
            let metadata_path = folder.join(CHART_METADATA_FILE);
            let raw = match tokio::fs::read_to_string(&metadata_path).await {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("Skipping {}: {}", folder.display(), e);
                    continue;
                }
            };
            match serde_json::from_str::<ChartMetadata>(&raw) {
                Ok(meta) => {
                    tracks.insert(meta.track_ref, folder);
                }
                Err(e) => warn!("Unreadable {}: {}", metadata_path.display(), e),
            }
        }
        Ok(tracks)
    }
}

#[async_trait]
impl LibraryIndex for DirectoryLibrary {
    fn is_track_present(&self, track_ref: &str) -> bool {
        self.tracks
            .read()
            .map(|tracks| tracks.contains_key(track_ref))
            .unwrap_or(false)
    }

    fn resolve_local_directory(&self, track_ref: &str) -> Option<PathBuf> {
        self.tracks
            .read()
            .ok()
            .and_then(|tracks| tracks.get(track_ref).cloned())
    }

    async fn reload(&self) -> Result<usize, ChartError> {
        let scanned = self.scan().await.map_err(|e| {
            ChartError::Reload(format!("{}: {}", self.content_dir.display(), e))
        })?;
        let count = scanned.len();
        match self.tracks.write() {
            Ok(mut tracks) => *tracks = scanned,
            Err(poisoned) => *poisoned.into_inner() = scanned,
        }
        info!(
            "Indexed {} charts in {}",
            count,
            self.content_dir.display()
        );
        Ok(count)
    }
}
