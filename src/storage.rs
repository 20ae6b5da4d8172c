use crate::error::{FailureKind, StorageError};
use log::{debug, warn};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub async fn ensure_dir(dir: &Path) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

pub async fn write_bytes(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// Unpacks a zip archive into `destination` on the blocking pool.
///
/// Returns the number of files written.
pub async fn extract_archive(archive: &Path, destination: &Path) -> Result<usize, StorageError> {
    let archive = archive.to_path_buf();
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || extract_zip(&archive, &destination))
        .await
        .map_err(|e| StorageError::new(FailureKind::Unknown, e.to_string()))?
}

fn extract_zip(archive_path: &Path, destination: &Path) -> Result<usize, StorageError> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(destination)?;

    let mut written = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!("Skipping unsafe archive entry: {}", entry.name());
            continue;
        };
        let out_path = destination.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
        written += 1;
    }
    debug!("Extracted {} files from {}", written, archive_path.display());
    Ok(written)
}

pub fn remove_file(path: &Path) -> Result<(), StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn remove_dir_tree(dir: &Path) -> Result<(), StorageError> {
    tokio::fs::remove_dir_all(dir).await?;
    Ok(())
}

/// True when `candidate` lies strictly below `root` once both are
/// canonicalised. Unresolvable paths are never descendants.
pub async fn is_descendant(root: &Path, candidate: &Path) -> bool {
    let (Ok(root), Ok(candidate)) = (
        tokio::fs::canonicalize(root).await,
        tokio::fs::canonicalize(candidate).await,
    ) else {
        return false;
    };
    candidate != root && candidate.starts_with(&root)
}

/// A scratch archive on disk. Call [`ScratchFile::remove`] when done; a
/// guard dropped without it removes the file synchronously.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        let path = std::mem::take(&mut self.path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed scratch file {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete scratch file {}: {}", path.display(), e),
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = remove_file(&self.path) {
            warn!("Failed to delete scratch file {}: {}", self.path.display(), e);
        } else {
            debug!("Removed scratch file {}", self.path.display());
        }
    }
}
