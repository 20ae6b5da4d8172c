use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChartError {
    #[error("Failed to parse catalog file: {0}")]
    ParseError(String),

    #[error("No download link found for {0}")]
    NoDownloadUrl(String),

    #[error("{track_ref} is busy ({state})")]
    Busy { track_ref: String, state: &'static str },

    #[error("{0} is not a deletable local chart")]
    NotDeletable(String),

    #[error("{0} has no resolvable local directory")]
    NoLocalDirectory(String),

    #[error("Refusing to delete {path:?}: not inside the content directory")]
    OutsideContentDirectory { path: PathBuf },

    #[error("Delete failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Library reload failed: {0}")]
    Reload(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

/// Failure categories surfaced by the filesystem primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Io,
    Permission,
    InvalidArchive,
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Io => "io",
            FailureKind::Permission => "permission",
            FailureKind::InvalidArchive => "invalid archive",
            FailureKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
#[error("{kind} error: {message}")]
pub struct StorageError {
    pub kind: FailureKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::PermissionDenied => FailureKind::Permission,
            std::io::ErrorKind::Other => FailureKind::Unknown,
            _ => FailureKind::Io,
        };
        StorageError::new(kind, e.to_string())
    }
}

impl From<zip::result::ZipError> for StorageError {
    fn from(e: zip::result::ZipError) -> Self {
        use zip::result::ZipError;
        match e {
            ZipError::Io(io) => io.into(),
            ZipError::InvalidArchive(msg) => StorageError::new(FailureKind::InvalidArchive, msg),
            ZipError::UnsupportedArchive(msg) => {
                StorageError::new(FailureKind::InvalidArchive, msg)
            }
            other => StorageError::new(FailureKind::Unknown, other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("HTTP error: {status} for URL: {url}")]
    Status { status: u16, url: String },

    #[error("Missing {header} header for URL: {url}")]
    MissingHeader { header: &'static str, url: String },

    #[error("Catalog request failed: {0}")]
    Other(String),
}

/// Pipeline stage at which a download stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transfer,
    CreateDir,
    Write,
    Extract,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Transfer => "transfer",
            Stage::CreateDir => "create download directory",
            Stage::Write => "write archive",
            Stage::Extract => "extract archive",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("{stage} failed: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StorageError,
    },
}

impl PipelineError {
    pub fn at(stage: Stage) -> impl FnOnce(StorageError) -> PipelineError {
        move |source| PipelineError::Storage { stage, source }
    }

    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Transfer(_) => Stage::Transfer,
            PipelineError::Storage { stage, .. } => *stage,
        }
    }

    /// The short notice shown to the user for this failure.
    pub fn notice(&self) -> &'static str {
        match self {
            PipelineError::Transfer(_) => "Download failed.",
            PipelineError::Storage { stage, source } => match (stage, source.kind) {
                (Stage::CreateDir, FailureKind::Permission) => {
                    "Insufficient permissions while creating download directory"
                }
                (Stage::CreateDir, FailureKind::Io) => "IO error creating download directory",
                (Stage::CreateDir, _) => "Unknown error creating download directory (check logs!)",
                (Stage::Write, FailureKind::Permission) => {
                    "Insufficient permissions while writing ZIP archive"
                }
                (Stage::Write, FailureKind::Io) => "IO error writing ZIP archive",
                (Stage::Write, _) => "Unknown error writing ZIP archive (check logs!)",
                (Stage::Extract, FailureKind::InvalidArchive) => {
                    "Downloaded file was not a ZIP archive"
                }
                (Stage::Extract, FailureKind::Permission) => {
                    "Insufficient permissions while extracting ZIP archive"
                }
                (Stage::Extract, FailureKind::Io) => "IO error extracting ZIP archive",
                (Stage::Extract, FailureKind::Unknown) => {
                    "Unknown error extracting ZIP archive (check logs!)"
                }
                (Stage::Transfer, _) => "Download failed.",
            },
        }
    }
}
