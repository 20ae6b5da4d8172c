use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ChartCatalogEntry {
    pub id: u64,
    pub track_ref: String,
    pub name: String,
    pub author: String,
    pub charter: Option<String>,
    pub duration_seconds: f64,
    pub difficulty: f64,
    pub is_rated: bool,
    /// Primary ("mirror") download link.
    pub mirror_url: Option<String>,
    /// Secondary ("alternate") download link.
    pub download_url: Option<String>,
}

impl ChartCatalogEntry {
    pub fn resolve_url(&self, source: DownloadSource) -> Option<&str> {
        match source {
            DownloadSource::Auto => self.mirror_url.as_deref().or(self.download_url.as_deref()),
            DownloadSource::Primary => self.mirror_url.as_deref(),
            DownloadSource::Secondary => self.download_url.as_deref(),
        }
    }

    pub fn is_downloadable(&self) -> bool {
        self.resolve_url(DownloadSource::Auto).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DownloadSource {
    Auto,
    Primary,
    Secondary,
}

/// Content kind reported by a probe, taken from a MIME-like string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentKind(String);

impl ContentKind {
    pub fn parse(raw: &str) -> Self {
        let essence = raw.split(';').next().unwrap_or("").trim();
        let subtype = essence.rsplit('/').next().unwrap_or(essence);
        ContentKind(subtype.to_ascii_lowercase())
    }

    /// `zip`, `x-zip`, `zip-compressed` and `x-zip-compressed` all qualify.
    pub fn is_archive(&self) -> bool {
        self.0.ends_with("zip") || self.0.ends_with("zip-compressed")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileProbe {
    pub size_bytes: u64,
    pub content_kind: ContentKind,
}

impl FileProbe {
    pub fn size_label(&self) -> String {
        format_size(self.size_bytes)
    }
}

pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Byte counter shared between the pipeline (writer) and presentation (readers).
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter {
    inner: Arc<ProgressInner>,
}

#[derive(Debug, Default)]
struct ProgressInner {
    downloaded: AtomicU64,
    total: AtomicU64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: u64) {
        self.inner.total.store(total, Ordering::Relaxed);
    }

    pub fn advance(&self, bytes: u64) {
        self.inner.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.inner.downloaded.load(Ordering::Relaxed)
    }

    /// Zero when the length is unknown.
    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    pub fn fraction(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            None
        } else {
            Some((self.downloaded() as f64 / total as f64).min(1.0))
        }
    }

    pub fn same_as(&self, other: &ProgressCounter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Per-item lifecycle state seen by presentation.
#[derive(Debug, Clone)]
pub enum DownloadState {
    Waiting,
    Available { size_bytes: u64 },
    Unavailable,
    InProgress { progress: ProgressCounter },
    Owned,
}

impl DownloadState {
    pub fn label(&self) -> &'static str {
        match self {
            DownloadState::Waiting => "waiting",
            DownloadState::Available { .. } => "available",
            DownloadState::Unavailable => "unavailable",
            DownloadState::InProgress { .. } => "downloading",
            DownloadState::Owned => "owned",
        }
    }
}

impl PartialEq for DownloadState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DownloadState::Waiting, DownloadState::Waiting) => true,
            (DownloadState::Available { size_bytes: a }, DownloadState::Available { size_bytes: b }) => {
                a == b
            }
            (DownloadState::Unavailable, DownloadState::Unavailable) => true,
            (DownloadState::InProgress { progress: a }, DownloadState::InProgress { progress: b }) => {
                a.same_as(b)
            }
            (DownloadState::Owned, DownloadState::Owned) => true,
            _ => false,
        }
    }
}

pub type OutcomeCallback = Box<dyn FnOnce(bool) + Send + Sync + 'static>;

/// A download waiting for, or holding, an admission slot.
pub struct QueuedDownloadRequest {
    pub chart_id: u64,
    pub track_ref: String,
    pub source_url: String,
    pub progress: ProgressCounter,
    on_outcome: Option<OutcomeCallback>,
}

impl QueuedDownloadRequest {
    pub fn new(
        chart_id: u64,
        track_ref: impl Into<String>,
        source_url: impl Into<String>,
        progress: ProgressCounter,
        on_outcome: impl FnOnce(bool) + Send + Sync + 'static,
    ) -> Self {
        Self {
            chart_id,
            track_ref: track_ref.into(),
            source_url: source_url.into(),
            progress,
            on_outcome: Some(Box::new(on_outcome)),
        }
    }

    /// Hands the outcome callback to whoever will report the result. Only
    /// the first call returns it.
    pub fn take_outcome(&mut self) -> Option<OutcomeCallback> {
        self.on_outcome.take()
    }

    pub fn archive_name(&self) -> String {
        format!("{}.zip", self.chart_id)
    }
}

impl fmt::Debug for QueuedDownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedDownloadRequest")
            .field("chart_id", &self.chart_id)
            .field("track_ref", &self.track_ref)
            .field("source_url", &self.source_url)
            .finish_non_exhaustive()
    }
}
