use crate::catalog::CatalogService;
use crate::error::{CatalogError, ChartError};
use crate::ledger::LibraryLedger;
use crate::library::LibraryIndex;
use crate::notify::Notifier;
use crate::queue::{Admission, DownloadQueue};
use crate::storage;
use crate::types::{
    ChartCatalogEntry, ContentKind, DownloadSource, DownloadState, FileProbe, ProgressCounter,
    QueuedDownloadRequest,
};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// "Not owned only" listing filter.
#[derive(Debug, Default)]
pub struct VisibilityFilter {
    not_owned_only: AtomicBool,
}

impl VisibilityFilter {
    pub fn new(not_owned_only: bool) -> Self {
        Self {
            not_owned_only: AtomicBool::new(not_owned_only),
        }
    }

    pub fn set_not_owned_only(&self, value: bool) {
        self.not_owned_only.store(value, Ordering::Relaxed);
    }

    pub fn not_owned_only(&self) -> bool {
        self.not_owned_only.load(Ordering::Relaxed)
    }

    pub fn is_visible(&self, owned: bool) -> bool {
        !(self.not_owned_only() && owned)
    }
}

pub struct ItemContext {
    pub queue: Arc<DownloadQueue>,
    pub catalog: Arc<dyn CatalogService>,
    pub library: Arc<dyn LibraryIndex>,
    pub ledger: Arc<LibraryLedger>,
    pub filter: Arc<VisibilityFilter>,
    pub notifier: Arc<dyn Notifier>,
    pub content_dir: PathBuf,
}

impl ItemContext {
    /// Present in the library and not deleted since, or downloaded since the
    /// library was last loaded.
    pub fn is_present_locally(&self, track_ref: &str) -> bool {
        (self.library.is_track_present(track_ref) && !self.ledger.is_pending_removal(track_ref))
            || self.ledger.is_pending_add(track_ref)
    }
}

#[derive(Debug, Clone)]
struct ProbeHandle {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug)]
enum FileProbeState {
    Unset,
    Pending { handle: ProbeHandle },
    Resolved { size_bytes: u64, content_kind: ContentKind },
    Failed,
}

#[derive(Debug)]
struct ItemInner {
    state: DownloadState,
    probe: FileProbeState,
    next_generation: u64,
    visible: bool,
    deleting: bool,
}

impl ItemInner {
    fn cancel_probe(&mut self) {
        if let FileProbeState::Pending { handle } = &self.probe {
            handle.token.cancel();
        }
    }

    fn known_size(&self) -> Option<u64> {
        match &self.probe {
            FileProbeState::Resolved { size_bytes, .. } => Some(*size_bytes),
            FileProbeState::Unset | FileProbeState::Pending { .. } | FileProbeState::Failed => None,
        }
    }
}

/// One chart in a listing, independent of how it is drawn.
pub struct ChartItem {
    entry: ChartCatalogEntry,
    ctx: Arc<ItemContext>,
    inner: Mutex<ItemInner>,
    state_tx: watch::Sender<DownloadState>,
}

impl ChartItem {
    /// Must be called inside a tokio runtime: items that are not owned
    /// start probing right away.
    pub fn new(entry: ChartCatalogEntry, ctx: Arc<ItemContext>) -> Arc<Self> {
        let owned = ctx.is_present_locally(&entry.track_ref);
        let state = if owned {
            DownloadState::Owned
        } else {
            DownloadState::Waiting
        };
        let visible = ctx.filter.is_visible(owned);
        let (state_tx, _) = watch::channel(state.clone());

        let item = Arc::new(Self {
            entry,
            ctx,
            inner: Mutex::new(ItemInner {
                state,
                probe: FileProbeState::Unset,
                next_generation: 0,
                visible,
                deleting: false,
            }),
            state_tx,
        });
        if !owned {
            item.start_probe();
        }
        item
    }

    fn lock(&self) -> MutexGuard<'_, ItemInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, inner: &mut ItemInner, next: DownloadState) {
        debug!(
            "{}: {} -> {}",
            self.entry.track_ref,
            inner.state.label(),
            next.label()
        );
        inner.state = next.clone();
        self.state_tx.send_replace(next);
    }

    pub fn entry(&self) -> &ChartCatalogEntry {
        &self.entry
    }

    pub fn track_ref(&self) -> &str {
        &self.entry.track_ref
    }

    pub fn state(&self) -> DownloadState {
        self.lock().state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.state_tx.subscribe()
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.lock().state, DownloadState::Owned)
    }

    pub fn is_download_available(&self) -> bool {
        matches!(self.lock().state, DownloadState::Available { .. })
    }

    pub fn is_visible(&self) -> bool {
        self.lock().visible
    }

    pub async fn wait_until(&self, pred: impl Fn(&DownloadState) -> bool) -> DownloadState {
        let mut rx = self.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if pred(&*state) {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    pub fn probed_kind(&self) -> Option<ContentKind> {
        match &self.lock().probe {
            FileProbeState::Resolved { content_kind, .. } => Some(content_kind.clone()),
            FileProbeState::Unset | FileProbeState::Pending { .. } | FileProbeState::Failed => None,
        }
    }

    pub fn apply_filter(&self) {
        let mut inner = self.lock();
        let owned = matches!(inner.state, DownloadState::Owned);
        inner.visible = self.ctx.filter.is_visible(owned);
    }

    /// Issues a metadata probe against the automatic source. Does nothing
    /// unless the probe state is `Unset`.
    fn start_probe(self: &Arc<Self>) {
        let Some(url) = self
            .entry
            .resolve_url(DownloadSource::Auto)
            .map(str::to_string)
        else {
            warn!(
                "{} cannot be downloaded: No download link found.",
                self.entry.track_ref
            );
            let mut inner = self.lock();
            inner.probe = FileProbeState::Failed;
            self.transition(&mut inner, DownloadState::Unavailable);
            return;
        };

        let handle = {
            let mut inner = self.lock();
            if !matches!(inner.probe, FileProbeState::Unset) {
                return;
            }
            inner.next_generation += 1;
            let handle = ProbeHandle {
                generation: inner.next_generation,
                token: CancellationToken::new(),
            };
            inner.probe = FileProbeState::Pending {
                handle: handle.clone(),
            };
            self.transition(&mut inner, DownloadState::Waiting);
            handle
        };

        let item = Arc::downgrade(self);
        let catalog = Arc::clone(&self.ctx.catalog);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = handle.token.cancelled() => return,
                result = catalog.probe_file(&url) => result,
            };
            if let Some(item) = item.upgrade() {
                item.on_probe_outcome(handle.generation, &url, result);
            }
        });
    }

    /// Applies a probe result if it belongs to the live pending probe.
    fn on_probe_outcome(
        &self,
        generation: u64,
        url: &str,
        result: Result<FileProbe, CatalogError>,
    ) {
        let mut inner = self.lock();
        let current = matches!(
            &inner.probe,
            FileProbeState::Pending { handle }
                if handle.generation == generation && !handle.token.is_cancelled()
        );
        if !current {
            debug!(
                "{}: discarding stale probe result",
                self.entry.track_ref
            );
            return;
        }

        match result {
            Ok(probe) if probe.content_kind.is_archive() => {
                debug!(
                    "{}: {} archive available",
                    self.entry.track_ref,
                    probe.size_label()
                );
                inner.probe = FileProbeState::Resolved {
                    size_bytes: probe.size_bytes,
                    content_kind: probe.content_kind,
                };
                self.transition(
                    &mut inner,
                    DownloadState::Available {
                        size_bytes: probe.size_bytes,
                    },
                );
            }
            Ok(probe) => {
                warn!(
                    "{} cannot be downloaded: File is not zip: {}.",
                    self.entry.track_ref, probe.content_kind
                );
                inner.probe = FileProbeState::Failed;
                self.transition(&mut inner, DownloadState::Unavailable);
            }
            Err(e) => {
                warn!(
                    "{} cannot be downloaded: Couldn't access file at {}: {}",
                    self.entry.track_ref, url, e
                );
                inner.probe = FileProbeState::Failed;
                self.transition(&mut inner, DownloadState::Unavailable);
            }
        }
    }

    pub fn request_download(
        self: &Arc<Self>,
        source: DownloadSource,
    ) -> Result<Admission, ChartError> {
        let Some(url) = self.entry.resolve_url(source).map(str::to_string) else {
            warn!(
                "{}: no {:?} download link",
                self.entry.track_ref, source
            );
            self.ctx.notifier.notify("No download link found.");
            return Err(ChartError::NoDownloadUrl(self.entry.track_ref.clone()));
        };

        let progress = ProgressCounter::new();
        {
            let mut inner = self.lock();
            if inner.deleting {
                return Err(ChartError::Busy {
                    track_ref: self.entry.track_ref.clone(),
                    state: "deleting",
                });
            }
            match &inner.state {
                DownloadState::Waiting | DownloadState::InProgress { .. } => {
                    return Err(ChartError::Busy {
                        track_ref: self.entry.track_ref.clone(),
                        state: inner.state.label(),
                    });
                }
                DownloadState::Available { .. }
                | DownloadState::Unavailable
                | DownloadState::Owned => {}
            }
            self.transition(
                &mut inner,
                DownloadState::InProgress {
                    progress: progress.clone(),
                },
            );
        }

        let item = Arc::clone(self);
        let request = QueuedDownloadRequest::new(
            self.entry.id,
            self.entry.track_ref.clone(),
            url,
            progress,
            move |success| item.on_pipeline_outcome(success),
        );
        Ok(self.ctx.queue.enqueue(request))
    }

    pub fn cancel_download(&self) -> bool {
        self.ctx.queue.cancel_queued(self.entry.id)
    }

    pub fn on_pipeline_outcome(&self, success: bool) {
        let mut inner = self.lock();
        if success {
            info!("{} downloaded", self.entry.track_ref);
            self.transition(&mut inner, DownloadState::Owned);
            self.ctx.ledger.mark_downloaded(&self.entry.track_ref);
            inner.visible = self.ctx.filter.is_visible(true);
            return;
        }

        // The artifact exists upstream; only this attempt failed.
        let attempted = match &inner.state {
            DownloadState::InProgress { progress } => progress.total(),
            _ => 0,
        };
        let size_bytes = inner.known_size().unwrap_or(attempted);
        self.transition(&mut inner, DownloadState::Available { size_bytes });
        inner.visible = self.ctx.filter.is_visible(false);
    }

    /// Removes the chart's local folder, then re-probes upstream.
    ///
    /// Downloads are refused until this returns.
    pub async fn request_delete(self: &Arc<Self>) -> Result<(), ChartError> {
        let track_ref = self.entry.track_ref.as_str();
        {
            let mut inner = self.lock();
            if let DownloadState::InProgress { .. } = inner.state {
                return Err(ChartError::Busy {
                    track_ref: track_ref.to_string(),
                    state: "downloading",
                });
            }
            if inner.deleting {
                return Err(ChartError::Busy {
                    track_ref: track_ref.to_string(),
                    state: "deleting",
                });
            }
            inner.deleting = true;
        }
        let _deleting = DeletingGuard(self);

        if !self.ctx.library.is_track_present(track_ref)
            || self.ctx.ledger.is_pending_removal(track_ref)
        {
            return Err(ChartError::NotDeletable(track_ref.to_string()));
        }
        let Some(dir) = self.ctx.library.resolve_local_directory(track_ref) else {
            warn!("{}: no local directory to delete", track_ref);
            self.ctx.notifier.notify("Couldn't find chart folder to delete");
            return Err(ChartError::NoLocalDirectory(track_ref.to_string()));
        };
        if !storage::is_descendant(&self.ctx.content_dir, &dir).await {
            warn!(
                "{}: refusing to delete {} outside {}",
                track_ref,
                dir.display(),
                self.ctx.content_dir.display()
            );
            self.ctx
                .notifier
                .notify("Refusing to delete a folder outside the songs directory");
            return Err(ChartError::OutsideContentDirectory { path: dir });
        }

        if let Err(e) = storage::remove_dir_tree(&dir).await {
            warn!("{}: failed to delete {}: {}", track_ref, dir.display(), e);
            self.ctx.notifier.notify("Failed to delete chart (check logs!)");
            return Err(e.into());
        }
        info!("Deleted {} ({})", track_ref, dir.display());
        self.ctx.ledger.mark_deleted(track_ref);

        {
            let mut inner = self.lock();
            inner.cancel_probe();
            inner.probe = FileProbeState::Unset;
            inner.visible = self.ctx.filter.is_visible(false);
            inner.deleting = false;
        }
        self.start_probe();
        Ok(())
    }

    /// Cancels any pending probe. Safe to call more than once.
    pub fn dispose(&self) {
        self.lock().cancel_probe();
    }
}

/// Clears the deleting flag however `request_delete` exits.
struct DeletingGuard<'a>(&'a ChartItem);

impl Drop for DeletingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().deleting = false;
    }
}

impl Drop for ChartItem {
    fn drop(&mut self) {
        match self.inner.get_mut() {
            Ok(inner) => inner.cancel_probe(),
            Err(poisoned) => poisoned.into_inner().cancel_probe(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::queue::MAX_CONCURRENT_DOWNLOADS;
    use crate::storage::test_support::zip_bytes;

    fn not_waiting(state: &DownloadState) -> bool {
        !matches!(state, DownloadState::Waiting)
    }

    fn settled_download(state: &DownloadState) -> bool {
        !matches!(
            state,
            DownloadState::Waiting | DownloadState::InProgress { .. }
        )
    }

    #[tokio::test]
    async fn probes_the_alternate_link_when_mirror_is_missing() {
        let world = World::new(4);
        world.catalog.probe_ok("http://x/a.zip", 2048, "zip");

        let item = ChartItem::new(entry(1, None, Some("http://x/a.zip")), world.ctx.clone());
        let state = item.wait_until(not_waiting).await;
        assert_eq!(state, DownloadState::Available { size_bytes: 2048 });
        assert!(item.is_download_available());
        assert_eq!(item.probed_kind(), Some(ContentKind::parse("zip")));
        assert_eq!(world.catalog.probe_calls(), 1);
    }

    #[tokio::test]
    async fn non_archive_or_failed_probe_is_unavailable() {
        let world = World::new(4);
        world.catalog.probe_ok("http://x/page", 512, "text/html");
        world.catalog.probe_err("http://x/down.zip");

        let html = ChartItem::new(entry(1, Some("http://x/page"), None), world.ctx.clone());
        let down = ChartItem::new(entry(2, Some("http://x/down.zip"), None), world.ctx.clone());
        assert_eq!(html.wait_until(not_waiting).await, DownloadState::Unavailable);
        assert_eq!(down.wait_until(not_waiting).await, DownloadState::Unavailable);
    }

    #[tokio::test]
    async fn owned_items_skip_the_probe() {
        let world = World::new(4);
        world.library.insert("track1", None);
        world.ledger.mark_downloaded("track2");

        let installed = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        let fresh = ChartItem::new(entry(2, Some("http://x/2.zip"), None), world.ctx.clone());
        settle().await;
        assert_eq!(installed.state(), DownloadState::Owned);
        assert_eq!(fresh.state(), DownloadState::Owned);
        assert_eq!(world.catalog.probe_calls(), 0);
    }

    #[tokio::test]
    async fn deleted_this_session_is_not_owned() {
        let world = World::new(4);
        world.library.insert("track1", None);
        world.ledger.mark_deleted("track1");
        world.catalog.probe_ok("http://x/1.zip", 10, "application/zip");

        let item = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        assert_eq!(
            item.wait_until(not_waiting).await,
            DownloadState::Available { size_bytes: 10 }
        );
    }

    #[tokio::test]
    async fn no_links_means_unavailable_and_download_is_refused() {
        let world = World::new(4);
        let item = ChartItem::new(entry(1, None, None), world.ctx.clone());
        assert_eq!(item.state(), DownloadState::Unavailable);

        let err = item.request_download(DownloadSource::Auto).unwrap_err();
        assert!(matches!(err, ChartError::NoDownloadUrl(_)));
        assert_eq!(item.state(), DownloadState::Unavailable);
        assert_eq!(
            world.notifier.messages(),
            vec!["No download link found.".to_string()]
        );
        assert_eq!(world.catalog.probe_calls(), 0);
    }

    #[tokio::test]
    async fn successful_download_owns_and_records_in_ledger() {
        let world = World::new(4);
        world.ctx.filter.set_not_owned_only(true);
        world.catalog.probe_ok("http://x/5.zip", 100, "application/x-zip-compressed");
        world
            .catalog
            .body("http://x/5.zip", zip_bytes(&[("Five/song.tmb", "{}")]));

        let item = ChartItem::new(entry(5, Some("http://x/5.zip"), None), world.ctx.clone());
        item.wait_until(not_waiting).await;
        assert!(item.is_visible());

        assert_eq!(
            item.request_download(DownloadSource::Auto).unwrap(),
            Admission::Started
        );
        assert!(matches!(item.state(), DownloadState::InProgress { .. }));
        assert_eq!(item.wait_until(settled_download).await, DownloadState::Owned);
        assert!(world.ledger.is_pending_add("track5"));
        assert!(!item.is_visible());
        assert!(world.content_dir().join("Five/song.tmb").exists());
    }

    #[tokio::test]
    async fn invalid_archive_reverts_to_available() {
        let world = World::new(4);
        world.catalog.probe_ok("http://x/42.zip", 2048, "zip");
        world.catalog.body("http://x/42.zip", b"garbage".to_vec());

        let item = ChartItem::new(entry(42, Some("http://x/42.zip"), None), world.ctx.clone());
        item.wait_until(not_waiting).await;
        item.request_download(DownloadSource::Auto).unwrap();

        assert_eq!(
            item.wait_until(settled_download).await,
            DownloadState::Available { size_bytes: 2048 }
        );
        assert!(!world.tmp.path().join("Downloads/42.zip").exists());
        assert!(!world.ledger.is_pending_add("track42"));
        assert_eq!(
            world.notifier.messages(),
            vec!["Downloaded file was not a ZIP archive".to_string()]
        );
    }

    #[tokio::test]
    async fn download_is_refused_while_probing() {
        let world = World::new(4);
        let gate = world.catalog.gate_probe("http://x/1.zip");
        world.catalog.probe_ok("http://x/1.zip", 1, "zip");

        let item = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        let err = item.request_download(DownloadSource::Auto).unwrap_err();
        assert!(matches!(err, ChartError::Busy { .. }));

        gate.notify_one();
        item.wait_until(not_waiting).await;
    }

    #[tokio::test]
    async fn only_one_probe_is_ever_pending() {
        let world = World::new(4);
        let gate = world.catalog.gate_probe("http://x/1.zip");
        world.catalog.probe_ok("http://x/1.zip", 1, "zip");

        let item = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        item.start_probe();
        item.start_probe();
        settle().await;
        assert_eq!(world.catalog.probe_calls(), 1);

        gate.notify_one();
        item.wait_until(not_waiting).await;
        item.start_probe();
        settle().await;
        assert_eq!(world.catalog.probe_calls(), 1);
    }

    #[tokio::test]
    async fn disposed_items_discard_late_probe_results() {
        let world = World::new(4);
        let gate = world.catalog.gate_probe("http://x/1.zip");
        world.catalog.probe_ok("http://x/1.zip", 1, "zip");

        let item = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        settle().await;
        item.dispose();
        item.dispose();
        gate.notify_one();
        settle().await;
        assert_eq!(item.state(), DownloadState::Waiting);

        // A stale generation is ignored as well.
        item.on_probe_outcome(
            99,
            "http://x/1.zip",
            Ok(FileProbe {
                size_bytes: 1,
                content_kind: ContentKind::parse("zip"),
            }),
        );
        assert_eq!(item.state(), DownloadState::Waiting);
    }

    #[tokio::test]
    async fn delete_outside_content_dir_is_refused() {
        let world = World::new(4);
        let outside = world.tmp.path().join("Elsewhere");
        std::fs::create_dir_all(&outside).unwrap();
        world.library.insert("track1", Some(outside.clone()));

        let item = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        let err = item.request_delete().await.unwrap_err();
        assert!(matches!(err, ChartError::OutsideContentDirectory { .. }));
        assert!(outside.exists());
        assert_eq!(item.state(), DownloadState::Owned);
        assert!(!world.ledger.has_churn());
    }

    #[tokio::test]
    async fn delete_refuses_content_dir_itself_and_missing_folders() {
        let world = World::new(4);
        world.library.insert("track1", Some(world.content_dir()));
        world.library.insert("track2", None);

        let root = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        assert!(matches!(
            root.request_delete().await.unwrap_err(),
            ChartError::OutsideContentDirectory { .. }
        ));
        assert!(world.content_dir().exists());

        let unresolved = ChartItem::new(entry(2, Some("http://x/2.zip"), None), world.ctx.clone());
        assert!(matches!(
            unresolved.request_delete().await.unwrap_err(),
            ChartError::NoLocalDirectory(_)
        ));
        assert_eq!(unresolved.state(), DownloadState::Owned);

        let unknown = ChartItem::new(entry(3, None, None), world.ctx.clone());
        assert!(matches!(
            unknown.request_delete().await.unwrap_err(),
            ChartError::NotDeletable(_)
        ));
    }

    #[tokio::test]
    async fn delete_removes_folder_and_reprobes() {
        let world = World::new(4);
        let folder = world.content_dir().join("One");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("song.tmb"), "{}").unwrap();
        world.library.insert("track1", Some(folder.clone()));
        world.catalog.probe_ok("http://x/1.zip", 4096, "zip");

        let item = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        assert_eq!(item.state(), DownloadState::Owned);

        item.request_delete().await.unwrap();
        assert!(!folder.exists());
        assert!(world.ledger.is_pending_removal("track1"));
        assert_eq!(
            item.wait_until(not_waiting).await,
            DownloadState::Available { size_bytes: 4096 }
        );

        // Already gone as far as this session is concerned.
        assert!(matches!(
            item.request_delete().await.unwrap_err(),
            ChartError::NotDeletable(_)
        ));
    }

    #[tokio::test]
    async fn delete_is_refused_while_downloading() {
        let world = World::new(4);
        let folder = world.content_dir().join("One");
        std::fs::create_dir_all(&folder).unwrap();
        world.library.insert("track1", Some(folder.clone()));
        let gate = world.catalog.gate("http://x/1.zip");

        let item = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        item.request_download(DownloadSource::Primary).unwrap();
        assert!(matches!(
            item.request_delete().await.unwrap_err(),
            ChartError::Busy { .. }
        ));
        assert!(folder.exists());

        gate.notify_one();
        item.wait_until(settled_download).await;
    }

    #[tokio::test]
    async fn cancelling_a_queued_download_makes_it_available_again() {
        let world = World::new(1);
        world.catalog.probe_ok("http://x/1.zip", 1, "zip");
        world.catalog.probe_ok("http://x/2.zip", 2, "zip");
        let gate = world.catalog.gate("http://x/1.zip");

        let first = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        let second = ChartItem::new(entry(2, Some("http://x/2.zip"), None), world.ctx.clone());
        first.wait_until(not_waiting).await;
        second.wait_until(not_waiting).await;

        assert_eq!(
            first.request_download(DownloadSource::Auto).unwrap(),
            Admission::Started
        );
        assert_eq!(
            second.request_download(DownloadSource::Auto).unwrap(),
            Admission::Queued { position: 0 }
        );
        assert!(second.cancel_download());
        assert_eq!(second.state(), DownloadState::Available { size_bytes: 2 });
        assert!(!first.cancel_download());

        gate.notify_one();
        first.wait_until(settled_download).await;
    }

    #[tokio::test]
    async fn download_is_refused_while_delete_is_in_flight() {
        let world = World::new(4);
        let folder = world.content_dir().join("One");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("song.tmb"), "{}").unwrap();
        world.library.insert("track1", Some(folder.clone()));
        world.catalog.probe_ok("http://x/1.zip", 4096, "zip");

        let item = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        assert_eq!(item.state(), DownloadState::Owned);

        let deleting = Arc::clone(&item);
        let delete = tokio::spawn(async move { deleting.request_delete().await });
        tokio::task::yield_now().await;

        let err = item.request_download(DownloadSource::Auto).unwrap_err();
        assert!(matches!(err, ChartError::Busy { state: "deleting", .. }));
        assert!(matches!(
            item.request_delete().await.unwrap_err(),
            ChartError::Busy { state: "deleting", .. }
        ));

        delete.await.unwrap().unwrap();
        assert!(!folder.exists());
        assert!(world.ledger.is_pending_removal("track1"));
        assert_eq!(world.catalog.max_active(), 0);
        assert_eq!(
            item.wait_until(not_waiting).await,
            DownloadState::Available { size_bytes: 4096 }
        );
    }

    #[tokio::test]
    async fn refused_delete_allows_downloads_again() {
        let world = World::new(4);
        let outside = world.tmp.path().join("Elsewhere");
        std::fs::create_dir_all(&outside).unwrap();
        world.library.insert("track1", Some(outside.clone()));
        world
            .catalog
            .body("http://x/1.zip", zip_bytes(&[("One/song.tmb", "{}")]));

        let item = ChartItem::new(entry(1, Some("http://x/1.zip"), None), world.ctx.clone());
        assert!(item.request_delete().await.is_err());
        assert!(outside.exists());

        item.request_download(DownloadSource::Auto).unwrap();
        assert_eq!(item.wait_until(settled_download).await, DownloadState::Owned);
    }

    #[tokio::test]
    async fn six_items_share_four_transfer_slots() {
        let world = World::new(MAX_CONCURRENT_DOWNLOADS);
        let mut started = world.catalog.started();
        let mut gates = Vec::new();
        let mut items = Vec::new();
        for id in 1..=6 {
            let url = format!("http://x/{id}.zip");
            world.catalog.probe_ok(&url, 100, "application/zip");
            let name = format!("Chart{id}/song.tmb");
            world.catalog.body(&url, zip_bytes(&[(name.as_str(), "{}")]));
            gates.push(world.catalog.gate(&url));
            items.push(ChartItem::new(
                entry(id, Some(url.as_str()), None),
                world.ctx.clone(),
            ));
        }
        for item in &items {
            item.wait_until(not_waiting).await;
        }

        let admissions: Vec<_> = items
            .iter()
            .map(|item| item.request_download(DownloadSource::Auto).unwrap())
            .collect();
        assert_eq!(&admissions[..4], &[Admission::Started; 4]);
        assert_eq!(admissions[4], Admission::Queued { position: 0 });
        assert_eq!(admissions[5], Admission::Queued { position: 1 });
        assert!(items
            .iter()
            .all(|item| matches!(item.state(), DownloadState::InProgress { .. })));

        let mut first_wave = Vec::new();
        for _ in 0..4 {
            first_wave.push(started.recv().await.unwrap());
        }
        first_wave.sort();
        assert_eq!(
            first_wave,
            (1..=4).map(|id| format!("http://x/{id}.zip")).collect::<Vec<_>>()
        );
        settle().await;
        assert!(started.try_recv().is_err());

        gates[0].notify_one();
        assert_eq!(items[0].wait_until(settled_download).await, DownloadState::Owned);
        assert_eq!(started.recv().await.as_deref(), Some("http://x/5.zip"));
        settle().await;
        assert!(started.try_recv().is_err());
        assert!(matches!(items[5].state(), DownloadState::InProgress { .. }));

        for gate in &gates[1..] {
            gate.notify_one();
        }
        for item in &items {
            assert_eq!(item.wait_until(settled_download).await, DownloadState::Owned);
        }
        assert!(world.catalog.max_active() <= MAX_CONCURRENT_DOWNLOADS);
        assert!(world.ctx.queue.is_idle());
    }
}
