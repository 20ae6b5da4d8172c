use crate::error::ChartError;
use crate::item::{ChartItem, ItemContext};
use crate::types::{ChartCatalogEntry, DownloadSource, DownloadState};
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// The charts of one catalog listing plus the reload trigger that runs when
/// the user leaves it.
pub struct ChartPage {
    ctx: Arc<ItemContext>,
    items: Vec<Arc<ChartItem>>,
    track_refs: HashSet<String>,
}

impl ChartPage {
    pub fn new(ctx: Arc<ItemContext>) -> Self {
        Self {
            ctx,
            items: Vec::new(),
            track_refs: HashSet::new(),
        }
    }

    /// Adds a batch of results, newest id first. Track refs already listed
    /// are skipped. Returns how many items were added.
    pub fn add_entries(&mut self, mut entries: Vec<ChartCatalogEntry>) -> usize {
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        let before = self.items.len();
        for entry in entries {
            if !self.track_refs.insert(entry.track_ref.clone()) {
                continue;
            }
            self.items.push(ChartItem::new(entry, Arc::clone(&self.ctx)));
        }
        self.items.len() - before
    }

    pub fn items(&self) -> &[Arc<ChartItem>] {
        &self.items
    }

    pub fn item(&self, track_ref: &str) -> Option<&Arc<ChartItem>> {
        self.items.iter().find(|item| item.track_ref() == track_ref)
    }

    pub fn visible_items(&self) -> impl Iterator<Item = &Arc<ChartItem>> {
        self.items.iter().filter(|item| item.is_visible())
    }

    pub fn set_not_owned_only(&self, value: bool) {
        self.ctx.filter.set_not_owned_only(value);
        for item in &self.items {
            item.apply_filter();
        }
    }

    pub fn has_available(&self) -> bool {
        self.items.iter().any(|item| item.is_download_available())
    }

    /// Requests every item that is currently `Available` and returns the
    /// ones that were accepted.
    pub fn download_all(&self, source: DownloadSource) -> Vec<Arc<ChartItem>> {
        let mut requested = Vec::new();
        for item in self.items.iter().filter(|item| item.is_download_available()) {
            match item.request_download(source) {
                Ok(_) => requested.push(Arc::clone(item)),
                Err(e) => warn!("Skipping {}: {}", item.track_ref(), e),
            }
        }
        info!("Requested {} downloads", requested.len());
        requested
    }

    /// Running and waiting transfers, in that order.
    pub fn queue_status(&self) -> (usize, usize) {
        (self.ctx.queue.active_count(), self.ctx.queue.queued_count())
    }

    pub async fn wait_for_probes(&self) {
        for item in &self.items {
            item.wait_until(|state| !matches!(state, DownloadState::Waiting))
                .await;
        }
    }

    pub async fn wait_for_downloads(&self) {
        for item in &self.items {
            item.wait_until(|state| !matches!(state, DownloadState::InProgress { .. }))
                .await;
        }
    }

    /// Disposes the listing. If anything was downloaded or deleted since the
    /// last reload, re-scans the library and then clears the ledger.
    ///
    /// Returns whether a reload ran.
    pub async fn leave(self) -> Result<bool, ChartError> {
        for item in &self.items {
            item.dispose();
        }
        if !self.ctx.queue.is_idle() {
            warn!("Leaving the listing with downloads still running");
        }
        if !self.ctx.ledger.has_churn() {
            return Ok(false);
        }

        let churn = self.ctx.ledger.snapshot();
        info!(
            "Reloading library: {} added, {} removed",
            churn.recently_added.len(),
            churn.recently_removed.len()
        );
        self.ctx.notifier.notify("Reloading songs...");
        match self.ctx.library.reload().await {
            Ok(count) => {
                self.ctx.ledger.drain();
                info!("Library reloaded with {} charts", count);
                self.ctx.notifier.notify("Reload complete!");
                Ok(true)
            }
            Err(e) => {
                self.ctx
                    .notifier
                    .notify(&format!("Reloading failed! {}", e));
                Err(e)
            }
        }
    }
}
