//! Churn since the last library reload.
//!
//! Tracks which track refs were downloaded or deleted during this session so
//! that items can be treated as owned (or not) before the library index has
//! been re-scanned, and so leaving the page knows whether a reload is due.

use log::debug;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct LibraryLedger {
    sets: Mutex<LedgerSets>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LedgerSets {
    pub recently_added: HashSet<String>,
    pub recently_removed: HashSet<String>,
}

impl LibraryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerSets> {
        self.sets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mark_downloaded(&self, track_ref: &str) {
        let mut sets = self.lock();
        sets.recently_removed.remove(track_ref);
        sets.recently_added.insert(track_ref.to_string());
        debug!("Ledger: {} marked downloaded", track_ref);
    }

    pub fn mark_deleted(&self, track_ref: &str) {
        let mut sets = self.lock();
        sets.recently_added.remove(track_ref);
        sets.recently_removed.insert(track_ref.to_string());
        debug!("Ledger: {} marked deleted", track_ref);
    }

    pub fn is_pending_add(&self, track_ref: &str) -> bool {
        self.lock().recently_added.contains(track_ref)
    }

    pub fn is_pending_removal(&self, track_ref: &str) -> bool {
        self.lock().recently_removed.contains(track_ref)
    }

    pub fn has_churn(&self) -> bool {
        let sets = self.lock();
        !sets.recently_added.is_empty() || !sets.recently_removed.is_empty()
    }

    /// Empties both sets and hands back what they held.
    pub fn drain(&self) -> LedgerSets {
        std::mem::take(&mut *self.lock())
    }

    pub fn snapshot(&self) -> LedgerSets {
        self.lock().clone()
    }
}
