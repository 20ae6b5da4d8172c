use crate::pipeline::DownloadPipeline;
use crate::types::{OutcomeCallback, QueuedDownloadRequest};
use log::{debug, error, info};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

pub const MAX_CONCURRENT_DOWNLOADS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    /// Waiting behind `position` earlier requests.
    Queued { position: usize },
}

/// Admits downloads up to a fixed number of concurrent transfers and holds
/// the rest in arrival order.
pub struct DownloadQueue {
    pipeline: Arc<DownloadPipeline>,
    limit: usize,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    active: HashSet<u64>,
    pending: VecDeque<(u64, QueuedDownloadRequest)>,
}

impl DownloadQueue {
    pub fn new(pipeline: Arc<DownloadPipeline>, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            limit: limit.max(1),
            state: Mutex::new(QueueState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(self: &Arc<Self>, request: QueuedDownloadRequest) -> Admission {
        let (ticket, admitted) = {
            let mut state = self.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            if state.active.len() < self.limit {
                state.active.insert(ticket);
                (ticket, Some(request))
            } else {
                debug!(
                    "Queueing {} behind {} waiting downloads",
                    request.track_ref,
                    state.pending.len()
                );
                state.pending.push_back((ticket, request));
                return Admission::Queued {
                    position: state.pending.len() - 1,
                };
            }
        };

        if let Some(request) = admitted {
            self.start(ticket, request);
        }
        Admission::Started
    }

    fn start(self: &Arc<Self>, ticket: u64, mut request: QueuedDownloadRequest) {
        let slot = Slot {
            queue: Arc::clone(self),
            ticket,
            on_outcome: request.take_outcome(),
        };
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            let success = pipeline.run(&request).await;
            slot.finish(success);
        });
    }

    /// Frees the slot held by `ticket` and admits the oldest waiting request.
    fn on_request_finished(self: &Arc<Self>, ticket: u64) {
        let next = {
            let mut state = self.lock();
            state.active.remove(&ticket);
            if state.active.len() < self.limit {
                let next = state.pending.pop_front();
                if let Some((next_ticket, _)) = &next {
                    state.active.insert(*next_ticket);
                }
                next
            } else {
                None
            }
        };

        if let Some((next_ticket, request)) = next {
            info!("Admitting queued download {}", request.track_ref);
            self.start(next_ticket, request);
        }
    }

    /// Drops a request that has not started yet. Its outcome fires with
    /// `false`. Returns `false` if no waiting request matches `chart_id`.
    pub fn cancel_queued(&self, chart_id: u64) -> bool {
        let removed = {
            let mut state = self.lock();
            state
                .pending
                .iter()
                .position(|(_, request)| request.chart_id == chart_id)
                .and_then(|index| state.pending.remove(index))
        };

        match removed {
            Some((_, mut request)) => {
                info!("Cancelled queued download {}", request.track_ref);
                if let Some(on_outcome) = request.take_outcome() {
                    on_outcome(false);
                }
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.active.is_empty() && state.pending.is_empty()
    }
}

/// An admitted request's hold on the queue. Finishing releases the slot and
/// then reports the outcome. A slot dropped unfinished, as when its task
/// panics, reports failure.
struct Slot {
    queue: Arc<DownloadQueue>,
    ticket: u64,
    on_outcome: Option<OutcomeCallback>,
}

impl Slot {
    fn finish(mut self, success: bool) {
        self.release(success);
    }

    fn release(&mut self, success: bool) {
        let Some(on_outcome) = self.on_outcome.take() else {
            return;
        };
        self.queue.on_request_finished(self.ticket);
        on_outcome(success);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.on_outcome.is_some() {
            error!("Download task {} ended without an outcome", self.ticket);
            self.release(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::FakeCatalog;
    use crate::notify::test_support::RecordingNotifier;
    use crate::storage::test_support::zip_bytes;
    use crate::types::ProgressCounter;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn queue_with(catalog: Arc<FakeCatalog>, tmp: &TempDir, limit: usize) -> Arc<DownloadQueue> {
        let pipeline = DownloadPipeline::new(
            catalog,
            tmp.path().join("Downloads"),
            tmp.path().join("CustomSongs"),
            Arc::new(RecordingNotifier::default()),
        );
        DownloadQueue::new(Arc::new(pipeline), limit)
    }

    fn request(
        id: u64,
        outcomes: &mpsc::UnboundedSender<(u64, bool)>,
    ) -> QueuedDownloadRequest {
        let tx = outcomes.clone();
        QueuedDownloadRequest::new(
            id,
            format!("track{id}"),
            format!("http://x/{id}.zip"),
            ProgressCounter::new(),
            move |success| {
                let _ = tx.send((id, success));
            },
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn six_requests_run_four_at_a_time_in_fifo_order() {
        let tmp = TempDir::new().unwrap();
        let catalog = FakeCatalog::new();
        let gates: Vec<_> = (1..=6)
            .map(|id| catalog.gate(&format!("http://x/{id}.zip")))
            .collect();
        let mut started = catalog.started();
        let queue = queue_with(catalog.clone(), &tmp, MAX_CONCURRENT_DOWNLOADS);
        let (tx, mut outcomes) = mpsc::unbounded_channel();

        let admissions: Vec<_> = (1..=6).map(|id| queue.enqueue(request(id, &tx))).collect();
        assert_eq!(&admissions[..4], &[Admission::Started; 4]);
        assert_eq!(admissions[4], Admission::Queued { position: 0 });
        assert_eq!(admissions[5], Admission::Queued { position: 1 });

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
        assert_eq!(queue.active_count(), 4);
        assert_eq!(queue.queued_count(), 2);

        gates[0].notify_one();
        assert_eq!(outcomes.recv().await, Some((1, false)));
        assert_eq!(started.recv().await.as_deref(), Some("http://x/5.zip"));
        settle().await;
        assert!(started.try_recv().is_err());
        assert_eq!(queue.queued_count(), 1);

        gates[2].notify_one();
        assert_eq!(outcomes.recv().await, Some((3, false)));
        assert_eq!(started.recv().await.as_deref(), Some("http://x/6.zip"));

        for gate in &gates[1..] {
            gate.notify_one();
        }
        let mut seen: HashMap<u64, usize> = HashMap::new();
        seen.insert(1, 1);
        seen.insert(3, 1);
        for _ in 0..4 {
            let (id, _) = outcomes.recv().await.unwrap();
            *seen.entry(id).or_default() += 1;
        }
        settle().await;
        assert!(outcomes.try_recv().is_err());
        assert!((1..=6).all(|id| seen.get(&id) == Some(&1)));
        assert!(catalog.max_active() <= MAX_CONCURRENT_DOWNLOADS);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn every_outcome_fires_exactly_once_whatever_the_stage() {
        let tmp = TempDir::new().unwrap();
        let catalog = FakeCatalog::new();
        catalog.body("http://x/1.zip", zip_bytes(&[("One/song.tmb", "{}")]));
        catalog.body("http://x/2.zip", b"not a zip".to_vec());
        catalog.body("http://x/3.zip", Vec::new());
        // 4 has no body at all.
        let queue = queue_with(catalog.clone(), &tmp, 2);
        let (tx, mut outcomes) = mpsc::unbounded_channel();

        for id in 1..=4 {
            queue.enqueue(request(id, &tx));
        }
        let mut results = HashMap::new();
        for _ in 0..4 {
            let (id, success) = outcomes.recv().await.unwrap();
            assert!(results.insert(id, success).is_none(), "duplicate outcome for {id}");
        }
        settle().await;
        assert!(outcomes.try_recv().is_err());
        assert!(results[&1]);
        assert!(!results[&2]);
        assert!(!results[&3]);
        assert!(!results[&4]);
        for id in 1..=4 {
            assert!(!tmp.path().join(format!("Downloads/{id}.zip")).exists());
        }
    }

    #[tokio::test]
    async fn cancelling_a_waiting_request_reports_failure_once() {
        let tmp = TempDir::new().unwrap();
        let catalog = FakeCatalog::new();
        let gate = catalog.gate("http://x/1.zip");
        let mut started = catalog.started();
        let queue = queue_with(catalog.clone(), &tmp, 1);
        let (tx, mut outcomes) = mpsc::unbounded_channel();

        assert_eq!(queue.enqueue(request(1, &tx)), Admission::Started);
        assert_eq!(
            queue.enqueue(request(2, &tx)),
            Admission::Queued { position: 0 }
        );
        started.recv().await.unwrap();

        assert!(queue.cancel_queued(2));
        assert_eq!(outcomes.recv().await, Some((2, false)));
        assert!(!queue.cancel_queued(2));
        // Active transfers are not cancellable.
        assert!(!queue.cancel_queued(1));

        gate.notify_one();
        assert_eq!(outcomes.recv().await, Some((1, false)));
        settle().await;
        assert!(started.try_recv().is_err());
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn a_panicking_transfer_still_frees_its_slot_and_reports_failure() {
        let tmp = TempDir::new().unwrap();
        let catalog = FakeCatalog::new();
        catalog.body("http://x/1.zip", zip_bytes(&[("One/song.tmb", "{}")]));
        catalog.panic_on("http://x/1.zip");
        catalog.body("http://x/2.zip", zip_bytes(&[("Two/song.tmb", "{}")]));
        let queue = queue_with(catalog.clone(), &tmp, 1);
        let (tx, mut outcomes) = mpsc::unbounded_channel();

        assert_eq!(queue.enqueue(request(1, &tx)), Admission::Started);
        assert_eq!(
            queue.enqueue(request(2, &tx)),
            Admission::Queued { position: 0 }
        );

        assert_eq!(outcomes.recv().await, Some((1, false)));
        assert_eq!(outcomes.recv().await, Some((2, true)));
        settle().await;
        assert!(outcomes.try_recv().is_err());
        assert!(queue.is_idle());
    }
}
