//! # Freshness Tailer
//!
//! Keeps polling the newest listing pages for decks published after the bulk
//! scan started. Every cycle walks forward from page 1 and stops at the first
//! page that contains nothing new, then sleeps out the rest of the interval.
//!
//! The early stop assumes the listing is ordered newest first and does not
//! reshuffle between requests; a deck that gets reordered below a fully known
//! page is missed until a bulk scan picks it up.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::page_discoverer::retry_after;
use super::{WorkerExit, emit_unseen, pause};
use crate::crawling::backoff::Backoff;
use crate::crawling::failure::FailureKind;
use crate::crawling::queues::WorkQueue;
use crate::crawling::state::SharedState;
use crate::crawling::stop_signal::StopFile;
use crate::domain::DeckId;
use crate::infrastructure::vault_client::DeckSource;

/// What one scan from page 1 found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub pages_scanned: u32,
    pub enqueued: usize,
    /// Last page requested this cycle
    pub last_page: u32,
}

pub struct FreshnessTailer<S: DeckSource> {
    source: Arc<S>,
    ids: Arc<WorkQueue<DeckId>>,
    state: Arc<SharedState>,
    interval: Duration,
    stop_file: StopFile,
    backoff: Backoff,
}

impl<S: DeckSource> FreshnessTailer<S> {
    pub fn new(
        source: Arc<S>,
        ids: Arc<WorkQueue<DeckId>>,
        state: Arc<SharedState>,
        interval: Duration,
        stop_file: StopFile,
        backoff: Backoff,
    ) -> Self {
        Self {
            source,
            ids,
            state,
            interval,
            stop_file,
            backoff,
        }
    }

    /// Runs cycles until the stop file shows up or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerExit {
        info!(
            interval = ?self.interval,
            stop_file = %self.stop_file.path().display(),
            "Tailing the newest pages"
        );

        loop {
            if self.stop_file.is_raised().await {
                if let Err(err) = self.stop_file.clear().await {
                    warn!("Could not remove stop file: {err}");
                }
                info!("Stop file found, no more cycles");
                return WorkerExit::Stopped;
            }

            let started = Instant::now();
            let Some(report) = self.run_cycle(&cancel).await else {
                return WorkerExit::Cancelled;
            };
            self.state.record(|stats| stats.tail_cycles += 1).await;

            let elapsed = started.elapsed();
            if report.enqueued > 0 {
                info!(
                    new_decks = report.enqueued,
                    pages = report.pages_scanned,
                    ?elapsed,
                    "Found new decks"
                );
            } else {
                debug!(pages = report.pages_scanned, ?elapsed, "Nothing new");
            }

            let remaining = self.interval.saturating_sub(elapsed);
            if !remaining.is_zero() && !pause(&cancel, remaining).await {
                return WorkerExit::Cancelled;
            }
        }
    }

    /// Scans from page 1 until a page has no unseen deck ids.
    ///
    /// A failed page ends the cycle early. Returns `None` when cancelled.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Option<CycleReport> {
        let mut report = CycleReport::default();

        for page in 1_u32.. {
            if cancel.is_cancelled() {
                return None;
            }
            report.last_page = page;

            let ids = match self.source.list_page(page).await {
                Ok(ids) => ids,
                Err(err) => {
                    let kind = FailureKind::from(&err);
                    self.state.record_failure(kind).await;
                    match kind {
                        FailureKind::Throttled => {
                            let delay = self.backoff.next_delay(retry_after(&err));
                            warn!(page, ?delay, "Throttled, ending cycle: {err}");
                            if !pause(cancel, delay).await {
                                return None;
                            }
                        }
                        FailureKind::Unclassified | FailureKind::PersistenceFailure => {
                            error!(page, %kind, "Unexpected failure, ending cycle: {err}");
                        }
                        _ => warn!(page, %kind, "Ending cycle: {err}"),
                    }
                    break;
                }
            };
            self.backoff.reset();
            report.pages_scanned += 1;
            self.state.record(|stats| stats.pages_scanned += 1).await;

            let emitted = match emit_unseen(ids, &self.state, &self.ids).await {
                Ok(emitted) => emitted,
                Err(err) => {
                    debug!("Stopping: {err}");
                    return None;
                }
            };
            report.enqueued += emitted;
            if emitted == 0 {
                break;
            }
        }

        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::registry::{CardCatalog, DedupRegistry};
    use crate::infrastructure::memory_vault::{InMemoryVault, ScriptedFailure, generated_deck};

    fn tailer(
        vault: &Arc<InMemoryVault>,
        state: &Arc<SharedState>,
        ids: &Arc<WorkQueue<DeckId>>,
        stop_file: StopFile,
    ) -> FreshnessTailer<InMemoryVault> {
        FreshnessTailer::new(
            Arc::clone(vault),
            Arc::clone(ids),
            Arc::clone(state),
            Duration::from_millis(10),
            stop_file,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    fn newest_first_vault() -> Arc<InMemoryVault> {
        let vault = InMemoryVault::new();
        vault.set_page(1, ["A", "B", "C"].map(|id| generated_deck(id, 435)).to_vec());
        vault.set_page(2, ["D", "E"].map(|id| generated_deck(id, 435)).to_vec());
        vault.set_page(3, ["F"].map(|id| generated_deck(id, 435)).to_vec());
        Arc::new(vault)
    }

    #[tokio::test]
    async fn cycle_stops_at_first_page_without_new_ids() {
        let dir = tempfile::tempdir().unwrap();
        let vault = newest_first_vault();
        let state = Arc::new(SharedState::new(
            DedupRegistry::with_known(["D", "E", "F"].map(DeckId::new)),
            CardCatalog::new(),
        ));
        let ids = Arc::new(WorkQueue::unbounded("ids"));

        let mut tailer = tailer(&vault, &state, &ids, StopFile::new(dir.path().join("stop")));
        let report = tailer.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            report,
            CycleReport {
                pages_scanned: 2,
                enqueued: 3,
                last_page: 2
            }
        );
        assert_eq!(ids.len(), 3);
        assert_eq!(vault.page_requests(), vec![1, 2]);
    }

    #[tokio::test]
    async fn second_cycle_finds_nothing_on_page_one() {
        let dir = tempfile::tempdir().unwrap();
        let vault = newest_first_vault();
        let state = Arc::new(SharedState::new(
            DedupRegistry::with_known(["D", "E", "F"].map(DeckId::new)),
            CardCatalog::new(),
        ));
        let ids = Arc::new(WorkQueue::unbounded("ids"));
        let mut tailer = tailer(&vault, &state, &ids, StopFile::new(dir.path().join("stop")));

        let cancel = CancellationToken::new();
        tailer.run_cycle(&cancel).await.unwrap();
        let second = tailer.run_cycle(&cancel).await.unwrap();

        assert_eq!(second.enqueued, 0);
        assert_eq!(second.last_page, 1);
        assert_eq!(vault.page_requests(), vec![1, 2, 1]);
    }

    #[tokio::test]
    async fn failed_page_ends_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let vault = newest_first_vault();
        vault.fail_page(2, ScriptedFailure::Throttled, 1);
        let state = Arc::new(SharedState::new(DedupRegistry::new(), CardCatalog::new()));
        let ids = Arc::new(WorkQueue::unbounded("ids"));
        let mut tailer = tailer(&vault, &state, &ids, StopFile::new(dir.path().join("stop")));

        let report = tailer.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.enqueued, 3);
        assert_eq!(report.last_page, 2);
        assert_eq!(vault.page_requests(), vec![1, 2]);
        assert_eq!(state.snapshot().await.failures_of(FailureKind::Throttled), 1);
    }

    #[tokio::test]
    async fn raised_stop_file_is_cleared_and_ends_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let stop = StopFile::new(dir.path().join("stop"));
        stop.raise().await.unwrap();
        let vault = newest_first_vault();
        let state = Arc::new(SharedState::new(DedupRegistry::new(), CardCatalog::new()));
        let ids = Arc::new(WorkQueue::unbounded("ids"));

        let exit = tailer(&vault, &state, &ids, stop.clone())
            .run(CancellationToken::new())
            .await;

        assert_eq!(exit, WorkerExit::Stopped);
        assert!(!stop.is_raised().await);
        assert!(vault.page_requests().is_empty());
    }

    #[tokio::test]
    async fn stop_file_is_checked_between_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let stop = StopFile::new(dir.path().join("stop"));
        let vault = newest_first_vault();
        let state = Arc::new(SharedState::new(DedupRegistry::new(), CardCatalog::new()));
        let ids = Arc::new(WorkQueue::unbounded("ids"));

        let handle = tokio::spawn(tailer(&vault, &state, &ids, stop.clone()).run(CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.raise().await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit, WorkerExit::Stopped);
        assert!(state.snapshot().await.tail_cycles >= 1);
        // every deck was new on the first cycle; later cycles stop at page 1
        assert_eq!(ids.len(), 6);
        assert!(!stop.is_raised().await);
    }

    #[tokio::test]
    async fn cancellation_ends_the_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let vault = newest_first_vault();
        let state = Arc::new(SharedState::new(DedupRegistry::new(), CardCatalog::new()));
        let ids = Arc::new(WorkQueue::unbounded("ids"));
        let mut tailer = tailer(&vault, &state, &ids, StopFile::new(dir.path().join("stop")));
        tailer.interval = Duration::from_secs(3600);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tailer.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), WorkerExit::Cancelled);
        assert_eq!(state.snapshot().await.tail_cycles, 1);
    }
}
