//! # Detail Fetcher Worker
//!
//! Fetches one deck detail per id and hands it to the persisters, pausing
//! while the record queue is over its threshold.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::page_discoverer::retry_after;
use super::{WorkerExit, pause};
use crate::crawling::backoff::Backoff;
use crate::crawling::failure::FailureKind;
use crate::crawling::queues::WorkQueue;
use crate::crawling::state::SharedState;
use crate::domain::{DeckDetail, DeckId};
use crate::infrastructure::vault_client::{DeckSource, VaultError};

/// Pause applied while the record queue is too long
#[derive(Debug, Clone, Copy)]
pub struct Backpressure {
    /// Pause while more than this many records are waiting
    pub threshold: usize,
    pub delay: Duration,
    /// Upper bound of the random extra delay
    pub jitter: Duration,
}

impl Backpressure {
    fn next_pause(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 { 0 } else { fastrand::u64(0..=jitter_ms) };
        self.delay + Duration::from_millis(extra)
    }
}

pub struct DetailFetcher<S: DeckSource> {
    name: String,
    source: Arc<S>,
    ids: Arc<WorkQueue<DeckId>>,
    records: Arc<WorkQueue<DeckDetail>>,
    state: Arc<SharedState>,
    backpressure: Backpressure,
    backoff: Backoff,
}

impl<S: DeckSource> DetailFetcher<S> {
    pub fn new(
        name: impl Into<String>,
        source: Arc<S>,
        ids: Arc<WorkQueue<DeckId>>,
        records: Arc<WorkQueue<DeckDetail>>,
        state: Arc<SharedState>,
        backpressure: Backpressure,
        backoff: Backoff,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            ids,
            records,
            state,
            backpressure,
            backoff,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(mut self, cancel: CancellationToken) -> WorkerExit {
        debug!("Starting up");
        while let Some(id) = self.ids.dequeue(&cancel).await {
            let exit = self.process_id(&id, &cancel).await;
            self.ids.task_done();
            if let Some(exit) = exit {
                return exit;
            }
        }
        WorkerExit::Cancelled
    }

    async fn process_id(&mut self, id: &DeckId, cancel: &CancellationToken) -> Option<WorkerExit> {
        let detail = match self.source.fetch_deck(id).await {
            Ok(detail) => detail,
            Err(err) => return self.handle_failure(id, &err, cancel).await,
        };
        self.backoff.reset();

        if !self.wait_for_room(cancel).await {
            return Some(WorkerExit::Cancelled);
        }
        if let Err(err) = self.records.enqueue(detail).await {
            debug!("Stopping: {err}");
            return Some(WorkerExit::QueueClosed);
        }
        self.state.record(|stats| stats.decks_fetched += 1).await;
        None
    }

    /// Waits until the record queue is back at or under the threshold.
    ///
    /// Returns `false` when cancelled while waiting.
    async fn wait_for_room(&self, cancel: &CancellationToken) -> bool {
        let mut paused = false;
        while self.records.len() > self.backpressure.threshold {
            if !paused {
                paused = true;
                self.state.record(|stats| stats.backpressure_pauses += 1).await;
            }
            let delay = self.backpressure.next_pause();
            debug!(
                waiting = self.records.len(),
                ?delay,
                "Record queue over threshold, sleeping"
            );
            if !pause(cancel, delay).await {
                return false;
            }
        }
        true
    }

    async fn handle_failure(
        &mut self,
        id: &DeckId,
        err: &VaultError,
        cancel: &CancellationToken,
    ) -> Option<WorkerExit> {
        let kind = FailureKind::from(err);
        self.state.record_failure(kind).await;

        match kind {
            FailureKind::Throttled => {
                let delay = self.backoff.next_delay(retry_after(err));
                warn!(deck = %id, ?delay, "Throttled, dropping deck: {err}");
                if !pause(cancel, delay).await {
                    return Some(WorkerExit::Cancelled);
                }
            }
            FailureKind::TransientNetwork
            | FailureKind::MalformedResponse
            | FailureKind::UpstreamUnavailable => {
                warn!(deck = %id, %kind, "Dropping deck: {err}");
            }
            FailureKind::PersistenceFailure | FailureKind::Unclassified => {
                error!(deck = %id, %kind, error = ?err, "Unexpected failure getting deck");
            }
        }
        None
    }
}
