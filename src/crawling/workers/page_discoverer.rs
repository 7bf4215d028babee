//! # Page Discoverer Worker
//!
//! Turns listing page numbers into unseen deck ids.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{WorkerExit, emit_unseen, pause};
use crate::crawling::backoff::Backoff;
use crate::crawling::failure::FailureKind;
use crate::crawling::queues::WorkQueue;
use crate::crawling::state::SharedState;
use crate::domain::DeckId;
use crate::infrastructure::vault_client::{DeckSource, VaultError};

/// What to do after one page
enum Step {
    Continue,
    Halt,
    Exit(WorkerExit),
}

pub struct PageDiscoverer<S: DeckSource> {
    name: String,
    source: Arc<S>,
    pages: Arc<WorkQueue<u32>>,
    ids: Arc<WorkQueue<DeckId>>,
    state: Arc<SharedState>,
    /// Halt once more than this many pages in a row were unavailable
    max_consecutive_unavailable: u32,
    consecutive_unavailable: u32,
    backoff: Backoff,
}

impl<S: DeckSource> PageDiscoverer<S> {
    pub fn new(
        name: impl Into<String>,
        source: Arc<S>,
        pages: Arc<WorkQueue<u32>>,
        ids: Arc<WorkQueue<DeckId>>,
        state: Arc<SharedState>,
        max_consecutive_unavailable: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            pages,
            ids,
            state,
            max_consecutive_unavailable,
            consecutive_unavailable: 0,
            backoff,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(mut self, cancel: CancellationToken) -> WorkerExit {
        debug!("Starting up");
        while let Some(page) = self.pages.dequeue(&cancel).await {
            let step = self.process_page(page, &cancel).await;
            self.pages.task_done();

            match step {
                Step::Continue => {}
                Step::Halt => {
                    error!(
                        "Upstream unavailable {} times in a row, stopping",
                        self.consecutive_unavailable
                    );
                    self.state.record(|stats| stats.page_workers_halted += 1).await;
                    return WorkerExit::Halted;
                }
                Step::Exit(exit) => return exit,
            }
        }
        WorkerExit::Cancelled
    }

    async fn process_page(&mut self, page: u32, cancel: &CancellationToken) -> Step {
        if page % 10 == 0 {
            info!("Getting page {page}");
        }

        let ids = match self.source.list_page(page).await {
            Ok(ids) => ids,
            Err(err) => return self.handle_failure(page, &err, cancel).await,
        };

        if self.consecutive_unavailable > 0 {
            info!(
                "Had {} unavailable pages in a row, clearing",
                self.consecutive_unavailable
            );
        }
        self.consecutive_unavailable = 0;
        self.backoff.reset();
        self.state.record(|stats| stats.pages_scanned += 1).await;

        match emit_unseen(ids, &self.state, &self.ids).await {
            Ok(emitted) => {
                debug!(page, emitted, "Page processed");
                Step::Continue
            }
            Err(err) => {
                debug!("Stopping: {err}");
                Step::Exit(WorkerExit::QueueClosed)
            }
        }
    }

    async fn handle_failure(&mut self, page: u32, err: &VaultError, cancel: &CancellationToken) -> Step {
        let kind = FailureKind::from(err);
        self.state.record_failure(kind).await;

        match kind {
            FailureKind::Throttled => {
                let delay = self.backoff.next_delay(retry_after(err));
                warn!(page, ?delay, "Throttled, abandoning page: {err}");
                if !pause(cancel, delay).await {
                    return Step::Exit(WorkerExit::Cancelled);
                }
            }
            FailureKind::UpstreamUnavailable => {
                self.consecutive_unavailable += 1;
                debug!(page, streak = self.consecutive_unavailable, "Page unavailable: {err}");
                if self.consecutive_unavailable > self.max_consecutive_unavailable {
                    return Step::Halt;
                }
            }
            FailureKind::TransientNetwork | FailureKind::MalformedResponse => {
                warn!(page, %kind, "Abandoning page: {err}");
            }
            FailureKind::PersistenceFailure | FailureKind::Unclassified => {
                error!(page, %kind, "Unexpected failure getting page: {err}");
            }
        }
        Step::Continue
    }
}

pub(crate) fn retry_after(err: &VaultError) -> Option<Duration> {
    match err {
        VaultError::Throttled { retry_after, .. } => *retry_after,
        _ => None,
    }
}
