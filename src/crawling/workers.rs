//! # Worker Pools
//!
//! One module per pipeline stage. Every worker is a plain struct consumed by
//! its `run` loop, which keeps going until its cancellation token fires, its
//! input queue is closed, or (for page discoverers and the tailer) the worker
//! decides to stop on its own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::crawling::queues::{QueueError, WorkQueue};
use crate::crawling::state::SharedState;
use crate::domain::DeckId;

pub mod detail_fetcher;
pub mod freshness_tailer;
pub mod page_discoverer;
pub mod persister;

pub use detail_fetcher::{Backpressure, DetailFetcher};
pub use freshness_tailer::{CycleReport, FreshnessTailer};
pub use page_discoverer::PageDiscoverer;
pub use persister::{PersistError, PersistOutcome, Persister};

/// Why a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerExit {
    /// The run's cancellation token fired
    Cancelled,
    /// A page discoverer gave up after too many unavailable pages
    Halted,
    /// The tailer honoured the stop file
    Stopped,
    /// The output queue was closed underneath the worker
    QueueClosed,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Cancelled => "cancelled",
            Self::Halted => "halted",
            Self::Stopped => "stopped",
            Self::QueueClosed => "queue closed",
        };
        f.write_str(text)
    }
}

/// Name and exit reason of a finished worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub name: String,
    pub exit: WorkerExit,
}

impl WorkerReport {
    pub fn new(name: impl Into<String>, exit: WorkerExit) -> Self {
        Self {
            name: name.into(),
            exit,
        }
    }
}

/// Sleeps for `delay` unless cancelled first; returns `false` on cancellation
pub async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Claims the unseen ids of one listing page and queues them for detail fetch.
///
/// Returns how many ids this caller won. Ids already known, or claimed by a
/// concurrent page worker or the tailer, are skipped.
pub async fn emit_unseen(
    ids: Vec<DeckId>,
    state: &SharedState,
    queue: &WorkQueue<DeckId>,
) -> Result<usize, QueueError> {
    let listed = ids.len();
    let fresh = state.registry.claim_all(ids);
    let emitted = fresh.len();

    for id in fresh {
        queue.enqueue(id).await?;
    }

    state
        .record(|stats| {
            stats.ids_enqueued += emitted as u64;
            stats.ids_already_known += (listed - emitted) as u64;
        })
        .await;
    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::registry::{CardCatalog, DedupRegistry};

    #[tokio::test]
    async fn emit_skips_known_and_repeated_ids() {
        let state = SharedState::new(DedupRegistry::with_known([DeckId::new("a")]), CardCatalog::new());
        let queue = WorkQueue::unbounded("ids");

        let first = emit_unseen(["a", "b", "c"].map(DeckId::new).to_vec(), &state, &queue)
            .await
            .unwrap();
        let second = emit_unseen(["c", "d"].map(DeckId::new).to_vec(), &state, &queue)
            .await
            .unwrap();

        assert_eq!((first, second), (2, 1));
        assert_eq!(queue.len(), 3);
        let stats = state.snapshot().await;
        assert_eq!(stats.ids_enqueued, 3);
        assert_eq!(stats.ids_already_known, 2);
    }

    #[tokio::test]
    async fn pause_returns_early_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!pause(&cancel, Duration::from_secs(60)).await);
        assert!(pause(&CancellationToken::new(), Duration::from_millis(1)).await);
    }
}
