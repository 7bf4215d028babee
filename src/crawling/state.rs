//! # Shared State Management
//!
//! State shared by every worker of one pipeline run: the dedup registry, the
//! card catalog and the run counters. It is built once by the orchestrator and
//! handed to each pool behind an `Arc`; there is no process-global state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::crawling::failure::FailureKind;
use crate::crawling::registry::{CardCatalog, DedupRegistry};
use crate::domain::DeckId;

/// Unique identifier of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread-safe state for one pipeline run
#[derive(Debug)]
pub struct SharedState {
    pub run_id: RunId,

    /// Deck ids stored before the run or claimed during it
    pub registry: DedupRegistry<DeckId>,

    /// Expansions of cards known to be stored
    pub cards: CardCatalog,

    /// Per-pool counters
    pub stats: RwLock<PipelineStats>,
}

impl SharedState {
    #[must_use]
    pub fn new(registry: DedupRegistry<DeckId>, cards: CardCatalog) -> Self {
        Self {
            run_id: RunId::new(),
            registry,
            cards,
            stats: RwLock::new(PipelineStats::default()),
        }
    }

    /// Applies one update to the counters under the write lock
    pub async fn record(&self, update: impl FnOnce(&mut PipelineStats)) {
        let mut stats = self.stats.write().await;
        update(&mut stats);
    }

    pub async fn record_failure(&self, kind: FailureKind) {
        self.record(|stats| *stats.failures.entry(kind).or_default() += 1)
            .await;
    }

    pub async fn snapshot(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }
}

/// Counters for every stage of the pipeline
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Listing pages answered with a deck list (bulk scan and tailer)
    pub pages_scanned: u64,

    /// Deck ids emitted to the detail queue
    pub ids_enqueued: u64,

    /// Deck ids dropped because they were already known or claimed
    pub ids_already_known: u64,

    /// Page workers that stopped after repeated unavailable pages
    pub page_workers_halted: u64,

    /// Deck details fetched and handed to the persisters
    pub decks_fetched: u64,

    /// Times a detail fetcher paused because the record queue was full
    pub backpressure_pauses: u64,

    /// New decks stored
    pub decks_inserted: u64,

    /// Records whose deck was already stored
    pub decks_already_stored: u64,

    /// New card definitions stored
    pub cards_inserted: u64,

    /// Storage sessions replaced after a failure
    pub session_resets: u64,

    /// Completed tailer cycles
    pub tail_cycles: u64,

    /// Failures per classification
    pub failures: BTreeMap<FailureKind, u64>,
}

impl PipelineStats {
    #[must_use]
    pub fn failures_of(&self, kind: FailureKind) -> u64 {
        self.failures.get(&kind).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.failures.values().sum()
    }
}
