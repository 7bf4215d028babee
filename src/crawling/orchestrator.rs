//! # Pipeline Orchestrator
//!
//! Wires the stages of one ingestion run together:
//!
//! ```text
//! pages -> [A] -> pager-N -> [B] <- tailer
//!                             |
//!                        fetcher-N -> [C] -> inserter-N -> store
//! ```
//!
//! The orchestrator builds the queues and the run state, seeds queue A, spawns
//! one `JoinSet` per pool and then drains the stages in order: A, the tailer,
//! B, C. Once everything is drained (or the shutdown token fires) the workers
//! are cancelled and joined.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::crawling::backoff::Backoff;
use crate::crawling::queues::{QueueError, QueueMetrics, WorkQueue};
use crate::crawling::registry::{CardCatalog, DedupRegistry};
use crate::crawling::state::{PipelineStats, RunId, SharedState};
use crate::crawling::stop_signal::StopFile;
use crate::crawling::workers::{
    Backpressure, DetailFetcher, FreshnessTailer, PageDiscoverer, Persister, WorkerExit, WorkerReport,
    emit_unseen,
};
use crate::domain::{DeckDetail, DeckId, PersistenceGateway, StoreError};
use crate::infrastructure::config::{AppConfig, TimingConfig};
use crate::infrastructure::vault_client::DeckSource;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid page range {start}..={end}")]
    InvalidRange { start: u32, end: u32 },
}

/// Pool sizes and timings of a run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub page_workers: usize,
    pub detail_fetchers: usize,
    pub persisters: usize,
    pub max_consecutive_unavailable: u32,
    pub backpressure: Backpressure,
    /// Hard capacity of queue C, `0` for unbounded
    pub record_queue_capacity: usize,
    pub throttle_base_delay: Duration,
    pub throttle_max_delay: Duration,
    /// How long teardown waits for a pool before aborting it
    pub shutdown_timeout: Duration,
}

impl PipelineConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        let workers = &config.workers;
        let timing = &config.timing;
        Self {
            page_workers: workers.page_workers.max(1),
            detail_fetchers: workers.detail_fetchers.max(1),
            persisters: workers.persisters.max(1),
            max_consecutive_unavailable: workers.max_consecutive_unavailable,
            backpressure: Backpressure {
                threshold: workers.backpressure_threshold,
                delay: timing.backpressure_delay(),
                jitter: timing.backpressure_jitter(),
            },
            record_queue_capacity: workers.record_queue_capacity,
            throttle_base_delay: timing.throttle_base_delay(),
            throttle_max_delay: timing.throttle_max_delay(),
            shutdown_timeout: timing.shutdown_timeout(),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.throttle_base_delay, self.throttle_max_delay).with_jitter(self.throttle_base_delay)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

/// Inclusive range of listing pages to scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
    /// Seed from `end` down to `start`
    pub reverse: bool,
}

impl PageRange {
    pub fn new(start: u32, end: u32, reverse: bool) -> Result<Self, OrchestratorError> {
        if start == 0 || end < start {
            return Err(OrchestratorError::InvalidRange { start, end });
        }
        Ok(Self { start, end, reverse })
    }

    /// Pages in seeding order
    #[must_use]
    pub fn pages(&self) -> Vec<u32> {
        let pages = self.start..=self.end;
        if self.reverse {
            pages.rev().collect()
        } else {
            pages.collect()
        }
    }
}

/// Freshness tailer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailSettings {
    pub interval: Duration,
    pub stop_file: PathBuf,
}

impl TailSettings {
    #[must_use]
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            interval: timing.tail_interval(),
            stop_file: timing.stop_file.clone(),
        }
    }
}

/// Outcome of one orchestrated run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub stats: PipelineStats,
    /// Registry size at the end of the run
    pub known_ids: usize,
    pub stored_decks: u64,
    pub elapsed: Duration,
    /// The shutdown token fired before the drain completed
    pub interrupted: bool,
    /// Pages, deck ids and records, in pipeline order
    pub queues: Vec<QueueMetrics>,
    pub workers: Vec<WorkerReport>,
}

impl RunSummary {
    pub fn log(&self) {
        let stats = &self.stats;
        info!(
            run_id = %self.run_id,
            elapsed = ?self.elapsed,
            interrupted = self.interrupted,
            pages = stats.pages_scanned,
            enqueued = stats.ids_enqueued,
            fetched = stats.decks_fetched,
            inserted = stats.decks_inserted,
            already_stored = stats.decks_already_stored,
            cards = stats.cards_inserted,
            failures = stats.total_failures(),
            "Run finished, {} decks stored",
            self.stored_decks
        );
        for (kind, count) in &stats.failures {
            info!(%kind, count, "Failures");
        }
        for queue in &self.queues {
            debug!(
                queue = queue.name,
                enqueued = queue.total_enqueued,
                dequeued = queue.total_dequeued,
                peak = queue.peak_len,
                "Queue traffic"
            );
        }
    }
}

/// What a run starts from
#[derive(Debug, Default)]
struct RunPlan {
    pages: Vec<u32>,
    ids: Vec<DeckId>,
    tail: Option<TailSettings>,
}

/// How a drain wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Completed,
    /// Every worker of the pool exited with items left
    Abandoned,
    Interrupted,
}

pub struct Orchestrator<S: DeckSource, G: PersistenceGateway> {
    source: Arc<S>,
    gateway: Arc<G>,
    config: PipelineConfig,
    shutdown: CancellationToken,
}

impl<S: DeckSource, G: PersistenceGateway> Orchestrator<S, G> {
    /// `shutdown` interrupts any run in progress; workers are then torn down
    /// the same way as after a normal drain.
    pub fn new(source: Arc<S>, gateway: Arc<G>, config: PipelineConfig, shutdown: CancellationToken) -> Self {
        Self {
            source,
            gateway,
            config,
            shutdown,
        }
    }

    /// Bulk scan of `range`, optionally tailing the newest pages alongside.
    ///
    /// With a tailer the run only finishes once the tailer stops (stop file
    /// or shutdown).
    pub async fn run_pages(
        &self,
        range: PageRange,
        tail: Option<TailSettings>,
    ) -> Result<RunSummary, OrchestratorError> {
        info!(
            start = range.start,
            end = range.end,
            reverse = range.reverse,
            tail = tail.is_some(),
            "Fetching listing pages"
        );
        self.execute(RunPlan {
            pages: range.pages(),
            tail,
            ..RunPlan::default()
        })
        .await
    }

    /// Fetches and stores the given decks; ids already stored are skipped
    pub async fn run_ids(&self, ids: Vec<DeckId>) -> Result<RunSummary, OrchestratorError> {
        info!(count = ids.len(), "Fetching decks by id");
        self.execute(RunPlan {
            ids,
            ..RunPlan::default()
        })
        .await
    }

    /// Tails the newest pages until the stop file appears or shutdown
    pub async fn run_tail(&self, tail: TailSettings) -> Result<RunSummary, OrchestratorError> {
        self.execute(RunPlan {
            tail: Some(tail),
            ..RunPlan::default()
        })
        .await
    }

    async fn load_state(&self) -> Result<SharedState, StoreError> {
        let known = self.gateway.known_deck_ids().await?;
        let cards = self.gateway.card_expansions().await?;
        info!(decks = known.len(), cards = cards.len(), "Loaded stored ids");
        Ok(SharedState::new(
            DedupRegistry::with_known(known),
            CardCatalog::with_known(cards),
        ))
    }

    async fn execute(&self, plan: RunPlan) -> Result<RunSummary, OrchestratorError> {
        let started = Instant::now();
        let state = Arc::new(self.load_state().await?);
        let mut run = Run::new(Arc::clone(&state), &self.config, self.shutdown.child_token());
        info!(run_id = %state.run_id, "Run started");

        for page in &plan.pages {
            run.pages.enqueue(*page).await?;
        }
        if !plan.ids.is_empty() {
            let requested = plan.ids.len();
            let queued = emit_unseen(plan.ids, &state, &run.ids).await?;
            if queued < requested {
                info!(skipped = requested - queued, "Skipping decks already stored");
            }
        }

        self.spawn_persisters(&mut run);
        self.spawn_fetchers(&mut run);
        if !plan.pages.is_empty() {
            self.spawn_pagers(&mut run);
        }
        if let Some(tail) = &plan.tail {
            self.spawn_tailer(&mut run, tail);
        }

        let interrupted = run.drain().await;
        if interrupted {
            warn!("Interrupted, shutting down workers");
        }
        run.teardown(self.config.shutdown_timeout).await;

        let summary = RunSummary {
            run_id: state.run_id,
            stats: state.snapshot().await,
            known_ids: state.registry.len(),
            stored_decks: self.gateway.count_decks().await?,
            elapsed: started.elapsed(),
            interrupted,
            queues: vec![run.pages.metrics(), run.ids.metrics(), run.records.metrics()],
            workers: run.reports,
        };
        summary.log();
        Ok(summary)
    }

    fn spawn_pagers(&self, run: &mut Run) {
        for n in 0..self.config.page_workers {
            let worker = PageDiscoverer::new(
                format!("pager-{n}"),
                Arc::clone(&self.source),
                Arc::clone(&run.pages),
                Arc::clone(&run.ids),
                Arc::clone(&run.state),
                self.config.max_consecutive_unavailable,
                self.config.backoff(),
            );
            let name = worker.name().to_owned();
            spawn_worker(&mut run.pagers, name, worker.run(run.cancel.clone()));
        }
    }

    fn spawn_fetchers(&self, run: &mut Run) {
        for n in 0..self.config.detail_fetchers {
            let worker = DetailFetcher::new(
                format!("fetcher-{n}"),
                Arc::clone(&self.source),
                Arc::clone(&run.ids),
                Arc::clone(&run.records),
                Arc::clone(&run.state),
                self.config.backpressure,
                self.config.backoff(),
            );
            let name = worker.name().to_owned();
            spawn_worker(&mut run.fetchers, name, worker.run(run.cancel.clone()));
        }
    }

    /// Persister pool size, capped by how many sessions the store can hold
    fn persister_count(&self) -> usize {
        let wanted = self.config.persisters.max(1);
        match self.gateway.session_limit() {
            Some(limit) if limit < wanted => {
                warn!(wanted, limit, "Store cannot hold a session per persister, shrinking the pool");
                limit.max(1)
            }
            _ => wanted,
        }
    }

    fn spawn_persisters(&self, run: &mut Run) {
        for n in 0..self.persister_count() {
            let worker = Persister::new(
                format!("inserter-{n}"),
                Arc::clone(&self.gateway),
                Arc::clone(&run.records),
                Arc::clone(&run.state),
            );
            let name = worker.name().to_owned();
            spawn_worker(&mut run.persisters, name, worker.run(run.cancel.clone()));
        }
    }

    fn spawn_tailer(&self, run: &mut Run, tail: &TailSettings) {
        let worker = FreshnessTailer::new(
            Arc::clone(&self.source),
            Arc::clone(&run.ids),
            Arc::clone(&run.state),
            tail.interval,
            StopFile::new(tail.stop_file.clone()),
            self.config.backoff(),
        );
        spawn_worker(&mut run.tailer, "tailer".to_owned(), worker.run(run.cancel.clone()));
    }
}

fn spawn_worker<F>(pool: &mut JoinSet<WorkerReport>, name: String, run: F)
where
    F: Future<Output = WorkerExit> + Send + 'static,
{
    let span = info_span!("worker", name = %name);
    pool.spawn(
        async move {
            let exit = run.await;
            WorkerReport::new(name, exit)
        }
        .instrument(span),
    );
}

/// Queues, pools and state of one run in progress
struct Run {
    state: Arc<SharedState>,
    pages: Arc<WorkQueue<u32>>,
    ids: Arc<WorkQueue<DeckId>>,
    records: Arc<WorkQueue<DeckDetail>>,
    pagers: JoinSet<WorkerReport>,
    tailer: JoinSet<WorkerReport>,
    fetchers: JoinSet<WorkerReport>,
    persisters: JoinSet<WorkerReport>,
    /// Child of the shutdown token; cancelled at teardown
    cancel: CancellationToken,
    reports: Vec<WorkerReport>,
}

impl Run {
    fn new(state: Arc<SharedState>, config: &PipelineConfig, cancel: CancellationToken) -> Self {
        Self {
            state,
            pages: Arc::new(WorkQueue::unbounded("pages")),
            ids: Arc::new(WorkQueue::unbounded("deck_ids")),
            records: Arc::new(WorkQueue::from_capacity("records", config.record_queue_capacity)),
            pagers: JoinSet::new(),
            tailer: JoinSet::new(),
            fetchers: JoinSet::new(),
            persisters: JoinSet::new(),
            cancel,
            reports: Vec::new(),
        }
    }

    /// Waits for the stages in order; returns `true` when interrupted
    async fn drain(&mut self) -> bool {
        if drain_queue(&self.pages, &mut self.pagers, &self.cancel, &mut self.reports).await == Drain::Interrupted {
            return true;
        }
        debug!("Page queue drained");

        if !self.tailer.is_empty() {
            let tailer = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return true,
                tailer = self.tailer.join_next() => tailer,
            };
            if let Some(result) = tailer {
                collect(result, &mut self.reports);
            }
            debug!("Tailer finished");
        }

        if drain_queue(&self.ids, &mut self.fetchers, &self.cancel, &mut self.reports).await == Drain::Interrupted {
            return true;
        }
        debug!("Deck id queue drained");

        if drain_queue(&self.records, &mut self.persisters, &self.cancel, &mut self.reports).await
            == Drain::Interrupted
        {
            return true;
        }
        debug!("Record queue drained");
        false
    }

    /// Cancels every worker and waits for the pools to finish
    async fn teardown(&mut self, timeout: Duration) {
        self.cancel.cancel();
        self.pages.close();
        self.ids.close();
        self.records.close();

        for pool in [
            &mut self.pagers,
            &mut self.tailer,
            &mut self.fetchers,
            &mut self.persisters,
        ] {
            join_pool(pool, timeout, &mut self.reports).await;
        }
        debug!(workers = self.reports.len(), "All workers joined");
    }
}

/// Waits until `queue` has no unfinished items.
///
/// Gives up when every worker of `pool` has exited, since nothing is left to
/// consume the remaining items.
async fn drain_queue<T: Send>(
    queue: &WorkQueue<T>,
    pool: &mut JoinSet<WorkerReport>,
    cancel: &CancellationToken,
    reports: &mut Vec<WorkerReport>,
) -> Drain {
    loop {
        if pool.is_empty() && queue.unfinished() > 0 {
            warn!(
                queue = queue.name(),
                abandoned = queue.unfinished(),
                "No workers left, abandoning queued items"
            );
            return Drain::Abandoned;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Drain::Interrupted,
            () = queue.join() => return Drain::Completed,
            Some(result) = pool.join_next() => collect(result, reports),
        }
    }
}

async fn join_pool(pool: &mut JoinSet<WorkerReport>, timeout: Duration, reports: &mut Vec<WorkerReport>) {
    let joined = tokio::time::timeout(timeout, async {
        while let Some(result) = pool.join_next().await {
            collect(result, reports);
        }
    })
    .await;

    if joined.is_err() {
        warn!(remaining = pool.len(), ?timeout, "Workers did not stop in time, aborting");
        pool.abort_all();
        while let Some(result) = pool.join_next().await {
            collect(result, reports);
        }
    }
}

fn collect(result: Result<WorkerReport, JoinError>, reports: &mut Vec<WorkerReport>) {
    match result {
        Ok(report) => {
            debug!(worker = %report.name, exit = %report.exit, "Worker finished");
            reports.push(report);
        }
        Err(err) if err.is_cancelled() => debug!("Worker aborted"),
        Err(err) => error!("Worker task failed: {err}"),
    }
}
