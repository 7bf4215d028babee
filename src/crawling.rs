//! # Deck Ingestion Pipeline
//!
//! Concurrent stages that walk the vault's deck listing, fetch every unseen
//! deck and store it:
//! - `queues`: FIFO work queues with join support
//! - `registry`: dedup registry and card catalog
//! - `failure`: classification of upstream and storage failures
//! - `workers`: one module per stage
//! - `orchestrator`: builds a run, drains it and tears it down

pub mod backoff;
pub mod failure;
pub mod orchestrator;
pub mod queues;
pub mod registry;
pub mod state;
pub mod stop_signal;
pub mod workers;

pub use backoff::Backoff;
pub use failure::FailureKind;
pub use orchestrator::{Orchestrator, OrchestratorError, PageRange, PipelineConfig, RunSummary, TailSettings};
pub use queues::{QueueError, QueueMetrics, WorkQueue};
pub use registry::{CardCatalog, DedupRegistry};
pub use state::{PipelineStats, RunId, SharedState};
pub use stop_signal::StopFile;
pub use workers::{WorkerExit, WorkerReport};
