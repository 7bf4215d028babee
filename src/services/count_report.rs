//! Periodic report of how fast the store is growing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{PersistenceGateway, StoreError};

/// One report line
#[derive(Debug, Clone, PartialEq)]
pub struct CountReport {
    pub stored_decks: u64,
    /// Mean growth per interval since the first sample
    pub all_time_average: f64,
    /// Mean growth per interval over the last `window` intervals
    pub running_average: f64,
    /// Stored cards per expansion, ordered by expansion
    pub cards_by_expansion: Vec<(i64, u64)>,
}

/// Deck count history for the running averages
#[derive(Debug, Clone)]
pub struct ReportWindow {
    window: usize,
    first: Option<u64>,
    last: Option<u64>,
    intervals: u64,
    increases: VecDeque<i64>,
}

impl ReportWindow {
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            first: None,
            last: None,
            intervals: 0,
            increases: VecDeque::with_capacity(window),
        }
    }

    /// Adds a sample and returns `(all_time_average, running_average)`
    pub fn observe(&mut self, count: u64) -> (f64, f64) {
        if let Some(last) = self.last {
            if self.increases.len() == self.window {
                self.increases.pop_front();
            }
            self.increases.push_back(count as i64 - last as i64);
            self.intervals += 1;
        }
        let first = *self.first.get_or_insert(count);
        self.last = Some(count);

        let all_time = if self.intervals == 0 {
            0.0
        } else {
            (count as f64 - first as f64) / self.intervals as f64
        };
        let running = if self.increases.is_empty() {
            0.0
        } else {
            self.increases.iter().sum::<i64>() as f64 / self.increases.len() as f64
        };
        (all_time, running)
    }
}

pub struct CountReporter<G: PersistenceGateway> {
    gateway: Arc<G>,
    interval: Duration,
    window: ReportWindow,
}

impl<G: PersistenceGateway> CountReporter<G> {
    pub fn new(gateway: Arc<G>, interval: Duration, window: usize) -> Self {
        Self {
            gateway,
            interval,
            window: ReportWindow::new(window),
        }
    }

    /// Takes one sample
    pub async fn sample(&mut self) -> Result<CountReport, StoreError> {
        let stored_decks = self.gateway.count_decks().await?;
        let cards_by_expansion = self.gateway.cards_by_expansion().await?;
        let (all_time_average, running_average) = self.window.observe(stored_decks);
        Ok(CountReport {
            stored_decks,
            all_time_average,
            running_average,
            cards_by_expansion,
        })
    }

    /// Logs a report every interval until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sample().await {
                Ok(report) => info!(
                    stored = report.stored_decks,
                    interval = ?self.interval,
                    all_time_average = format_args!("{:.2}", report.all_time_average),
                    running_average = format_args!("{:.2}", report.running_average),
                    cards = ?report.cards_by_expansion,
                    "Deck count"
                ),
                Err(err) => warn!("Could not count decks: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_vault::generated_deck;
    use crate::infrastructure::{DatabaseConnection, SqliteDeckStore};
    use crate::crawling::registry::CardCatalog;
    use crate::crawling::workers::persister::persist_record;

    #[test]
    fn first_sample_has_no_growth() {
        let mut window = ReportWindow::new(3);
        assert_eq!(window.observe(100), (0.0, 0.0));
    }

    #[test]
    fn running_average_only_covers_the_window() {
        let mut window = ReportWindow::new(2);
        window.observe(0);
        window.observe(10);
        window.observe(40);
        let (all_time, running) = window.observe(50);

        // increases 10, 30, 10
        assert!((all_time - 50.0 / 3.0).abs() < f64::EPSILON);
        assert!((running - 20.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn sample_reads_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConnection::open(dir.path().join("decks.sqlite"), 2).await.unwrap();
        let store = Arc::new(SqliteDeckStore::new(db));
        let mut reporter = CountReporter::new(Arc::clone(&store), Duration::from_secs(60), 5);

        let empty = reporter.sample().await.unwrap();
        assert_eq!(empty.stored_decks, 0);

        let mut session = store.session().await.unwrap();
        let catalog = CardCatalog::new();
        for id in ["a", "b"] {
            persist_record(&mut session, &generated_deck(id, 435), &catalog).await.unwrap();
        }
        let report = reporter.sample().await.unwrap();

        assert_eq!(report.stored_decks, 2);
        assert!((report.running_average - 2.0).abs() < f64::EPSILON);
        assert_eq!(report.cards_by_expansion, vec![(341, 1), (435, 2)]);
    }
}
