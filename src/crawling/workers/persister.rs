//! # Persister Worker
//!
//! Stores fetched decks: card definitions first, then the deck row with its
//! card links. Each worker keeps one storage session and swaps it for a fresh
//! one after a storage failure.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::WorkerExit;
use crate::crawling::failure::FailureKind;
use crate::crawling::queues::WorkQueue;
use crate::crawling::registry::CardCatalog;
use crate::crawling::state::SharedState;
use crate::domain::{CardId, DeckCardLink, DeckDetail, DeckId, PersistenceGateway, StoreError, StoreSession};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("deck {deck} links card {card}, which is neither in the payload nor stored")]
    UnknownCard { deck: DeckId, card: CardId },
}

/// Result of persisting one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted { cards_added: usize },
    /// The deck was already stored; only missing cards were added
    AlreadyStored { cards_added: usize },
}

/// Persists one fetched deck through `session`.
///
/// Safe to call again with the same record: cards and the deck row are only
/// inserted when missing, and links are written together with the deck row.
pub async fn persist_record<T>(
    session: &mut T,
    record: &DeckDetail,
    cards: &CardCatalog,
) -> Result<PersistOutcome, PersistError>
where
    T: StoreSession + ?Sized,
{
    let mut cards_added = 0;
    for card in record.cards() {
        if cards.contains(&card.id) {
            continue;
        }
        if !session.card_exists(&card.id).await? && session.insert_card(card).await? {
            cards_added += 1;
        }
        cards.mark_known(card.id.clone(), card.expansion);
    }

    let deck = &record.data;
    if session.deck_exists(&deck.id).await? {
        return Ok(PersistOutcome::AlreadyStored { cards_added });
    }

    let payload: HashMap<&CardId, i64> = record
        .cards()
        .iter()
        .map(|card| (&card.id, card.expansion))
        .collect();

    let mut links = Vec::with_capacity(deck.links.cards.len());
    for (position, card_id) in (0_u32..).zip(&deck.links.cards) {
        let expansion = match payload.get(card_id).copied().or_else(|| cards.expansion(card_id)) {
            Some(expansion) => expansion,
            None => session
                .card_expansion(card_id)
                .await?
                .ok_or_else(|| PersistError::UnknownCard {
                    deck: deck.id.clone(),
                    card: card_id.clone(),
                })?,
        };
        links.push(DeckCardLink::new(position, card_id.clone(), expansion, deck.expansion));
    }

    if session.insert_deck(deck, &links).await? {
        Ok(PersistOutcome::Inserted { cards_added })
    } else {
        Ok(PersistOutcome::AlreadyStored { cards_added })
    }
}

pub struct Persister<G: PersistenceGateway> {
    name: String,
    gateway: Arc<G>,
    records: Arc<WorkQueue<DeckDetail>>,
    state: Arc<SharedState>,
    session: Option<G::Session>,
}

impl<G: PersistenceGateway> Persister<G> {
    pub fn new(
        name: impl Into<String>,
        gateway: Arc<G>,
        records: Arc<WorkQueue<DeckDetail>>,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            name: name.into(),
            gateway,
            records,
            state,
            session: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(mut self, cancel: CancellationToken) -> WorkerExit {
        debug!("Starting up");
        while let Some(record) = self.records.dequeue(&cancel).await {
            self.process_record(&record).await;
            self.records.task_done();
        }
        // dropping the session hands the connection back
        self.session = None;
        WorkerExit::Cancelled
    }

    async fn process_record(&mut self, record: &DeckDetail) {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => match self.gateway.session().await {
                Ok(session) => session,
                Err(err) => {
                    self.state.record_failure(FailureKind::PersistenceFailure).await;
                    error!(deck = %record.id(), "No storage session, deck lost: {err}");
                    return;
                }
            },
        };

        match persist_record(&mut session, record, &self.state.cards).await {
            Ok(outcome) => {
                self.session = Some(session);
                Self::record_outcome(&self.state, record, outcome).await;
            }
            Err(err) => {
                let kind = FailureKind::from(&err);
                self.state.record_failure(kind).await;
                if kind == FailureKind::PersistenceFailure {
                    drop(session);
                    warn!(deck = %record.id(), "Storage failure, deck lost, replacing session: {err}");
                    self.reset_session().await;
                } else {
                    error!(record = ?record, %kind, "Failed to persist deck: {err}");
                    self.session = Some(session);
                }
            }
        }
    }

    async fn record_outcome(state: &SharedState, record: &DeckDetail, outcome: PersistOutcome) {
        match outcome {
            PersistOutcome::Inserted { cards_added } => {
                debug!(deck = %record.id(), cards_added, "Deck stored");
                state
                    .record(|stats| {
                        stats.decks_inserted += 1;
                        stats.cards_inserted += cards_added as u64;
                    })
                    .await;
            }
            PersistOutcome::AlreadyStored { cards_added } => {
                debug!(deck = %record.id(), "Deck already stored");
                state
                    .record(|stats| {
                        stats.decks_already_stored += 1;
                        stats.cards_inserted += cards_added as u64;
                    })
                    .await;
            }
        }
    }

    async fn reset_session(&mut self) {
        self.state.record(|stats| stats.session_resets += 1).await;
        match self.gateway.session().await {
            Ok(session) => {
                info!("Storage session replaced");
                self.session = Some(session);
            }
            Err(err) => {
                // retried on the next record
                warn!("Could not open a new storage session: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::registry::DedupRegistry;
    use crate::domain::{CardRecord, DeckData};
    use crate::infrastructure::memory_vault::generated_deck;
    use crate::infrastructure::{DatabaseConnection, SqliteDeckStore};
    use async_trait::async_trait;
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::marker::PhantomData;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    async fn sqlite_store() -> (tempfile::TempDir, Arc<SqliteDeckStore>) {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConnection::open(dir.path().join("decks.sqlite"), 4).await.unwrap();
        (dir, Arc::new(SqliteDeckStore::new(db)))
    }

    fn state() -> Arc<SharedState> {
        Arc::new(SharedState::new(DedupRegistry::new(), CardCatalog::new()))
    }

    #[tokio::test]
    async fn persisting_twice_stores_one_deck() {
        let (_dir, store) = sqlite_store().await;
        let mut session = store.session().await.unwrap();
        let catalog = CardCatalog::new();
        let record = generated_deck("d-1", 435);

        let first = persist_record(&mut session, &record, &catalog).await.unwrap();
        let second = persist_record(&mut session, &record, &catalog).await.unwrap();

        assert_eq!(first, PersistOutcome::Inserted { cards_added: 2 });
        assert_eq!(second, PersistOutcome::AlreadyStored { cards_added: 0 });
        let id = DeckId::new("d-1");
        assert_eq!(store.count_decks().await.unwrap(), 1);
        assert_eq!(store.count_links(&id).await.unwrap(), 3);
        // the shared card is printed in an older expansion
        assert_eq!(store.legacy_flags(&id).await.unwrap(), vec![true, false, false]);
    }

    #[tokio::test]
    async fn shared_cards_are_inserted_once() {
        let (_dir, store) = sqlite_store().await;
        let mut session = store.session().await.unwrap();
        let catalog = CardCatalog::new();

        persist_record(&mut session, &generated_deck("d-1", 435), &catalog).await.unwrap();
        let outcome = persist_record(&mut session, &generated_deck("d-2", 435), &catalog)
            .await
            .unwrap();

        assert_eq!(outcome, PersistOutcome::Inserted { cards_added: 1 });
        assert_eq!(store.count_cards().await.unwrap(), 3);
        assert_eq!(catalog.len(), 3);
    }

    #[tokio::test]
    async fn stored_card_missing_from_payload_is_looked_up() {
        let (_dir, store) = sqlite_store().await;
        let mut session = store.session().await.unwrap();
        persist_record(&mut session, &generated_deck("d-1", 435), &CardCatalog::new())
            .await
            .unwrap();

        // fresh catalog and no inlined cards: the expansion comes from the store
        let mut record = generated_deck("d-2", 496);
        record.data.links.cards = vec![CardId::new("card-shared"), CardId::new("card-d-1")];
        record.linked.cards.clear();
        persist_record(&mut session, &record, &CardCatalog::new()).await.unwrap();

        assert_eq!(
            store.legacy_flags(&DeckId::new("d-2")).await.unwrap(),
            vec![true, true]
        );
    }

    #[tokio::test]
    async fn unknown_card_is_unclassified_and_keeps_the_session() {
        let (_dir, store) = sqlite_store().await;
        let state = state();
        let records = Arc::new(WorkQueue::unbounded("records"));

        let mut broken = generated_deck("broken", 435);
        broken.data.links.cards.push(CardId::new("nowhere"));
        records.enqueue(broken).await.unwrap();
        records.enqueue(generated_deck("fine", 435)).await.unwrap();

        let cancel = CancellationToken::new();
        let worker = Persister::new("inserter-0", Arc::clone(&store), Arc::clone(&records), Arc::clone(&state));
        let handle = tokio::spawn(worker.run(cancel.clone()));
        records.join().await;
        cancel.cancel();
        handle.await.unwrap();

        let stats = state.snapshot().await;
        assert_eq!(stats.failures_of(FailureKind::Unclassified), 1);
        assert_eq!(stats.session_resets, 0);
        assert_eq!(stats.decks_inserted, 1);
        assert_eq!(store.known_deck_ids().await.unwrap(), vec![DeckId::new("fine")]);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_counted_as_already_stored() {
        let (_dir, store) = sqlite_store().await;
        let state = state();
        let records = Arc::new(WorkQueue::unbounded("records"));
        records.enqueue(generated_deck("twice", 435)).await.unwrap();
        records.enqueue(generated_deck("twice", 435)).await.unwrap();

        let cancel = CancellationToken::new();
        let worker = Persister::new("inserter-0", Arc::clone(&store), Arc::clone(&records), Arc::clone(&state));
        let handle = tokio::spawn(worker.run(cancel.clone()));
        records.join().await;
        cancel.cancel();
        handle.await.unwrap();

        let stats = state.snapshot().await;
        assert_eq!((stats.decks_inserted, stats.decks_already_stored), (1, 1));
        assert_eq!(stats.cards_inserted, 2);
        assert_eq!(store.count_links(&DeckId::new("twice")).await.unwrap(), 3);
    }

    /// Gateway whose first `broken` sessions fail every call
    #[derive(Default)]
    struct FlakyGateway {
        decks: Arc<Mutex<HashSet<DeckId>>>,
        broken: AtomicUsize,
        opened: AtomicUsize,
    }

    /// Send but not Sync, like a connection handle with interior state
    struct FlakySession {
        broken: bool,
        decks: Arc<Mutex<HashSet<DeckId>>>,
        _not_sync: PhantomData<Cell<()>>,
    }

    impl FlakySession {
        fn check(&self) -> Result<(), StoreError> {
            if self.broken {
                Err(StoreError::Unavailable("connection reset".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl PersistenceGateway for FlakyGateway {
        type Session = FlakySession;

        async fn session(&self) -> Result<FlakySession, StoreError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let broken = self
                .broken
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(FlakySession {
                broken,
                decks: Arc::clone(&self.decks),
                _not_sync: PhantomData,
            })
        }

        async fn count_decks(&self) -> Result<u64, StoreError> {
            Ok(self.decks.lock().unwrap_or_else(PoisonError::into_inner).len() as u64)
        }

        async fn known_deck_ids(&self) -> Result<Vec<DeckId>, StoreError> {
            Ok(Vec::new())
        }

        async fn card_expansions(&self) -> Result<Vec<(CardId, i64)>, StoreError> {
            Ok(Vec::new())
        }

        async fn cards_by_expansion(&self) -> Result<Vec<(i64, u64)>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl StoreSession for FlakySession {
        async fn card_exists(&mut self, _id: &CardId) -> Result<bool, StoreError> {
            self.check().map(|()| false)
        }

        async fn insert_card(&mut self, _card: &CardRecord) -> Result<bool, StoreError> {
            self.check().map(|()| true)
        }

        async fn card_expansion(&mut self, _id: &CardId) -> Result<Option<i64>, StoreError> {
            self.check().map(|()| None)
        }

        async fn deck_exists(&mut self, id: &DeckId) -> Result<bool, StoreError> {
            self.check()?;
            Ok(self.decks.lock().unwrap_or_else(PoisonError::into_inner).contains(id))
        }

        async fn insert_deck(&mut self, deck: &DeckData, _links: &[DeckCardLink]) -> Result<bool, StoreError> {
            self.check()?;
            Ok(self
                .decks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(deck.id.clone()))
        }
    }

    #[tokio::test]
    async fn storage_failure_replaces_the_session() {
        let gateway = Arc::new(FlakyGateway {
            broken: AtomicUsize::new(1),
            ..FlakyGateway::default()
        });
        let state = state();
        let records = Arc::new(WorkQueue::unbounded("records"));
        records.enqueue(generated_deck("lost", 435)).await.unwrap();
        records.enqueue(generated_deck("kept", 435)).await.unwrap();

        let cancel = CancellationToken::new();
        let worker = Persister::new("inserter-0", Arc::clone(&gateway), Arc::clone(&records), Arc::clone(&state));
        let handle = tokio::spawn(worker.run(cancel.clone()));
        records.join().await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), WorkerExit::Cancelled);

        let stats = state.snapshot().await;
        assert_eq!(stats.session_resets, 1);
        assert_eq!(stats.failures_of(FailureKind::PersistenceFailure), 1);
        assert_eq!(stats.decks_inserted, 1);
        assert_eq!(gateway.opened.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.count_decks().await.unwrap(), 1);
    }
}
