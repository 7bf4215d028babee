//! Repository interfaces for deck storage
//!
//! The pipeline only talks to storage through these traits. A gateway hands
//! out sessions; each persister owns one session at a time and replaces it
//! after a storage failure.

use async_trait::async_trait;
use std::error::Error as StdError;
use thiserror::Error;

use crate::domain::{CardId, CardRecord, DeckCardLink, DeckData, DeckId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),

    #[error("storage session unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn backend(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync + 'static {
    type Session: StoreSession + 'static;

    /// Acquires a fresh session
    async fn session(&self) -> Result<Self::Session, StoreError>;

    /// Most sessions that can be held at once, `None` when unbounded.
    ///
    /// Each persister keeps its session for its whole life, so a persister
    /// beyond this limit would only wait for a session that never frees up.
    fn session_limit(&self) -> Option<usize> {
        None
    }

    async fn count_decks(&self) -> Result<u64, StoreError>;

    /// Every deck id already stored; seeds the dedup registry
    async fn known_deck_ids(&self) -> Result<Vec<DeckId>, StoreError>;

    /// Expansion of every stored card; warms the card catalog
    async fn card_expansions(&self) -> Result<Vec<(CardId, i64)>, StoreError>;

    /// Stored card count per expansion, ordered by expansion
    async fn cards_by_expansion(&self) -> Result<Vec<(i64, u64)>, StoreError>;
}

#[async_trait]
pub trait StoreSession: Send {
    async fn card_exists(&mut self, id: &CardId) -> Result<bool, StoreError>;

    /// Returns `false` when the card was already present
    async fn insert_card(&mut self, card: &CardRecord) -> Result<bool, StoreError>;

    async fn card_expansion(&mut self, id: &CardId) -> Result<Option<i64>, StoreError>;

    async fn deck_exists(&mut self, id: &DeckId) -> Result<bool, StoreError>;

    /// Stores the deck row and its links atomically.
    ///
    /// Returns `false` without touching the links when the deck row already
    /// exists, so concurrent deliveries of one deck store it once.
    async fn insert_deck(&mut self, deck: &DeckData, links: &[DeckCardLink]) -> Result<bool, StoreError>;
}
