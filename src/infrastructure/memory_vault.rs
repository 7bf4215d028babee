//! In-memory deck source.
//!
//! Serves listing pages and deck details from memory, records every request,
//! and can be scripted to fail specific requests. Pages that were never
//! published answer "upstream unavailable", like the real vault does past the
//! end of its listing.
//!
//! Not gated behind `#[cfg(test)]` so integration tests can drive whole
//! pipelines with it.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::domain::{CardId, CardRecord, DeckData, DeckDetail, DeckId, DeckLinks, LinkedRecords};
use crate::infrastructure::vault_client::{DeckSource, VaultError};

/// Failure to serve instead of a normal answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Throttled,
    Unavailable,
    Malformed,
    UnrecognizedCode,
}

impl ScriptedFailure {
    fn into_error(self) -> VaultError {
        match self {
            Self::Throttled => VaultError::Throttled {
                message: "Request was throttled.".to_string(),
                retry_after: None,
            },
            Self::Unavailable => VaultError::Unavailable("Internal Server Error".to_string()),
            Self::Malformed => match serde_json::from_str::<DeckDetail>("<html>") {
                Err(err) => VaultError::Malformed(err),
                Ok(_) => VaultError::Unavailable("unexpected payload".to_string()),
            },
            Self::UnrecognizedCode => VaultError::UnrecognizedCode {
                code: 418,
                message: "scripted".to_string(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct VaultState {
    pages: BTreeMap<u32, Vec<DeckId>>,
    decks: HashMap<DeckId, DeckDetail>,
    page_failures: HashMap<u32, VecDeque<ScriptedFailure>>,
    deck_failures: HashMap<DeckId, VecDeque<ScriptedFailure>>,
    page_requests: Vec<u32>,
    detail_requests: Vec<DeckId>,
    latency: Duration,
}

#[derive(Debug, Default)]
pub struct InMemoryVault {
    state: Mutex<VaultState>,
}

impl InMemoryVault {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `pages` listing pages of `per_page` generated decks each
    #[must_use]
    pub fn with_pages(pages: u32, per_page: u32) -> Self {
        let vault = Self::new();
        for page in 1..=pages {
            let decks = (0..per_page)
                .map(|slot| generated_deck(&format!("deck-{page:03}-{slot:02}"), 435))
                .collect();
            vault.set_page(page, decks);
        }
        vault
    }

    fn lock(&self) -> MutexGuard<'_, VaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes `decks` as listing page `page`, replacing what was there
    pub fn set_page(&self, page: u32, decks: Vec<DeckDetail>) {
        let mut state = self.lock();
        let ids = decks.iter().map(|deck| deck.id().clone()).collect();
        for deck in decks {
            state.decks.insert(deck.id().clone(), deck);
        }
        state.pages.insert(page, ids);
    }

    /// Makes a deck fetchable by id without listing it
    pub fn add_deck(&self, deck: DeckDetail) {
        self.lock().decks.insert(deck.id().clone(), deck);
    }

    /// The next `times` requests for `page` fail with `failure`
    pub fn fail_page(&self, page: u32, failure: ScriptedFailure, times: usize) {
        self.lock()
            .page_failures
            .entry(page)
            .or_default()
            .extend(std::iter::repeat_n(failure, times));
    }

    /// The next `times` detail requests for `id` fail with `failure`
    pub fn fail_deck(&self, id: &DeckId, failure: ScriptedFailure, times: usize) {
        self.lock()
            .deck_failures
            .entry(id.clone())
            .or_default()
            .extend(std::iter::repeat_n(failure, times));
    }

    /// Delay applied to every request
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    #[must_use]
    pub fn page_requests(&self) -> Vec<u32> {
        self.lock().page_requests.clone()
    }

    #[must_use]
    pub fn detail_requests(&self) -> Vec<DeckId> {
        self.lock().detail_requests.clone()
    }

    /// Every listed deck id in page order
    #[must_use]
    pub fn listed_ids(&self) -> Vec<DeckId> {
        self.lock().pages.values().flatten().cloned().collect()
    }

    fn latency(&self) -> Duration {
        self.lock().latency
    }
}

#[async_trait]
impl DeckSource for InMemoryVault {
    async fn list_page(&self, page: u32) -> Result<Vec<DeckId>, VaultError> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.page_requests.push(page);
        if let Some(failure) = state.page_failures.get_mut(&page).and_then(VecDeque::pop_front) {
            return Err(failure.into_error());
        }
        state
            .pages
            .get(&page)
            .cloned()
            .ok_or_else(|| VaultError::Unavailable(format!("page {page} does not exist")))
    }

    async fn fetch_deck(&self, id: &DeckId) -> Result<DeckDetail, VaultError> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.detail_requests.push(id.clone());
        if let Some(failure) = state.deck_failures.get_mut(id).and_then(VecDeque::pop_front) {
            return Err(failure.into_error());
        }
        state
            .decks
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::Unavailable(format!("deck {id} does not exist")))
    }
}

/// A deck with one card shared by every generated deck (printed in an older
/// expansion) and one card of its own that fills two slots.
#[must_use]
pub fn generated_deck(id: &str, expansion: i64) -> DeckDetail {
    let shared = card("card-shared", 341);
    let own = card(&format!("card-{id}"), expansion);
    let links = vec![shared.id.clone(), own.id.clone(), own.id.clone()];

    DeckDetail {
        data: DeckData {
            id: DeckId::new(id),
            name: format!("Generated {id}"),
            expansion,
            power_level: 1,
            chains: 0,
            wins: 0,
            losses: 0,
            links: DeckLinks { cards: links },
        },
        linked: LinkedRecords {
            cards: vec![shared, own],
        },
    }
}

fn card(id: &str, expansion: i64) -> CardRecord {
    CardRecord {
        id: CardId::new(id),
        card_title: Some(format!("Title of {id}")),
        house: Some("Logos".to_string()),
        card_type: Some("Action".to_string()),
        front_image: None,
        card_text: None,
        traits: None,
        amber: Some(1),
        power: None,
        armor: None,
        rarity: Some("Common".to_string()),
        flavor_text: None,
        card_number: Some(1),
        expansion,
        is_maverick: false,
        is_anomaly: false,
        is_enhanced: false,
        is_non_deck: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_pages_then_unavailable_past_the_end() {
        let vault = InMemoryVault::with_pages(2, 3);
        assert_eq!(vault.list_page(1).await.unwrap().len(), 3);
        assert!(matches!(vault.list_page(3).await, Err(VaultError::Unavailable(_))));
        assert_eq!(vault.page_requests(), vec![1, 3]);
        assert_eq!(vault.listed_ids().len(), 6);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let vault = InMemoryVault::with_pages(1, 1);
        vault.fail_page(1, ScriptedFailure::Throttled, 1);
        vault.fail_page(1, ScriptedFailure::Malformed, 1);

        assert!(matches!(vault.list_page(1).await, Err(VaultError::Throttled { .. })));
        assert!(matches!(vault.list_page(1).await, Err(VaultError::Malformed(_))));
        assert!(vault.list_page(1).await.is_ok());
    }
}
