//! Run-wide dedup state.
//!
//! [`DedupRegistry`] holds every deck id that is stored or already claimed by
//! this run. [`CardCatalog`] remembers the expansion of every card known to be
//! stored, so persisters do not query the store for cards seen before.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError, RwLock};

use crate::domain::{CardId, DeckId};

/// Set of identifiers with an atomic check-and-insert.
///
/// Ids are never removed during a run.
#[derive(Debug)]
pub struct DedupRegistry<K = DeckId> {
    known: Mutex<HashSet<K>>,
}

impl<K: Eq + Hash> DedupRegistry<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            known: Mutex::new(HashSet::new()),
        }
    }

    /// Registry pre-filled with ids that already exist in the store
    pub fn with_known(ids: impl IntoIterator<Item = K>) -> Self {
        Self {
            known: Mutex::new(ids.into_iter().collect()),
        }
    }

    /// Claims `id` for this caller.
    ///
    /// Returns `true` exactly once per id; every later claim, from any
    /// worker, returns `false`.
    pub fn claim(&self, id: K) -> bool {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    /// Claims every id in order and returns the ones this caller won
    pub fn claim_all(&self, ids: impl IntoIterator<Item = K>) -> Vec<K>
    where
        K: Clone,
    {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        ids.into_iter().filter(|id| known.insert(id.clone())).collect()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.known.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash> Default for DedupRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Expansion lookup for cards known to be stored
#[derive(Debug, Default)]
pub struct CardCatalog {
    expansions: RwLock<HashMap<CardId, i64>>,
}

impl CardCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known(cards: impl IntoIterator<Item = (CardId, i64)>) -> Self {
        Self {
            expansions: RwLock::new(cards.into_iter().collect()),
        }
    }

    pub fn expansion(&self, id: &CardId) -> Option<i64> {
        self.expansions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    pub fn contains(&self, id: &CardId) -> bool {
        self.expansion(id).is_some()
    }

    /// Records a card as stored
    pub fn mark_known(&self, id: CardId, expansion: i64) {
        self.expansions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, expansion);
    }

    pub fn len(&self) -> usize {
        self.expansions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn claim_is_true_once() {
        let registry = DedupRegistry::new();
        assert!(registry.claim(DeckId::new("a")));
        assert!(!registry.claim(DeckId::new("a")));
        assert!(registry.contains(&DeckId::new("a")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn preloaded_ids_are_never_claimed() {
        let registry = DedupRegistry::with_known(["a", "b"].map(DeckId::new));
        let won = registry.claim_all(["a", "c", "b", "c", "d"].map(DeckId::new));
        assert_eq!(won, vec![DeckId::new("c"), DeckId::new("d")]);
        assert_eq!(registry.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let registry = Arc::new(DedupRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                (0..100)
                    .filter(|n| registry.claim(DeckId::new(format!("deck-{n}"))))
                    .count()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            wins += handle.await.unwrap();
        }
        assert_eq!(wins, 100);
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn catalog_remembers_expansions() {
        let catalog = CardCatalog::with_known([(CardId::new("c-1"), 341)]);
        assert_eq!(catalog.expansion(&CardId::new("c-1")), Some(341));
        assert!(!catalog.contains(&CardId::new("c-2")));

        catalog.mark_known(CardId::new("c-2"), 452);
        assert_eq!(catalog.expansion(&CardId::new("c-2")), Some(452));
        assert_eq!(catalog.len(), 2);
    }
}
