//! Deck records: listing summaries, full detail payloads and deck/card links.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::card::{CardId, CardRecord};

/// Upstream identifier of a deck; the unit of deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeckId(String);

impl DeckId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeckId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for DeckId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One page of the deck search listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingPage {
    #[serde(default)]
    pub count: Option<u64>,
    pub data: Vec<DeckSummary>,
}

impl ListingPage {
    #[must_use]
    pub fn deck_ids(self) -> Vec<DeckId> {
        self.data.into_iter().map(|summary| summary.id).collect()
    }
}

/// Listing entry; only the identifier is consumed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckSummary {
    pub id: DeckId,
    #[serde(default)]
    pub name: Option<String>,
}

/// Full deck payload with its cards inlined
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckDetail {
    pub data: DeckData,
    #[serde(rename = "_linked", default)]
    pub linked: LinkedRecords,
}

impl DeckDetail {
    #[must_use]
    pub fn id(&self) -> &DeckId {
        &self.data.id
    }

    #[must_use]
    pub fn cards(&self) -> &[CardRecord] {
        &self.linked.cards
    }
}

/// Deck metadata and its ordered card list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckData {
    pub id: DeckId,
    pub name: String,
    pub expansion: i64,
    #[serde(default)]
    pub power_level: i64,
    #[serde(default)]
    pub chains: i64,
    #[serde(default)]
    pub wins: i64,
    #[serde(default)]
    pub losses: i64,
    #[serde(rename = "_links", default)]
    pub links: DeckLinks,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeckLinks {
    /// Card ids in deck order, duplicates included
    #[serde(default)]
    pub cards: Vec<CardId>,
}

/// Distinct card definitions referenced by a deck
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkedRecords {
    #[serde(default)]
    pub cards: Vec<CardRecord>,
}

/// Association between a deck and one of its card slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeckCardLink {
    pub position: u32,
    pub card_id: CardId,
    /// The card was first printed in an expansion older than the deck's
    pub is_legacy: bool,
}

impl DeckCardLink {
    #[must_use]
    pub fn new(position: u32, card_id: CardId, card_expansion: i64, deck_expansion: i64) -> Self {
        Self {
            position,
            card_id,
            is_legacy: card_expansion < deck_expansion,
        }
    }
}
