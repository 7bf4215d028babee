//! Domain module - deck and card records
//!
//! Plain data types shared by every stage of the ingestion pipeline.
//! Each module is its own file in the domain/ directory; the commonly used
//! items are re-exported here for convenience.

pub mod card;
pub mod deck;
pub mod repositories;

pub use card::{CardId, CardRecord};
pub use deck::{DeckCardLink, DeckData, DeckDetail, DeckId, DeckLinks, DeckSummary, LinkedRecords, ListingPage};
pub use repositories::{PersistenceGateway, StoreError, StoreSession};
