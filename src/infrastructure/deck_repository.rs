//! SQLite implementation of the deck repository interfaces

use async_trait::async_trait;
use chrono::Utc;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Sqlite};
use tracing::debug;

use crate::domain::{
    CardId, CardRecord, DeckCardLink, DeckData, DeckId, PersistenceGateway, StoreError, StoreSession,
};
use crate::infrastructure::database_connection::DatabaseConnection;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::Unavailable(err.to_string()),
            other => Self::backend(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteDeckStore {
    db: DatabaseConnection,
}

impl SqliteDeckStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

/// Inspection queries for tests
#[cfg(test)]
impl SqliteDeckStore {
    /// Number of deck/card link rows for one deck
    pub async fn count_links(&self, deck_id: &DeckId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deck_card WHERE deck_id = ?")
            .bind(deck_id.as_str())
            .fetch_one(self.db.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Legacy flags of a deck's links in slot order
    pub async fn legacy_flags(&self, deck_id: &DeckId) -> Result<Vec<bool>, StoreError> {
        let flags: Vec<bool> =
            sqlx::query_scalar("SELECT is_legacy FROM deck_card WHERE deck_id = ? ORDER BY position")
                .bind(deck_id.as_str())
                .fetch_all(self.db.pool())
                .await?;
        Ok(flags)
    }

    pub async fn count_cards(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM card")
            .fetch_one(self.db.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl PersistenceGateway for SqliteDeckStore {
    type Session = SqliteSession;

    async fn session(&self) -> Result<Self::Session, StoreError> {
        let conn = self.db.pool().acquire().await?;
        Ok(SqliteSession { conn })
    }

    fn session_limit(&self) -> Option<usize> {
        usize::try_from(self.db.max_connections()).ok()
    }

    async fn count_decks(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deck")
            .fetch_one(self.db.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn known_deck_ids(&self) -> Result<Vec<DeckId>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM deck")
            .fetch_all(self.db.pool())
            .await?;
        Ok(ids.into_iter().map(DeckId::from).collect())
    }

    async fn card_expansions(&self) -> Result<Vec<(CardId, i64)>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT id, expansion FROM card")
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, expansion)| (CardId::new(id), expansion))
            .collect())
    }

    async fn cards_by_expansion(&self) -> Result<Vec<(i64, u64)>, StoreError> {
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT expansion, COUNT(*) FROM card GROUP BY expansion ORDER BY expansion")
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows
            .into_iter()
            .map(|(expansion, count)| (expansion, u64::try_from(count).unwrap_or_default()))
            .collect())
    }
}

/// One pooled connection; dropping it returns the connection to the pool
pub struct SqliteSession {
    conn: PoolConnection<Sqlite>,
}

#[async_trait]
impl StoreSession for SqliteSession {
    async fn card_exists(&mut self, id: &CardId) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM card WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(found.is_some())
    }

    async fn insert_card(&mut self, card: &CardRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            INSERT OR IGNORE INTO card (
                id, card_title, house, card_type, front_image, card_text, traits,
                amber, power, armor, rarity, flavor_text, card_number, expansion,
                is_maverick, is_anomaly, is_enhanced, is_non_deck
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(card.id.as_str())
        .bind(&card.card_title)
        .bind(&card.house)
        .bind(&card.card_type)
        .bind(&card.front_image)
        .bind(&card.card_text)
        .bind(&card.traits)
        .bind(card.amber)
        .bind(card.power)
        .bind(card.armor)
        .bind(&card.rarity)
        .bind(&card.flavor_text)
        .bind(card.card_number)
        .bind(card.expansion)
        .bind(card.is_maverick)
        .bind(card.is_anomaly)
        .bind(card.is_enhanced)
        .bind(card.is_non_deck)
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn card_expansion(&mut self, id: &CardId) -> Result<Option<i64>, StoreError> {
        let expansion: Option<i64> = sqlx::query_scalar("SELECT expansion FROM card WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(expansion)
    }

    async fn deck_exists(&mut self, id: &DeckId) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM deck WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(found.is_some())
    }

    async fn insert_deck(&mut self, deck: &DeckData, links: &[DeckCardLink]) -> Result<bool, StoreError> {
        let mut tx = self.conn.begin().await?;

        let inserted = sqlx::query(
            r"
            INSERT OR IGNORE INTO deck (id, name, expansion, power_level, chains, wins, losses, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(deck.id.as_str())
        .bind(&deck.name)
        .bind(deck.expansion)
        .bind(deck.power_level)
        .bind(deck.chains)
        .bind(deck.wins)
        .bind(deck.losses)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await?;
            debug!(deck = %deck.id, "Deck row already present, links left untouched");
            return Ok(false);
        }

        for link in links {
            sqlx::query("INSERT INTO deck_card (deck_id, position, card_id, is_legacy) VALUES (?, ?, ?, ?)")
                .bind(deck.id.as_str())
                .bind(i64::from(link.position))
                .bind(link.card_id.as_str())
                .bind(link.is_legacy)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeckLinks;

    async fn store() -> (tempfile::TempDir, SqliteDeckStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConnection::open(dir.path().join("decks.sqlite"), 4).await.unwrap();
        (dir, SqliteDeckStore::new(db))
    }

    fn card(id: &str, expansion: i64) -> CardRecord {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "card_title": format!("Card {id}"),
            "expansion": expansion,
            "card_number": 7,
        }))
        .unwrap()
    }

    fn deck(id: &str, cards: &[&str]) -> DeckData {
        DeckData {
            id: DeckId::new(id),
            name: format!("Deck {id}"),
            expansion: 435,
            power_level: 0,
            chains: 0,
            wins: 0,
            losses: 0,
            links: DeckLinks {
                cards: cards.iter().map(|c| CardId::new(*c)).collect(),
            },
        }
    }

    #[tokio::test]
    async fn card_insert_is_idempotent() {
        let (_dir, store) = store().await;
        let mut session = store.session().await.unwrap();

        assert!(!session.card_exists(&CardId::new("c-1")).await.unwrap());
        assert!(session.insert_card(&card("c-1", 341)).await.unwrap());
        assert!(!session.insert_card(&card("c-1", 341)).await.unwrap());
        assert!(session.card_exists(&CardId::new("c-1")).await.unwrap());
        assert_eq!(session.card_expansion(&CardId::new("c-1")).await.unwrap(), Some(341));
        assert_eq!(store.count_cards().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_deck_insert_leaves_links_alone() {
        let (_dir, store) = store().await;
        let mut session = store.session().await.unwrap();
        session.insert_card(&card("c-1", 341)).await.unwrap();
        session.insert_card(&card("c-2", 435)).await.unwrap();

        let data = deck("d-1", &["c-1", "c-2", "c-2"]);
        let links = vec![
            DeckCardLink::new(0, CardId::new("c-1"), 341, 435),
            DeckCardLink::new(1, CardId::new("c-2"), 435, 435),
            DeckCardLink::new(2, CardId::new("c-2"), 435, 435),
        ];

        assert!(session.insert_deck(&data, &links).await.unwrap());
        assert!(!session.insert_deck(&data, &links).await.unwrap());

        let id = DeckId::new("d-1");
        assert!(session.deck_exists(&id).await.unwrap());
        assert_eq!(store.count_decks().await.unwrap(), 1);
        assert_eq!(store.count_links(&id).await.unwrap(), 3);
        assert_eq!(store.legacy_flags(&id).await.unwrap(), vec![true, false, false]);
        assert_eq!(store.known_deck_ids().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn reports_cards_per_expansion() {
        let (_dir, store) = store().await;
        let mut session = store.session().await.unwrap();
        for (id, expansion) in [("a", 341), ("b", 341), ("c", 435)] {
            session.insert_card(&card(id, expansion)).await.unwrap();
        }

        assert_eq!(store.cards_by_expansion().await.unwrap(), vec![(341, 2), (435, 1)]);
        let mut expansions = store.card_expansions().await.unwrap();
        expansions.sort();
        assert_eq!(expansions[0], (CardId::new("a"), 341));
    }
}
