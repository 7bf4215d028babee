// Database connection and pool management
// This module handles SQLite database connections using sqlx

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

/// Schema statements, applied in order on every connect
const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS card (
        id TEXT PRIMARY KEY,
        card_title TEXT,
        house TEXT,
        card_type TEXT,
        front_image TEXT,
        card_text TEXT,
        traits TEXT,
        amber INTEGER,
        power INTEGER,
        armor INTEGER,
        rarity TEXT,
        flavor_text TEXT,
        card_number INTEGER,
        expansion INTEGER NOT NULL,
        is_maverick BOOLEAN NOT NULL DEFAULT 0,
        is_anomaly BOOLEAN NOT NULL DEFAULT 0,
        is_enhanced BOOLEAN NOT NULL DEFAULT 0,
        is_non_deck BOOLEAN NOT NULL DEFAULT 0
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS deck (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        expansion INTEGER NOT NULL,
        power_level INTEGER NOT NULL DEFAULT 0,
        chains INTEGER NOT NULL DEFAULT 0,
        wins INTEGER NOT NULL DEFAULT 0,
        losses INTEGER NOT NULL DEFAULT 0,
        created_at DATETIME NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS deck_card (
        deck_id TEXT NOT NULL REFERENCES deck (id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        card_id TEXT NOT NULL REFERENCES card (id),
        is_legacy BOOLEAN NOT NULL DEFAULT 0,
        PRIMARY KEY (deck_id, position)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_deck_card_card ON deck_card (card_id)",
    "CREATE INDEX IF NOT EXISTS idx_card_expansion ON card (expansion)",
];

#[derive(Debug, Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
    max_connections: u32,
}

impl DatabaseConnection {
    /// Opens (creating if needed) the database behind a sqlx URL and applies the schema.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Self::with_options(options.create_if_missing(true), max_connections).await
    }

    /// Opens a database file directly.
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::with_options(options, max_connections).await
    }

    async fn with_options(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            // several persisters write concurrently; one writer at a time in WAL mode
            .busy_timeout(Duration::from_secs(5));

        let max_connections = max_connections.max(1);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let connection = Self { pool, max_connections };
        connection.migrate().await?;
        Ok(connection)
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Size of the connection pool
    #[must_use]
    pub const fn max_connections(&self) -> u32 {
        self.max_connections
    }

    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema ready");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
