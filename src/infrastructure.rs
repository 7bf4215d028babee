//! Infrastructure layer: configuration, logging, deck sources (the vault HTTP
//! client and an in-memory stand-in) and SQLite storage.

pub mod config;
pub mod database_connection;
pub mod deck_repository;
pub mod logging;
pub mod memory_vault;
pub mod vault_client;

pub use config::AppConfig;
pub use database_connection::DatabaseConnection;
pub use deck_repository::SqliteDeckStore;
pub use logging::init_logging_with_config;
pub use memory_vault::InMemoryVault;
pub use vault_client::{DeckSource, VaultClient, VaultError};
