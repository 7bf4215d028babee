//! DeckVault - concurrent KeyForge deck ingestion
//!
//! Walks the vault's deck listing, fetches every deck not yet stored and
//! writes decks, cards and their links into SQLite. The pipeline lives in
//! [`crawling`]; [`infrastructure`] holds the HTTP client, storage, config and
//! logging; [`commands`] is the command line front end.

pub mod commands;
pub mod crawling;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use commands::run;
