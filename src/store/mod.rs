//! Durable storage: versioned SQLite schemas behind a narrow adapter.

pub mod schema;
pub mod sqlite;

pub use sqlite::{DebateSeal, SharedStore, SqliteStore, StoreError, StoreResult};
