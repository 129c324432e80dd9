//! Database layer for the sync store.
//!
//! This module handles connection management and schema creation for the
//! local record store backing the sync engine.

pub mod schema;

pub use schema::Database;

use thiserror::Error;

/// Errors from the persistence layer. Surfaced to the caller unmodified;
/// the sync core never swallows infrastructure failures.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
