//! Error types for the bookkeeping database.

use thiserror::Error;

/// Errors raised by the bookkeeping gateway.
#[derive(Debug, Error)]
pub enum DbError {
    /// The underlying SQL engine reported a failure.
    #[error("bookkeeping database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database is locked; metadata operations are unavailable.
    #[error("bookkeeping database is locked")]
    Locked,

    /// An unlock or re-encrypt was attempted with the wrong key.
    #[error("incorrect bookkeeping database lock key")]
    IncorrectLockKey,

    /// A row with the same primary key already exists.
    #[error("row already exists: {0}")]
    AlreadyExists(String),

    /// Stored data could not be interpreted.
    #[error("corrupted bookkeeping row: {0}")]
    Corrupted(String),
}
