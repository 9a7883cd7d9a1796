//! Bookkeeping database for the secretkit secrets daemon.
//!
//! The daemon never stores secret payloads itself; this crate holds the
//! *metadata* side of the system: one row per collection and one row per
//! (hashed) secret, recording which plugins protect the data and under
//! which lock semantics. The secret payloads live in extension plugins
//! and are opaque to this crate.
//!
//! The gateway is synchronous and serialises its own access; every
//! mutation runs inside an internal transaction. The database also owns
//! the lock lifecycle of the daemon: it opens `Locked`, is unlocked with
//! a key derived from the master lock code, and can be re-encrypted under
//! a new key during a lock-code change.

mod bookkeeping;
mod error;
mod schema;

pub use bookkeeping::{BookkeepingDb, CollectionRecord, SecretRecord};
pub use error::DbError;

/// Result type alias for bookkeeping operations.
pub type DbResult<T> = Result<T, DbError>;
