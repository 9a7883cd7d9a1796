//! Schema definition for the bookkeeping database.

use rusqlite::Connection;

use crate::DbResult;

pub(crate) const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key         TEXT PRIMARY KEY,
    value       BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS collections (
    collection_name            TEXT PRIMARY KEY,
    application_id             TEXT NOT NULL,
    uses_device_lock_key       INTEGER NOT NULL,
    storage_plugin_name        TEXT NOT NULL,
    encryption_plugin_name     TEXT NOT NULL,
    authentication_plugin_name TEXT NOT NULL,
    unlock_semantic            INTEGER NOT NULL,
    custom_lock_timeout_ms     INTEGER NOT NULL,
    access_control_mode        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS secrets (
    collection_name            TEXT NOT NULL,
    hashed_secret_name         TEXT NOT NULL,
    application_id             TEXT NOT NULL,
    uses_device_lock_key       INTEGER NOT NULL,
    storage_plugin_name        TEXT NOT NULL,
    encryption_plugin_name     TEXT NOT NULL,
    authentication_plugin_name TEXT NOT NULL,
    unlock_semantic            INTEGER NOT NULL,
    custom_lock_timeout_ms     INTEGER NOT NULL,
    access_control_mode        INTEGER NOT NULL,
    PRIMARY KEY (collection_name, hashed_secret_name)
);
";

/// Applies the schema, recording the schema version in the meta table.
pub(crate) fn ensure_schema(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_le_bytes().to_vec()],
    )?;
    Ok(())
}
