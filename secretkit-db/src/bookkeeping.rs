//! The bookkeeping gateway: metadata rows and the database lock lifecycle.

use std::path::Path;
use std::sync::Mutex;

use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::schema::ensure_schema;
use crate::{DbError, DbResult};

const SALT_KEY: &str = "salt";
const KEY_CHECK_KEY: &str = "key_check";
const KEY_CHECK_LABEL: &[u8] = b"secretkit:bookkeeping-key-check";

/// Metadata recorded for a collection.
///
/// Lock kind, unlock semantic and access-control mode are stored as raw
/// integers here; the core crate owns the typed enums and converts at the
/// seam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRecord {
    pub collection_name: String,
    pub application_id: String,
    pub uses_device_lock_key: bool,
    pub storage_plugin_name: String,
    pub encryption_plugin_name: String,
    pub authentication_plugin_name: String,
    pub unlock_semantic: i64,
    pub custom_lock_timeout_ms: i64,
    pub access_control_mode: i64,
}

/// Metadata recorded for a secret, keyed by `(collection, hashed name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub collection_name: String,
    pub hashed_secret_name: String,
    pub application_id: String,
    pub uses_device_lock_key: bool,
    pub storage_plugin_name: String,
    pub encryption_plugin_name: String,
    pub authentication_plugin_name: String,
    pub unlock_semantic: i64,
    pub custom_lock_timeout_ms: i64,
    pub access_control_mode: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockPhase {
    Locked,
    Unlocked,
}

struct Inner {
    conn: Connection,
    phase: LockPhase,
}

/// Typed, transactional interface over the metadata database.
///
/// The gateway opens `Locked`; every metadata operation fails with
/// [`DbError::Locked`] until [`BookkeepingDb::unlock`] succeeds. The salt
/// row is deliberately readable while locked, because the unlock key is
/// derived from the lock code and that salt.
pub struct BookkeepingDb {
    inner: Mutex<Inner>,
}

impl BookkeepingDb {
    /// Opens or creates the bookkeeping database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot
    /// be applied.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory bookkeeping database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> DbResult<Self> {
        ensure_schema(&conn)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                phase: LockPhase::Locked,
            }),
        })
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means another thread panicked mid-operation;
        // the connection state is still usable for subsequent statements.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Lock lifecycle

    /// Returns true once an unlock key has been installed.
    pub fn is_initialised(&self) -> bool {
        let inner = self.lock_inner();
        read_meta(&inner.conn, KEY_CHECK_KEY)
            .ok()
            .flatten()
            .is_some()
    }

    /// Returns true while metadata operations are unavailable.
    pub fn is_locked(&self) -> bool {
        self.lock_inner().phase == LockPhase::Locked
    }

    /// Locks the database, making metadata operations unavailable.
    pub fn lock(&self) {
        self.lock_inner().phase = LockPhase::Locked;
    }

    /// Unlocks the database with the given key.
    ///
    /// On first use the key's check value is installed; afterwards the
    /// presented key must match the installed one.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::IncorrectLockKey`] when the key does not match
    /// the installed check value.
    pub fn unlock(&self, key: &[u8]) -> DbResult<()> {
        let mut inner = self.lock_inner();
        let check = key_check_value(key);
        match read_meta(&inner.conn, KEY_CHECK_KEY)? {
            None => {
                write_meta(&inner.conn, KEY_CHECK_KEY, &check)?;
                inner.phase = LockPhase::Unlocked;
                Ok(())
            }
            Some(stored) if stored == check => {
                inner.phase = LockPhase::Unlocked;
                Ok(())
            }
            Some(_) => Err(DbError::IncorrectLockKey),
        }
    }

    /// Re-encrypts the database from `old_key` to `new_key`.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::Locked`] unless unlocked, and with
    /// [`DbError::IncorrectLockKey`] if `old_key` does not match.
    pub fn reencrypt(&self, old_key: &[u8], new_key: &[u8]) -> DbResult<()> {
        let inner = self.lock_inner();
        if inner.phase == LockPhase::Locked {
            return Err(DbError::Locked);
        }
        match read_meta(&inner.conn, KEY_CHECK_KEY)? {
            Some(stored) if stored == key_check_value(old_key) => {
                write_meta(&inner.conn, KEY_CHECK_KEY, &key_check_value(new_key))?;
                debug!("bookkeeping database re-keyed");
                Ok(())
            }
            Some(_) => Err(DbError::IncorrectLockKey),
            None => Err(DbError::Corrupted("missing key check value".into())),
        }
    }

    /// Loads the process salt, generating and persisting one on first use.
    ///
    /// Readable while locked: the unlock key derivation needs it.
    ///
    /// # Errors
    ///
    /// Returns an error if the meta table cannot be read or written.
    pub fn load_or_create_salt(&self, generate: impl FnOnce() -> Vec<u8>) -> DbResult<Vec<u8>> {
        let inner = self.lock_inner();
        if let Some(salt) = read_meta(&inner.conn, SALT_KEY)? {
            return Ok(salt);
        }
        let salt = generate();
        write_meta(&inner.conn, SALT_KEY, &salt)?;
        Ok(salt)
    }

    // Collections

    /// Returns true if a collection row with this name exists.
    pub fn collection_exists(&self, collection_name: &str) -> DbResult<bool> {
        let inner = self.ensure_unlocked()?;
        let count: i64 = inner.conn.query_row(
            "SELECT COUNT(*) FROM collections WHERE collection_name = ?1",
            [collection_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fetches a collection's metadata row, or `None` if absent.
    pub fn collection_metadata(&self, collection_name: &str) -> DbResult<Option<CollectionRecord>> {
        let inner = self.ensure_unlocked()?;
        inner
            .conn
            .query_row(
                "SELECT collection_name, application_id, uses_device_lock_key,
                        storage_plugin_name, encryption_plugin_name,
                        authentication_plugin_name, unlock_semantic,
                        custom_lock_timeout_ms, access_control_mode
                 FROM collections WHERE collection_name = ?1",
                [collection_name],
                |row| {
                    Ok(CollectionRecord {
                        collection_name: row.get(0)?,
                        application_id: row.get(1)?,
                        uses_device_lock_key: row.get::<_, i64>(2)? != 0,
                        storage_plugin_name: row.get(3)?,
                        encryption_plugin_name: row.get(4)?,
                        authentication_plugin_name: row.get(5)?,
                        unlock_semantic: row.get(6)?,
                        custom_lock_timeout_ms: row.get(7)?,
                        access_control_mode: row.get(8)?,
                    })
                },
            )
            .optional()
            .map_err(DbError::from)
    }

    /// Inserts a new collection row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::AlreadyExists`] if the name is taken.
    pub fn insert_collection(&self, record: &CollectionRecord) -> DbResult<()> {
        let mut inner = self.ensure_unlocked()?;
        let tx = inner.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO collections (
                collection_name, application_id, uses_device_lock_key,
                storage_plugin_name, encryption_plugin_name,
                authentication_plugin_name, unlock_semantic,
                custom_lock_timeout_ms, access_control_mode
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.collection_name,
                record.application_id,
                record.uses_device_lock_key as i64,
                record.storage_plugin_name,
                record.encryption_plugin_name,
                record.authentication_plugin_name,
                record.unlock_semantic,
                record.custom_lock_timeout_ms,
                record.access_control_mode,
            ],
        )?;
        if inserted == 0 {
            return Err(DbError::AlreadyExists(record.collection_name.clone()));
        }
        tx.commit()?;
        Ok(())
    }

    /// Deletes a collection row and all of its secret rows.
    pub fn delete_collection(&self, collection_name: &str) -> DbResult<()> {
        let mut inner = self.ensure_unlocked()?;
        let tx = inner.conn.transaction()?;
        tx.execute(
            "DELETE FROM secrets WHERE collection_name = ?1",
            [collection_name],
        )?;
        tx.execute(
            "DELETE FROM collections WHERE collection_name = ?1",
            [collection_name],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Lists all collection names.
    pub fn collection_names(&self) -> DbResult<Vec<String>> {
        let inner = self.ensure_unlocked()?;
        let mut stmt = inner
            .conn
            .prepare("SELECT collection_name FROM collections ORDER BY collection_name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    // Secrets

    /// Returns true if a secret row exists for this hashed name.
    pub fn secret_exists(&self, collection_name: &str, hashed_secret_name: &str) -> DbResult<bool> {
        let inner = self.ensure_unlocked()?;
        let count: i64 = inner.conn.query_row(
            "SELECT COUNT(*) FROM secrets
             WHERE collection_name = ?1 AND hashed_secret_name = ?2",
            [collection_name, hashed_secret_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fetches a secret's metadata row, or `None` if absent.
    pub fn secret_metadata(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
    ) -> DbResult<Option<SecretRecord>> {
        let inner = self.ensure_unlocked()?;
        inner
            .conn
            .query_row(
                "SELECT collection_name, hashed_secret_name, application_id,
                        uses_device_lock_key, storage_plugin_name,
                        encryption_plugin_name, authentication_plugin_name,
                        unlock_semantic, custom_lock_timeout_ms,
                        access_control_mode
                 FROM secrets
                 WHERE collection_name = ?1 AND hashed_secret_name = ?2",
                [collection_name, hashed_secret_name],
                |row| {
                    Ok(SecretRecord {
                        collection_name: row.get(0)?,
                        hashed_secret_name: row.get(1)?,
                        application_id: row.get(2)?,
                        uses_device_lock_key: row.get::<_, i64>(3)? != 0,
                        storage_plugin_name: row.get(4)?,
                        encryption_plugin_name: row.get(5)?,
                        authentication_plugin_name: row.get(6)?,
                        unlock_semantic: row.get(7)?,
                        custom_lock_timeout_ms: row.get(8)?,
                        access_control_mode: row.get(9)?,
                    })
                },
            )
            .optional()
            .map_err(DbError::from)
    }

    /// Inserts a new secret row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::AlreadyExists`] if a row with the same hashed
    /// name exists in the collection.
    pub fn insert_secret(&self, record: &SecretRecord) -> DbResult<()> {
        let mut inner = self.ensure_unlocked()?;
        let tx = inner.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO secrets (
                collection_name, hashed_secret_name, application_id,
                uses_device_lock_key, storage_plugin_name,
                encryption_plugin_name, authentication_plugin_name,
                unlock_semantic, custom_lock_timeout_ms, access_control_mode
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.collection_name,
                record.hashed_secret_name,
                record.application_id,
                record.uses_device_lock_key as i64,
                record.storage_plugin_name,
                record.encryption_plugin_name,
                record.authentication_plugin_name,
                record.unlock_semantic,
                record.custom_lock_timeout_ms,
                record.access_control_mode,
            ],
        )?;
        if inserted == 0 {
            return Err(DbError::AlreadyExists(record.hashed_secret_name.clone()));
        }
        tx.commit()?;
        Ok(())
    }

    /// Replaces an existing secret row in place (same hashed name).
    pub fn update_secret(&self, record: &SecretRecord) -> DbResult<()> {
        let mut inner = self.ensure_unlocked()?;
        let tx = inner.conn.transaction()?;
        tx.execute(
            "UPDATE secrets SET
                application_id = ?3, uses_device_lock_key = ?4,
                storage_plugin_name = ?5, encryption_plugin_name = ?6,
                authentication_plugin_name = ?7, unlock_semantic = ?8,
                custom_lock_timeout_ms = ?9, access_control_mode = ?10
             WHERE collection_name = ?1 AND hashed_secret_name = ?2",
            params![
                record.collection_name,
                record.hashed_secret_name,
                record.application_id,
                record.uses_device_lock_key as i64,
                record.storage_plugin_name,
                record.encryption_plugin_name,
                record.authentication_plugin_name,
                record.unlock_semantic,
                record.custom_lock_timeout_ms,
                record.access_control_mode,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes a secret row.
    pub fn delete_secret(&self, collection_name: &str, hashed_secret_name: &str) -> DbResult<()> {
        let mut inner = self.ensure_unlocked()?;
        let tx = inner.conn.transaction()?;
        tx.execute(
            "DELETE FROM secrets
             WHERE collection_name = ?1 AND hashed_secret_name = ?2",
            [collection_name, hashed_secret_name],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Lists the hashed secret names stored under a collection.
    pub fn hashed_secret_names(&self, collection_name: &str) -> DbResult<Vec<String>> {
        let inner = self.ensure_unlocked()?;
        let mut stmt = inner.conn.prepare(
            "SELECT hashed_secret_name FROM secrets
             WHERE collection_name = ?1 ORDER BY hashed_secret_name",
        )?;
        let names = stmt
            .query_map([collection_name], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn ensure_unlocked(&self) -> DbResult<std::sync::MutexGuard<'_, Inner>> {
        let inner = self.lock_inner();
        if inner.phase == LockPhase::Locked {
            return Err(DbError::Locked);
        }
        Ok(inner)
    }
}

fn key_check_value(key: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(KEY_CHECK_LABEL);
    hasher.update(key);
    hex::encode(hasher.finalize()).into_bytes()
}

fn read_meta(conn: &Connection, key: &str) -> DbResult<Option<Vec<u8>>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
    .map_err(DbError::from)
}

fn write_meta(conn: &Connection, key: &str, value: &[u8]) -> DbResult<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection_record(name: &str) -> CollectionRecord {
        CollectionRecord {
            collection_name: name.to_string(),
            application_id: "app-1".to_string(),
            uses_device_lock_key: true,
            storage_plugin_name: "stor".to_string(),
            encryption_plugin_name: "enc".to_string(),
            authentication_plugin_name: "auth".to_string(),
            unlock_semantic: 0,
            custom_lock_timeout_ms: 0,
            access_control_mode: 0,
        }
    }

    fn secret_record(collection: &str, hashed: &str) -> SecretRecord {
        SecretRecord {
            collection_name: collection.to_string(),
            hashed_secret_name: hashed.to_string(),
            application_id: "app-1".to_string(),
            uses_device_lock_key: false,
            storage_plugin_name: "stor".to_string(),
            encryption_plugin_name: "enc".to_string(),
            authentication_plugin_name: "auth".to_string(),
            unlock_semantic: 2,
            custom_lock_timeout_ms: 5000,
            access_control_mode: 0,
        }
    }

    fn unlocked_db() -> BookkeepingDb {
        let db = BookkeepingDb::open_in_memory().expect("open");
        db.unlock(b"test-key").expect("unlock");
        db
    }

    #[test]
    fn test_locked_database_rejects_metadata_ops() {
        let db = BookkeepingDb::open_in_memory().expect("open");
        assert!(db.is_locked());
        assert!(matches!(
            db.collection_exists("c"),
            Err(DbError::Locked)
        ));
        assert!(matches!(
            db.insert_collection(&collection_record("c")),
            Err(DbError::Locked)
        ));
    }

    #[test]
    fn test_unlock_installs_and_verifies_key() {
        let db = BookkeepingDb::open_in_memory().expect("open");
        assert!(!db.is_initialised());
        db.unlock(b"correct").expect("first unlock installs key");
        assert!(db.is_initialised());
        db.lock();
        assert!(matches!(db.unlock(b"wrong"), Err(DbError::IncorrectLockKey)));
        assert!(db.is_locked());
        db.unlock(b"correct").expect("unlock with installed key");
        assert!(!db.is_locked());
    }

    #[test]
    fn test_reencrypt_swaps_key() {
        let db = unlocked_db();
        assert!(matches!(
            db.reencrypt(b"wrong", b"new-key"),
            Err(DbError::IncorrectLockKey)
        ));
        db.reencrypt(b"test-key", b"new-key").expect("reencrypt");
        db.lock();
        assert!(matches!(
            db.unlock(b"test-key"),
            Err(DbError::IncorrectLockKey)
        ));
        db.unlock(b"new-key").expect("unlock with new key");
    }

    #[test]
    fn test_collection_round_trip() {
        let db = unlocked_db();
        let record = collection_record("email");
        assert!(!db.collection_exists("email").unwrap());
        db.insert_collection(&record).expect("insert");
        assert!(db.collection_exists("email").unwrap());
        assert_eq!(db.collection_metadata("email").unwrap(), Some(record.clone()));
        assert_eq!(db.collection_names().unwrap(), vec!["email".to_string()]);
        assert!(matches!(
            db.insert_collection(&record),
            Err(DbError::AlreadyExists(_))
        ));
        db.delete_collection("email").expect("delete");
        assert_eq!(db.collection_metadata("email").unwrap(), None);
    }

    #[test]
    fn test_delete_collection_cascades_secrets() {
        let db = unlocked_db();
        db.insert_collection(&collection_record("email")).unwrap();
        db.insert_secret(&secret_record("email", "h1")).unwrap();
        db.insert_secret(&secret_record("email", "h2")).unwrap();
        assert_eq!(db.hashed_secret_names("email").unwrap().len(), 2);
        db.delete_collection("email").unwrap();
        assert!(db.hashed_secret_names("email").unwrap().is_empty());
        assert!(!db.secret_exists("email", "h1").unwrap());
    }

    #[test]
    fn test_secret_insert_update_delete() {
        let db = unlocked_db();
        let mut record = secret_record("standalone", "h1");
        db.insert_secret(&record).expect("insert");
        assert!(matches!(
            db.insert_secret(&record),
            Err(DbError::AlreadyExists(_))
        ));
        record.application_id = "app-2".to_string();
        db.update_secret(&record).expect("update");
        assert_eq!(
            db.secret_metadata("standalone", "h1").unwrap(),
            Some(record)
        );
        db.delete_secret("standalone", "h1").expect("delete");
        assert_eq!(db.secret_metadata("standalone", "h1").unwrap(), None);
    }

    #[test]
    fn test_salt_is_stable_and_readable_while_locked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bookkeeping.db");
        let first = {
            let db = BookkeepingDb::open(&path).expect("open");
            db.load_or_create_salt(|| vec![7u8; 16]).expect("salt")
        };
        let db = BookkeepingDb::open(&path).expect("reopen");
        assert!(db.is_locked());
        let second = db.load_or_create_salt(|| vec![9u8; 16]).expect("salt");
        assert_eq!(first, second);
    }
}
