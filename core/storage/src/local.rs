//! On-device record storage.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use draftsync_common::{now_millis, validate_key, Error, Record, Result};

/// Namespace used when the caller does not pick one.
pub const DEFAULT_NAMESPACE: &str = "draftsync";

/// Durable key-value persistence on the local device.
///
/// All calls complete without suspending. A failure is fatal to that call
/// only; implementations never leave a half-written record behind.
pub trait LocalStore: Send + Sync {
    /// Get a record, tombstones included.
    fn get(&self, key: &str) -> Result<Option<Record>>;

    /// Write `value` under `key`, stamping the current time.
    fn put(&self, key: &str, value: serde_json::Value) -> Result<Record> {
        validate_key(key)?;
        let record = Record::new(key, value, now_millis());
        self.put_record(&record)?;
        Ok(record)
    }

    /// Replace `key` with a tombstone stamped with the current time.
    fn delete(&self, key: &str) -> Result<Record> {
        validate_key(key)?;
        let record = Record::tombstone(key, now_millis());
        self.put_record(&record)?;
        Ok(record)
    }

    /// Store a record exactly as given.
    fn put_record(&self, record: &Record) -> Result<()>;

    /// Store a record received from the remote replica.
    ///
    /// Writes only when the local copy is missing or strictly older, and
    /// returns whether anything was written.
    fn apply_remote(&self, record: &Record) -> Result<bool>;

    /// All records whose key starts with `prefix`.
    fn list_all(&self, prefix: &str) -> Result<BTreeMap<String, Record>>;

    /// Undo `written` if it is still the stored record for its key.
    ///
    /// Restores `previous`, or erases the key without a tombstone when there
    /// was none. Returns `false` and changes nothing if a later write has
    /// already replaced `written`.
    fn rollback(&self, written: &Record, previous: Option<&Record>) -> Result<bool>;
}

/// SQLite-backed local store.
///
/// Records live in a single table keyed by `(namespace, key)`; the namespace
/// keeps engine-managed records apart from unrelated application state sharing
/// the same database file.
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
    namespace: String,
}

impl SqliteLocalStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>, namespace: impl Into<String>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_error)?;
        let store = Self::with_connection(conn, namespace)?;
        info!("Local store opened at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(namespace: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Self::with_connection(conn, namespace)
    }

    fn with_connection(conn: Connection, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(Error::InvalidInput("Namespace cannot be empty".to_string()));
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                last_modified INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (namespace, key)
            );
            "#,
        )
        .map_err(storage_error)?;

        Ok(Self {
            conn: Mutex::new(conn),
            namespace,
        })
    }

    /// Namespace this store reads and writes.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::LocalStorage("Connection lock poisoned".to_string()))
    }
}

impl LocalStore for SqliteLocalStore {
    fn get(&self, key: &str) -> Result<Option<Record>> {
        read_record(&*self.conn()?, &self.namespace, key)
    }

    fn put_record(&self, record: &Record) -> Result<()> {
        validate_key(&record.key)?;
        debug!("Writing local record {} @ {}", record.key, record.last_modified);
        write_record(&*self.conn()?, &self.namespace, record)
    }

    fn apply_remote(&self, record: &Record) -> Result<bool> {
        validate_key(&record.key)?;
        let value = serde_json::to_string(&record.value)?;

        let written = self
            .conn()?
            .execute(
                r#"
                INSERT INTO records (namespace, key, value, last_modified, deleted)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (namespace, key) DO UPDATE SET
                    value = excluded.value,
                    last_modified = excluded.last_modified,
                    deleted = excluded.deleted
                WHERE records.last_modified < excluded.last_modified
                "#,
                params![
                    self.namespace,
                    record.key,
                    value,
                    record.last_modified,
                    record.deleted as i32,
                ],
            )
            .map_err(storage_error)?;

        Ok(written > 0)
    }

    fn list_all(&self, prefix: &str) -> Result<BTreeMap<String, Record>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT key, value, last_modified, deleted
                FROM records WHERE namespace = ?1
                ORDER BY key
                "#,
            )
            .map_err(storage_error)?;

        let rows = stmt
            .query_map([&self.namespace], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i32>(3)? != 0,
                ))
            })
            .map_err(storage_error)?;

        let mut records = BTreeMap::new();
        for row in rows {
            let row = row.map_err(storage_error)?;
            if !row.0.starts_with(prefix) {
                continue;
            }
            let record = decode_row(row)?;
            records.insert(record.key.clone(), record);
        }
        Ok(records)
    }

    fn rollback(&self, written: &Record, previous: Option<&Record>) -> Result<bool> {
        // Compare and write under one guard.
        let conn = self.conn()?;
        if read_record(&conn, &self.namespace, &written.key)?.as_ref() != Some(written) {
            debug!("Not rolling back {}: replaced by a later write", written.key);
            return Ok(false);
        }

        match previous {
            Some(previous) => write_record(&conn, &self.namespace, previous)?,
            None => {
                conn.execute(
                    "DELETE FROM records WHERE namespace = ?1 AND key = ?2",
                    params![self.namespace, written.key],
                )
                .map_err(storage_error)?;
            }
        }
        Ok(true)
    }
}

fn read_record(conn: &Connection, namespace: &str, key: &str) -> Result<Option<Record>> {
    let row = conn
        .query_row(
            r#"
            SELECT key, value, last_modified, deleted
            FROM records WHERE namespace = ?1 AND key = ?2
            "#,
            params![namespace, key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i32>(3)? != 0,
                ))
            },
        )
        .optional()
        .map_err(storage_error)?;

    row.map(decode_row).transpose()
}

fn write_record(conn: &Connection, namespace: &str, record: &Record) -> Result<()> {
    let value = serde_json::to_string(&record.value)?;
    conn.execute(
        r#"
        INSERT OR REPLACE INTO records
        (namespace, key, value, last_modified, deleted)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            namespace,
            record.key,
            value,
            record.last_modified,
            record.deleted as i32,
        ],
    )
    .map_err(storage_error)?;
    Ok(())
}

fn decode_row((key, value, last_modified, deleted): (String, String, i64, bool)) -> Result<Record> {
    Ok(Record {
        key,
        value: serde_json::from_str(&value)?,
        last_modified,
        deleted,
    })
}

fn storage_error(err: rusqlite::Error) -> Error {
    Error::LocalStorage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_put_and_get() {
        let store = SqliteLocalStore::in_memory(DEFAULT_NAMESPACE).unwrap();
        let written = store.put("k1", json!({"headline": "Spring sale"})).unwrap();

        let read = store.get("k1").unwrap().unwrap();
        assert_eq!(read, written);
        assert!(read.last_modified > 0);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_put_stamps_write_time() {
        let store = SqliteLocalStore::in_memory(DEFAULT_NAMESPACE).unwrap();
        let before = now_millis();
        let record = store.put("k1", json!("A")).unwrap();
        assert!(record.last_modified >= before);
    }

    #[test]
    fn test_empty_key_rejected() {
        let store = SqliteLocalStore::in_memory(DEFAULT_NAMESPACE).unwrap();
        assert!(matches!(store.put("", json!(1)), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_delete_writes_tombstone() {
        let store = SqliteLocalStore::in_memory(DEFAULT_NAMESPACE).unwrap();
        store.put("k1", json!("A")).unwrap();
        store.delete("k1").unwrap();

        let record = store.get("k1").unwrap().unwrap();
        assert!(record.is_tombstone());
    }

    #[test]
    fn test_list_all_with_prefix() {
        let store = SqliteLocalStore::in_memory(DEFAULT_NAMESPACE).unwrap();
        store.put("campaign/1", json!("a")).unwrap();
        store.put("campaign/2", json!("b")).unwrap();
        store.put("dialogue/1", json!("c")).unwrap();

        assert_eq!(store.list_all("").unwrap().len(), 3);
        let campaigns = store.list_all("campaign/").unwrap();
        assert_eq!(
            campaigns.keys().cloned().collect::<Vec<_>>(),
            vec!["campaign/1", "campaign/2"]
        );
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("local.db");

        let app = SqliteLocalStore::open(&db, "app-state").unwrap();
        let engine = SqliteLocalStore::open(&db, DEFAULT_NAMESPACE).unwrap();

        app.put("k1", json!("ui")).unwrap();
        engine.put("k1", json!("data")).unwrap();

        assert_eq!(app.get("k1").unwrap().unwrap().value, json!("ui"));
        assert_eq!(engine.get("k1").unwrap().unwrap().value, json!("data"));
        assert_eq!(engine.list_all("").unwrap().len(), 1);
    }

    #[test]
    fn test_apply_remote_only_overwrites_older() {
        let store = SqliteLocalStore::in_memory(DEFAULT_NAMESPACE).unwrap();
        store.put_record(&Record::new("k1", json!("local"), 200)).unwrap();

        assert!(!store.apply_remote(&Record::new("k1", json!("stale"), 100)).unwrap());
        assert!(!store.apply_remote(&Record::new("k1", json!("tie"), 200)).unwrap());
        assert_eq!(store.get("k1").unwrap().unwrap().value, json!("local"));

        assert!(store.apply_remote(&Record::new("k1", json!("newer"), 300)).unwrap());
        assert_eq!(store.get("k1").unwrap().unwrap().value, json!("newer"));

        assert!(store.apply_remote(&Record::new("k2", json!("fresh"), 50)).unwrap());
    }

    #[test]
    fn test_persistence() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("local.db");

        {
            let store = SqliteLocalStore::open(&db, DEFAULT_NAMESPACE).unwrap();
            store.put_record(&Record::new("k1", json!({"a": 1}), 100)).unwrap();
        }

        let store = SqliteLocalStore::open(&db, DEFAULT_NAMESPACE).unwrap();
        assert_eq!(
            store.get("k1").unwrap(),
            Some(Record::new("k1", json!({"a": 1}), 100))
        );
    }

    #[test]
    fn test_rollback_restores_previous() {
        let store = SqliteLocalStore::in_memory(DEFAULT_NAMESPACE).unwrap();
        let previous = Record::new("k1", json!("old"), 100);
        let written = Record::new("k1", json!("new"), 200);
        store.put_record(&previous).unwrap();
        store.put_record(&written).unwrap();

        assert!(store.rollback(&written, Some(&previous)).unwrap());
        assert_eq!(store.get("k1").unwrap(), Some(previous));
    }

    #[test]
    fn test_rollback_erases_new_key() {
        let store = SqliteLocalStore::in_memory(DEFAULT_NAMESPACE).unwrap();
        let written = Record::new("k1", json!("new"), 200);
        store.put_record(&written).unwrap();

        assert!(store.rollback(&written, None).unwrap());
        assert_eq!(store.get("k1").unwrap(), None);
        assert!(store.list_all("").unwrap().is_empty());
    }

    #[test]
    fn test_rollback_skips_replaced_record() {
        let store = SqliteLocalStore::in_memory(DEFAULT_NAMESPACE).unwrap();
        let written = Record::new("k1", json!("resolved"), 200);
        store.put_record(&written).unwrap();
        let later = store.put("k1", json!("typed meanwhile")).unwrap();

        assert!(!store.rollback(&written, None).unwrap());
        assert_eq!(store.get("k1").unwrap(), Some(later));
    }
}
