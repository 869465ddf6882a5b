//! SQLite implementation of the LocalStore trait.
//!
//! This is the primary storage backend for Replica. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking. Each
//! collection gets its own record table, registered in the `collections`
//! catalog on first write.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use replica_core::{CachedRecord, CollectionPath, RecordKey, Seq};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::LocalStore;

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection from a blocking thread.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("spawn_blocking failed: {}", e)))?
    }
}

// Helper to convert a row to CachedRecord
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedRecord> {
    let key: String = row.get("record_key")?;
    let payload: Vec<u8> = row.get("payload")?;
    let dirty: i64 = row.get("dirty")?;
    let last_applied_seq: i64 = row.get("last_applied_seq")?;

    Ok(CachedRecord {
        key: RecordKey::new(key),
        payload: Bytes::from(payload),
        dirty: dirty != 0,
        last_applied_seq: last_applied_seq as Seq,
        updated_at: row.get("updated_at")?,
    })
}

// Look up the record table of a collection, if it has one
fn lookup_table(conn: &Connection, path: &CollectionPath) -> Result<Option<String>> {
    conn.query_row(
        "SELECT table_name FROM collections WHERE path = ?1",
        params![path.as_str()],
        |row| row.get(0),
    )
    .optional()
    .map_err(StoreError::from)
}

// Register a collection and create its record table if needed
fn ensure_table(conn: &Connection, path: &CollectionPath) -> Result<String> {
    if let Some(table) = lookup_table(conn, path)? {
        return Ok(table);
    }

    let table = migration::table_name(path);
    conn.execute_batch(&migration::collection_table_sql(&table))?;
    conn.execute(
        "INSERT INTO collections (path, table_name, created_at) VALUES (?1, ?2, ?3)",
        params![path.as_str(), table, replica_core::now_millis()],
    )?;
    tracing::debug!(path = %path, table = %table, "created collection table");

    Ok(table)
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get_all(&self, path: &CollectionPath) -> Result<Vec<CachedRecord>> {
        let path = path.clone();

        self.blocking(move |conn| {
            let table = match lookup_table(conn, &path)? {
                Some(table) => table,
                None => return Ok(Vec::new()),
            };

            let mut stmt = conn.prepare(&format!(
                "SELECT record_key, payload, dirty, last_applied_seq, updated_at
                 FROM \"{table}\" ORDER BY record_key"
            ))?;

            let rows = stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(rows)
        })
        .await
    }

    async fn get_by_key(
        &self,
        path: &CollectionPath,
        key: &RecordKey,
    ) -> Result<Option<CachedRecord>> {
        let path = path.clone();
        let key = key.clone();

        self.blocking(move |conn| {
            let table = match lookup_table(conn, &path)? {
                Some(table) => table,
                None => return Ok(None),
            };

            conn.query_row(
                &format!(
                    "SELECT record_key, payload, dirty, last_applied_seq, updated_at
                     FROM \"{table}\" WHERE record_key = ?1"
                ),
                params![key.as_str()],
                row_to_record,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn upsert_many(&self, path: &CollectionPath, rows: &[CachedRecord]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let path = path.clone();
        let rows = rows.to_vec();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let table = ensure_table(&tx, &path)?;

            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO \"{table}\" (record_key, payload, dirty, last_applied_seq, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(record_key) DO UPDATE SET
                        payload = excluded.payload,
                        dirty = excluded.dirty,
                        last_applied_seq = excluded.last_applied_seq,
                        updated_at = excluded.updated_at"
                ))?;

                for row in &rows {
                    stmt.execute(params![
                        row.key.as_str(),
                        row.payload.as_ref(),
                        row.dirty as i64,
                        row.last_applied_seq as i64,
                        row.updated_at,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_by_key(&self, path: &CollectionPath, key: &RecordKey) -> Result<bool> {
        let path = path.clone();
        let key = key.clone();

        self.blocking(move |conn| {
            let table = match lookup_table(conn, &path)? {
                Some(table) => table,
                None => return Ok(false),
            };

            let deleted = conn.execute(
                &format!("DELETE FROM \"{table}\" WHERE record_key = ?1"),
                params![key.as_str()],
            )?;

            Ok(deleted > 0)
        })
        .await
    }

    async fn mark_clean(&self, path: &CollectionPath, key: &RecordKey, seq: Seq) -> Result<bool> {
        let path = path.clone();
        let key = key.clone();

        self.blocking(move |conn| {
            let table = match lookup_table(conn, &path)? {
                Some(table) => table,
                None => return Ok(false),
            };

            let updated = conn.execute(
                &format!(
                    "UPDATE \"{table}\" SET dirty = 0
                     WHERE record_key = ?1 AND last_applied_seq = ?2 AND dirty = 1"
                ),
                params![key.as_str(), seq as i64],
            )?;

            Ok(updated > 0)
        })
        .await
    }

    async fn dirty(&self, path: &CollectionPath) -> Result<Vec<CachedRecord>> {
        let path = path.clone();

        self.blocking(move |conn| {
            let table = match lookup_table(conn, &path)? {
                Some(table) => table,
                None => return Ok(Vec::new()),
            };

            let mut stmt = conn.prepare(&format!(
                "SELECT record_key, payload, dirty, last_applied_seq, updated_at
                 FROM \"{table}\" WHERE dirty = 1 ORDER BY record_key"
            ))?;

            let rows = stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(rows)
        })
        .await
    }

    async fn max_sequence(&self, path: &CollectionPath) -> Result<Seq> {
        let path = path.clone();

        self.blocking(move |conn| {
            let table = match lookup_table(conn, &path)? {
                Some(table) => table,
                None => return Ok(0),
            };

            let max: i64 = conn.query_row(
                &format!("SELECT COALESCE(MAX(last_applied_seq), 0) FROM \"{table}\""),
                [],
                |row| row.get(0),
            )?;

            Ok(max as Seq)
        })
        .await
    }

    async fn list_collections(&self) -> Result<Vec<CollectionPath>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT path FROM collections ORDER BY path")?;
            let raw = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            raw.iter()
                .map(|p| {
                    CollectionPath::parse(p)
                        .map_err(|e| StoreError::InvalidData(format!("catalog path {:?}: {}", p, e)))
                })
                .collect()
        })
        .await
    }

    async fn clear(&self, path: &CollectionPath) -> Result<()> {
        let path = path.clone();

        self.blocking(move |conn| {
            if let Some(table) = lookup_table(conn, &path)? {
                conn.execute(&format!("DELETE FROM \"{table}\""), [])?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::LocalStoreExt;

    fn path() -> CollectionPath {
        CollectionPath::parse("school-42/Assignments").unwrap()
    }

    fn row(key: &str, payload: &str, seq: Seq) -> CachedRecord {
        CachedRecord::clean(RecordKey::from(key), payload.as_bytes().to_vec(), seq)
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = SqliteStore::open_memory().unwrap();
        store.upsert(&path(), row("as1", "essay", 1)).await.unwrap();

        let retrieved = store
            .get_by_key(&path(), &RecordKey::from("as1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&retrieved.payload[..], b"essay");
        assert_eq!(retrieved.last_applied_seq, 1);
        assert!(!retrieved.dirty);
    }

    #[tokio::test]
    async fn test_unknown_collection_reads_empty() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.get_all(&path()).await.unwrap().is_empty());
        assert!(store
            .get_by_key(&path(), &RecordKey::from("x"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.max_sequence(&path()).await.unwrap(), 0);
        assert!(!store
            .delete_by_key(&path(), &RecordKey::from("x"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_upsert_many_replaces_by_key() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .upsert_many(&path(), &[row("a", "1", 1), row("b", "1", 2)])
            .await
            .unwrap();
        store
            .upsert_many(&path(), &[row("a", "2", 3)])
            .await
            .unwrap();

        let all = store.get_all(&path()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(&all[0].payload[..], b"2");
        assert_eq!(store.max_sequence(&path()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dirty_tracking() {
        let store = SqliteStore::open_memory().unwrap();
        let key = RecordKey::from("c1");
        store
            .upsert(&path(), CachedRecord::dirty(key.clone(), b"draft".to_vec(), 5))
            .await
            .unwrap();

        assert_eq!(store.dirty(&path()).await.unwrap().len(), 1);
        assert!(!store.mark_clean(&path(), &key, 4).await.unwrap());
        assert!(store.mark_clean(&path(), &key, 5).await.unwrap());
        assert!(store.dirty(&path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collections_catalog() {
        let store = SqliteStore::open_memory().unwrap();
        let chats = CollectionPath::parse("school-42/Chats/room-7").unwrap();
        store.upsert(&path(), row("a", "x", 1)).await.unwrap();
        store.upsert(&chats, row("m1", "hi", 1)).await.unwrap();

        let collections = store.list_collections().await.unwrap();
        assert_eq!(collections, vec![path(), chats.clone()]);

        store.clear(&chats).await.unwrap();
        assert!(store.get_all(&chats).await.unwrap().is_empty());
        assert_eq!(store.count(&path()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("replica.db");

        {
            let store = SqliteStore::open(&file).unwrap();
            store
                .upsert_many(&path(), &[row("a", "1", 10), row("b", "2", 11)])
                .await
                .unwrap();
            store
                .upsert(&path(), CachedRecord::dirty(RecordKey::from("c"), b"3".to_vec(), 12))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&file).unwrap();
        assert_eq!(store.count(&path()).await.unwrap(), 3);
        assert_eq!(store.max_sequence(&path()).await.unwrap(), 12);
        assert_eq!(store.dirty(&path()).await.unwrap()[0].key.as_str(), "c");
    }
}
