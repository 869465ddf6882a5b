//! In-memory implementation of the LocalStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use replica_core::{CachedRecord, CollectionPath, RecordKey, Seq};

use crate::error::{Result, StoreError};
use crate::traits::LocalStore;

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock; a
/// batch is applied under one write guard, so readers never see half of it.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// One ordered table per collection.
    tables: HashMap<CollectionPath, BTreeMap<RecordKey, CachedRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get_all(&self, path: &CollectionPath) -> Result<Vec<CachedRecord>> {
        let inner = self.read()?;
        Ok(inner
            .tables
            .get(path)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_by_key(
        &self,
        path: &CollectionPath,
        key: &RecordKey,
    ) -> Result<Option<CachedRecord>> {
        let inner = self.read()?;
        Ok(inner.tables.get(path).and_then(|t| t.get(key)).cloned())
    }

    async fn upsert_many(&self, path: &CollectionPath, rows: &[CachedRecord]) -> Result<()> {
        let mut inner = self.write()?;
        let table = inner.tables.entry(path.clone()).or_default();
        for row in rows {
            table.insert(row.key.clone(), row.clone());
        }
        Ok(())
    }

    async fn delete_by_key(&self, path: &CollectionPath, key: &RecordKey) -> Result<bool> {
        let mut inner = self.write()?;
        Ok(inner
            .tables
            .get_mut(path)
            .map(|t| t.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn mark_clean(&self, path: &CollectionPath, key: &RecordKey, seq: Seq) -> Result<bool> {
        let mut inner = self.write()?;
        let row = match inner.tables.get_mut(path).and_then(|t| t.get_mut(key)) {
            Some(row) => row,
            None => return Ok(false),
        };

        if row.dirty && row.last_applied_seq == seq {
            row.dirty = false;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn dirty(&self, path: &CollectionPath) -> Result<Vec<CachedRecord>> {
        let inner = self.read()?;
        Ok(inner
            .tables
            .get(path)
            .map(|t| t.values().filter(|r| r.dirty).cloned().collect())
            .unwrap_or_default())
    }

    async fn max_sequence(&self, path: &CollectionPath) -> Result<Seq> {
        let inner = self.read()?;
        Ok(inner
            .tables
            .get(path)
            .and_then(|t| t.values().map(|r| r.last_applied_seq).max())
            .unwrap_or(0))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionPath>> {
        let inner = self.read()?;
        let mut paths: Vec<CollectionPath> = inner.tables.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    async fn clear(&self, path: &CollectionPath) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(table) = inner.tables.get_mut(path) {
            table.clear();
        }
        Ok(())
    }
}
