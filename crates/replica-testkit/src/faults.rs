//! A store that fails on demand.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use replica_core::{CachedRecord, CollectionPath, RecordKey, Seq};
use replica_store::{LocalStore, Result, StoreError};

/// Wraps a [`LocalStore`] and fails every call while tripped.
///
/// Reads and writes can be tripped independently.
pub struct FailingStore<S> {
    inner: S,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl<S: LocalStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: LocalStore> LocalStore for FailingStore<S> {
    async fn get_all(&self, path: &CollectionPath) -> Result<Vec<CachedRecord>> {
        self.check_read()?;
        self.inner.get_all(path).await
    }

    async fn get_by_key(&self, path: &CollectionPath, key: &RecordKey) -> Result<Option<CachedRecord>> {
        self.check_read()?;
        self.inner.get_by_key(path, key).await
    }

    async fn upsert_many(&self, path: &CollectionPath, rows: &[CachedRecord]) -> Result<()> {
        self.check_write()?;
        self.inner.upsert_many(path, rows).await
    }

    async fn delete_by_key(&self, path: &CollectionPath, key: &RecordKey) -> Result<bool> {
        self.check_write()?;
        self.inner.delete_by_key(path, key).await
    }

    async fn mark_clean(&self, path: &CollectionPath, key: &RecordKey, seq: Seq) -> Result<bool> {
        self.check_write()?;
        self.inner.mark_clean(path, key, seq).await
    }

    async fn dirty(&self, path: &CollectionPath) -> Result<Vec<CachedRecord>> {
        self.check_read()?;
        self.inner.dirty(path).await
    }

    async fn max_sequence(&self, path: &CollectionPath) -> Result<Seq> {
        self.check_read()?;
        self.inner.max_sequence(path).await
    }

    async fn list_collections(&self) -> Result<Vec<CollectionPath>> {
        self.check_read()?;
        self.inner.list_collections().await
    }

    async fn clear(&self, path: &CollectionPath) -> Result<()> {
        self.check_write()?;
        self.inner.clear(path).await
    }
}
