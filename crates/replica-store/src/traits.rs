//! LocalStore trait: the abstract interface for the durable record cache.
//!
//! This trait allows the engine to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use replica_core::{CachedRecord, CollectionPath, RecordKey, Seq};

use crate::error::Result;

/// The LocalStore trait: async interface for per-collection record storage.
///
/// All methods are async to support both blocking (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Keyed rows**: every collection behaves as its own table keyed by [`RecordKey`].
/// - **Atomic batches**: [`upsert_many`](LocalStore::upsert_many) either stores every
///   row or none of them, so concurrent readers never observe half a batch.
/// - **Local only**: no method touches the network.
#[async_trait]
pub trait LocalStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Record Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get every row of a collection, ordered by key.
    async fn get_all(&self, path: &CollectionPath) -> Result<Vec<CachedRecord>>;

    /// Get one row by key.
    async fn get_by_key(&self, path: &CollectionPath, key: &RecordKey)
        -> Result<Option<CachedRecord>>;

    /// Insert or replace rows by key, atomically.
    async fn upsert_many(&self, path: &CollectionPath, rows: &[CachedRecord]) -> Result<()>;

    /// Delete a row. Returns whether a row existed.
    async fn delete_by_key(&self, path: &CollectionPath, key: &RecordKey) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Sync Bookkeeping
    // ─────────────────────────────────────────────────────────────────────────

    /// Clear the `dirty` flag of a row, but only if its `last_applied_seq`
    /// still equals `seq`. Returns whether the flag was cleared.
    async fn mark_clean(&self, path: &CollectionPath, key: &RecordKey, seq: Seq) -> Result<bool>;

    /// Get every dirty row of a collection, ordered by key.
    async fn dirty(&self, path: &CollectionPath) -> Result<Vec<CachedRecord>>;

    /// Highest `last_applied_seq` persisted for a collection (0 when empty).
    async fn max_sequence(&self, path: &CollectionPath) -> Result<Seq>;

    // ─────────────────────────────────────────────────────────────────────────
    // Collection Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// List every collection known to the store.
    async fn list_collections(&self) -> Result<Vec<CollectionPath>>;

    /// Remove every row of a collection.
    async fn clear(&self, path: &CollectionPath) -> Result<()>;
}

/// Extension trait for common store patterns.
pub trait LocalStoreExt: LocalStore {
    /// Insert or replace a single row.
    fn upsert(
        &self,
        path: &CollectionPath,
        row: CachedRecord,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Number of rows in a collection.
    fn count(&self, path: &CollectionPath) -> impl std::future::Future<Output = Result<usize>> + Send;
}

impl<S: LocalStore + ?Sized> LocalStoreExt for S {
    async fn upsert(&self, path: &CollectionPath, row: CachedRecord) -> Result<()> {
        self.upsert_many(path, std::slice::from_ref(&row)).await
    }

    async fn count(&self, path: &CollectionPath) -> Result<usize> {
        Ok(self.get_all(path).await?.len())
    }
}

#[async_trait]
impl<S: LocalStore + ?Sized> LocalStore for std::sync::Arc<S> {
    async fn get_all(&self, path: &CollectionPath) -> Result<Vec<CachedRecord>> {
        (**self).get_all(path).await
    }

    async fn get_by_key(
        &self,
        path: &CollectionPath,
        key: &RecordKey,
    ) -> Result<Option<CachedRecord>> {
        (**self).get_by_key(path, key).await
    }

    async fn upsert_many(&self, path: &CollectionPath, rows: &[CachedRecord]) -> Result<()> {
        (**self).upsert_many(path, rows).await
    }

    async fn delete_by_key(&self, path: &CollectionPath, key: &RecordKey) -> Result<bool> {
        (**self).delete_by_key(path, key).await
    }

    async fn mark_clean(&self, path: &CollectionPath, key: &RecordKey, seq: Seq) -> Result<bool> {
        (**self).mark_clean(path, key, seq).await
    }

    async fn dirty(&self, path: &CollectionPath) -> Result<Vec<CachedRecord>> {
        (**self).dirty(path).await
    }

    async fn max_sequence(&self, path: &CollectionPath) -> Result<Seq> {
        (**self).max_sequence(path).await
    }

    async fn list_collections(&self) -> Result<Vec<CollectionPath>> {
        (**self).list_collections().await
    }

    async fn clear(&self, path: &CollectionPath) -> Result<()> {
        (**self).clear(path).await
    }
}
