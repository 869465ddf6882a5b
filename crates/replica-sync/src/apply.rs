//! Applying sequenced changes to the local store.
//!
//! The [`Applier`] is owned by a collection's worker task and sees every
//! command in sequence order. It is the only writer of the collection's
//! rows, so its staleness checks never race with another writer.
//!
//! # Staleness rules
//!
//! - `Added`/`Changed` at `seq` is discarded when the row's
//!   `last_applied_seq >= seq`, or when the key was removed at a sequence
//!   number `>= seq`.
//! - `Removed` deletes unconditionally, dirty or not, and leaves a tombstone
//!   so that a late lower-numbered upsert for the key cannot resurrect it.
//! - A refresh snapshot only touches rows that have not changed since the
//!   fetch started (`basis`) and that carry no unconfirmed local write.
//!
//! # Tombstones
//!
//! Commands arrive in sequence order, so a tombstone only matters to a
//! refresh whose fetch started before the removal. Tombstones at or below
//! the lowest pending refresh basis are dropped (all of them when no refresh
//! is pending) and folded into a single horizon: an upsert stamped at or
//! below it for a key with no row is a late delivery and is discarded.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use replica_core::{CachedRecord, CodecError, CollectionPath, RecordCodec, RecordKey, RemoteError, RemoteEvent, Seq};
use replica_store::{LocalStore, StoreError};

/// What one remote event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The row was inserted or replaced.
    Upserted(RecordKey),
    /// The row was deleted (`existed` is false when there was nothing to delete).
    Removed { key: RecordKey, existed: bool },
    /// The event was older than what the row already reflects.
    Discarded(RecordKey),
    /// The payload could not be decoded; nothing changed.
    Malformed(CodecError),
    /// The remote ended the subscription.
    Cancelled(RemoteError),
}

impl Applied {
    /// Whether the cache contents changed.
    pub fn changed_cache(&self) -> bool {
        matches!(self, Applied::Upserted(_) | Applied::Removed { existed: true, .. })
    }
}

/// Running counters for one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: u64,
    pub discarded: u64,
    pub removed: u64,
    pub malformed: u64,
    pub refreshes: u64,
}

/// Result of merging one fetch snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Rows inserted or replaced.
    pub applied: usize,
    /// Rows already holding the fetched payload.
    pub unchanged: usize,
    /// Rows left alone because they are dirty or changed after the fetch began.
    pub skipped: usize,
    /// Clean rows deleted because the snapshot no longer contains them.
    pub pruned: usize,
    /// Payloads that failed to decode.
    pub malformed: Vec<CodecError>,
}

impl RefreshSummary {
    pub fn changed_cache(&self) -> bool {
        self.applied > 0 || self.pruned > 0
    }
}

/// Basis watermarks of refreshes whose fetch has started but whose snapshot
/// has not been applied yet.
#[derive(Debug, Default)]
pub(crate) struct PendingRefreshes {
    bases: Mutex<BTreeMap<Seq, usize>>,
}

impl PendingRefreshes {
    /// Register a refresh. `basis` is read under the registry lock, so the
    /// worker never prunes a tombstone the new refresh could still need.
    pub(crate) fn begin(self: &Arc<Self>, basis: impl FnOnce() -> Seq) -> RefreshTicket {
        let mut bases = self.bases.lock().unwrap_or_else(PoisonError::into_inner);
        let basis = basis();
        *bases.entry(basis).or_insert(0) += 1;
        RefreshTicket {
            basis,
            pending: Arc::clone(self),
        }
    }

    /// The lowest basis still pending.
    pub(crate) fn lowest(&self) -> Option<Seq> {
        let bases = self.bases.lock().unwrap_or_else(PoisonError::into_inner);
        bases.keys().next().copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let bases = self.bases.lock().unwrap_or_else(PoisonError::into_inner);
        bases.values().sum()
    }

    fn finish(&self, basis: Seq) {
        let mut bases = self.bases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Entry::Occupied(mut entry) = bases.entry(basis) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }
}

/// One in-flight refresh. Dropping it (applied, failed or abandoned) ends it.
#[derive(Debug)]
pub(crate) struct RefreshTicket {
    basis: Seq,
    pending: Arc<PendingRefreshes>,
}

impl RefreshTicket {
    pub(crate) fn basis(&self) -> Seq {
        self.basis
    }
}

impl Drop for RefreshTicket {
    fn drop(&mut self) {
        self.pending.finish(self.basis);
    }
}

/// Applies commands for one collection.
pub struct Applier<C: RecordCodec> {
    path: CollectionPath,
    store: Arc<dyn LocalStore>,
    codec: Arc<C>,
    /// Highest removal sequence per key since the last upsert of that key.
    tombstones: HashMap<RecordKey, Seq>,
    /// Highest tombstone sequence dropped so far.
    horizon: Seq,
    pending: Arc<PendingRefreshes>,
    stats: ApplyStats,
}

impl<C: RecordCodec> Applier<C> {
    pub fn new(path: CollectionPath, store: Arc<dyn LocalStore>, codec: Arc<C>) -> Self {
        Self {
            path,
            store,
            codec,
            tombstones: HashMap::new(),
            horizon: 0,
            pending: Arc::default(),
            stats: ApplyStats::default(),
        }
    }

    /// Refreshes in flight for this collection.
    pub(crate) fn pending(&self) -> &Arc<PendingRefreshes> {
        &self.pending
    }

    /// Number of keys currently holding a tombstone.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Drop tombstones no pending refresh can need.
    pub(crate) fn prune_tombstones(&mut self) {
        if self.tombstones.is_empty() {
            return;
        }
        let floor = self.pending.lowest();
        let mut horizon = self.horizon;
        self.tombstones.retain(|_, &mut seq| match floor {
            Some(basis) if seq > basis => true,
            _ => {
                horizon = horizon.max(seq);
                false
            }
        });
        self.horizon = horizon;
    }

    pub fn path(&self) -> &CollectionPath {
        &self.path
    }

    pub fn stats(&self) -> ApplyStats {
        self.stats
    }

    fn removed_at_or_after(&self, key: &RecordKey, seq: Seq) -> bool {
        self.tombstones.get(key).map(|&t| t >= seq).unwrap_or(false)
    }

    fn tombstone(&mut self, key: RecordKey, seq: Seq) {
        let entry = self.tombstones.entry(key).or_insert(seq);
        *entry = (*entry).max(seq);
        self.prune_tombstones();
    }

    /// Apply one event from the live listener.
    pub async fn apply_remote(&mut self, seq: Seq, event: RemoteEvent) -> Result<Applied, StoreError> {
        match event {
            RemoteEvent::Added(payload) | RemoteEvent::Changed(payload) => {
                self.apply_upsert(seq, payload).await
            }
            RemoteEvent::Removed(key) => {
                let existed = self.store.delete_by_key(&self.path, &key).await?;
                self.tombstone(key.clone(), seq);
                self.stats.removed += 1;
                tracing::debug!(path = %self.path, seq, key = %key, existed, "remote removal applied");
                Ok(Applied::Removed { key, existed })
            }
            RemoteEvent::Cancelled(reason) => Ok(Applied::Cancelled(reason)),
        }
    }

    async fn apply_upsert(&mut self, seq: Seq, payload: Bytes) -> Result<Applied, StoreError> {
        let key = match self.codec.decode_keyed(&payload) {
            Ok((key, _)) => key,
            Err(err) => {
                self.stats.malformed += 1;
                tracing::warn!(path = %self.path, seq, error = %err, "skipping malformed remote payload");
                return Ok(Applied::Malformed(err));
            }
        };

        if self.removed_at_or_after(&key, seq) {
            self.stats.discarded += 1;
            tracing::debug!(path = %self.path, seq, key = %key, "event predates removal, discarded");
            return Ok(Applied::Discarded(key));
        }

        match self.store.get_by_key(&self.path, &key).await? {
            Some(row) if row.supersedes(seq) => {
                self.stats.discarded += 1;
                tracing::debug!(
                    path = %self.path,
                    seq,
                    key = %key,
                    last_applied_seq = row.last_applied_seq,
                    "stale event discarded"
                );
                return Ok(Applied::Discarded(key));
            }
            None if seq <= self.horizon => {
                self.stats.discarded += 1;
                tracing::debug!(path = %self.path, seq, key = %key, horizon = self.horizon, "late event discarded");
                return Ok(Applied::Discarded(key));
            }
            _ => {}
        }

        let row = CachedRecord::clean(key.clone(), payload, seq);
        self.store.upsert_many(&self.path, std::slice::from_ref(&row)).await?;
        self.tombstones.remove(&key);
        self.stats.applied += 1;
        tracing::debug!(path = %self.path, seq, key = %key, "remote change applied");
        Ok(Applied::Upserted(key))
    }

    /// Store an optimistic local write, marked dirty.
    pub async fn local_upsert(&mut self, seq: Seq, key: RecordKey, payload: Bytes) -> Result<(), StoreError> {
        let row = CachedRecord::dirty(key.clone(), payload, seq);
        self.store.upsert_many(&self.path, std::slice::from_ref(&row)).await?;
        self.tombstones.remove(&key);
        tracing::debug!(path = %self.path, seq, key = %key, "local write stored");
        Ok(())
    }

    /// Delete a row ahead of the remote delete.
    pub async fn local_delete(&mut self, seq: Seq, key: RecordKey) -> Result<bool, StoreError> {
        let existed = self.store.delete_by_key(&self.path, &key).await?;
        tracing::debug!(path = %self.path, seq, key = %key, existed, "local delete stored");
        self.tombstone(key, seq);
        Ok(existed)
    }

    /// Clear the dirty flag of the write stamped `seq`, if it is still the latest.
    pub async fn confirm_write(&mut self, key: &RecordKey, seq: Seq) -> Result<bool, StoreError> {
        let cleared = self.store.mark_clean(&self.path, key, seq).await?;
        if !cleared {
            tracing::debug!(path = %self.path, seq, key = %key, "confirmation superseded by a later change");
        }
        Ok(cleared)
    }

    /// Merge a fetch snapshot taken after sequence number `basis`.
    pub async fn refresh(
        &mut self,
        seq: Seq,
        basis: Seq,
        payloads: Vec<Bytes>,
        prune: bool,
    ) -> Result<RefreshSummary, StoreError> {
        let mut summary = RefreshSummary::default();

        let mut fetched: BTreeMap<RecordKey, Bytes> = BTreeMap::new();
        for payload in payloads {
            match self.codec.decode_keyed(&payload) {
                Ok((key, _)) => {
                    fetched.insert(key, payload);
                }
                Err(err) => {
                    self.stats.malformed += 1;
                    tracing::warn!(path = %self.path, error = %err, "skipping malformed fetched payload");
                    summary.malformed.push(err);
                }
            }
        }

        let existing: HashMap<RecordKey, CachedRecord> = self
            .store
            .get_all(&self.path)
            .await?
            .into_iter()
            .map(|row| (row.key.clone(), row))
            .collect();

        let mut rows = Vec::new();
        for (key, payload) in &fetched {
            if self.tombstones.get(key).map(|&t| t > basis).unwrap_or(false) {
                summary.skipped += 1;
                continue;
            }
            match existing.get(key) {
                Some(row) if row.dirty || row.last_applied_seq > basis => summary.skipped += 1,
                Some(row) if row.payload == *payload => summary.unchanged += 1,
                _ => rows.push(CachedRecord::clean(key.clone(), payload.clone(), seq)),
            }
        }

        if !rows.is_empty() {
            self.store.upsert_many(&self.path, &rows).await?;
            for row in &rows {
                self.tombstones.remove(&row.key);
            }
        }
        summary.applied = rows.len();

        if prune {
            let present: HashSet<&RecordKey> = fetched.keys().collect();
            for row in existing.values() {
                if !present.contains(&row.key) && !row.dirty && row.last_applied_seq <= basis {
                    if self.store.delete_by_key(&self.path, &row.key).await? {
                        summary.pruned += 1;
                    }
                }
            }
        }

        self.stats.refreshes += 1;
        self.prune_tombstones();
        tracing::debug!(
            path = %self.path,
            seq,
            basis,
            applied = summary.applied,
            unchanged = summary.unchanged,
            skipped = summary.skipped,
            pruned = summary.pruned,
            malformed = summary.malformed.len(),
            "refresh merged"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use replica_core::{JsonCodec, Keyed};
    use replica_store::MemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Keyed for Note {
        fn record_key(&self) -> RecordKey {
            RecordKey::new(self.id.clone())
        }
    }

    fn path() -> CollectionPath {
        CollectionPath::parse("school-42/Notes").unwrap()
    }

    fn payload(id: &str, body: &str) -> Bytes {
        JsonCodec::<Note>::new()
            .encode(&Note {
                id: id.into(),
                body: body.into(),
            })
            .unwrap()
    }

    fn applier() -> (Applier<JsonCodec<Note>>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let applier = Applier::new(path(), store.clone(), Arc::new(JsonCodec::new()));
        (applier, store)
    }

    async fn body_of(store: &MemoryStore, key: &str) -> Option<String> {
        let row = store.get_by_key(&path(), &RecordKey::from(key)).await.unwrap()?;
        let note: Note = JsonCodec::<Note>::new().decode(&row.payload).unwrap();
        Some(note.body)
    }

    #[tokio::test]
    async fn test_duplicate_added_yields_one_row() {
        let (mut applier, store) = applier();
        applier.apply_remote(1, RemoteEvent::Added(payload("a", "x"))).await.unwrap();
        applier.apply_remote(2, RemoteEvent::Added(payload("a", "x"))).await.unwrap();

        assert_eq!(store.get_all(&path()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_event_discarded() {
        let (mut applier, store) = applier();
        applier.apply_remote(5, RemoteEvent::Changed(payload("a", "new"))).await.unwrap();

        let outcome = applier.apply_remote(3, RemoteEvent::Changed(payload("a", "old"))).await.unwrap();
        assert_eq!(outcome, Applied::Discarded(RecordKey::from("a")));
        assert_eq!(body_of(&store, "a").await.as_deref(), Some("new"));
        assert_eq!(applier.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_removal_blocks_lower_seq_change() {
        let (mut applier, store) = applier();
        applier.apply_remote(1, RemoteEvent::Added(payload("a", "x"))).await.unwrap();
        applier.apply_remote(4, RemoteEvent::Removed(RecordKey::from("a"))).await.unwrap();

        let outcome = applier.apply_remote(3, RemoteEvent::Changed(payload("a", "late"))).await.unwrap();
        assert!(matches!(outcome, Applied::Discarded(_)));
        assert!(body_of(&store, "a").await.is_none());

        // A genuinely newer change brings the key back.
        applier.apply_remote(6, RemoteEvent::Added(payload("a", "again"))).await.unwrap();
        assert_eq!(body_of(&store, "a").await.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_removal_wins_over_dirty_write() {
        let (mut applier, store) = applier();
        applier.local_upsert(1, RecordKey::from("a"), payload("a", "mine")).await.unwrap();
        applier.apply_remote(2, RemoteEvent::Removed(RecordKey::from("a"))).await.unwrap();

        assert!(store.get_all(&path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_change_clears_dirty() {
        let (mut applier, store) = applier();
        applier.local_upsert(1, RecordKey::from("a"), payload("a", "mine")).await.unwrap();
        assert_eq!(store.dirty(&path()).await.unwrap().len(), 1);

        applier.apply_remote(2, RemoteEvent::Changed(payload("a", "theirs"))).await.unwrap();
        assert!(store.dirty(&path()).await.unwrap().is_empty());
        assert_eq!(body_of(&store, "a").await.as_deref(), Some("theirs"));
    }

    #[tokio::test]
    async fn test_malformed_payload_skipped() {
        let (mut applier, store) = applier();
        let outcome = applier
            .apply_remote(1, RemoteEvent::Added(Bytes::from_static(b"{not json")))
            .await
            .unwrap();
        assert!(matches!(outcome, Applied::Malformed(_)));

        let empty_key = applier
            .apply_remote(2, RemoteEvent::Added(payload("", "keyless")))
            .await
            .unwrap();
        assert_eq!(empty_key, Applied::Malformed(CodecError::EmptyKey));

        applier.apply_remote(3, RemoteEvent::Added(payload("a", "ok"))).await.unwrap();
        assert_eq!(store.get_all(&path()).await.unwrap().len(), 1);
        assert_eq!(applier.stats().malformed, 2);
    }

    #[tokio::test]
    async fn test_confirm_only_clears_matching_write() {
        let (mut applier, store) = applier();
        let key = RecordKey::from("a");
        applier.local_upsert(1, key.clone(), payload("a", "v1")).await.unwrap();
        applier.local_upsert(2, key.clone(), payload("a", "v2")).await.unwrap();

        assert!(!applier.confirm_write(&key, 1).await.unwrap());
        assert_eq!(store.dirty(&path()).await.unwrap().len(), 1);
        assert!(applier.confirm_write(&key, 2).await.unwrap());
        assert!(store.dirty(&path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_respects_basis_and_dirty_rows() {
        let (mut applier, store) = applier();
        applier.apply_remote(1, RemoteEvent::Added(payload("same", "s"))).await.unwrap();
        applier.apply_remote(2, RemoteEvent::Added(payload("stale", "old"))).await.unwrap();
        applier.apply_remote(3, RemoteEvent::Added(payload("gone", "g"))).await.unwrap();
        applier.local_upsert(4, RecordKey::from("mine"), payload("mine", "local")).await.unwrap();
        // Changed after the fetch started.
        applier.apply_remote(6, RemoteEvent::Added(payload("late", "fresh"))).await.unwrap();

        let snapshot = vec![
            payload("same", "s"),
            payload("stale", "new"),
            payload("mine", "remote"),
            payload("late", "older"),
            payload("fresh", "f"),
            Bytes::from_static(b"garbage"),
        ];
        let summary = applier.refresh(7, 5, snapshot, true).await.unwrap();

        assert_eq!(summary.applied, 2);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.pruned, 1);
        assert_eq!(summary.malformed.len(), 1);

        assert_eq!(body_of(&store, "stale").await.as_deref(), Some("new"));
        assert_eq!(body_of(&store, "mine").await.as_deref(), Some("local"));
        assert_eq!(body_of(&store, "late").await.as_deref(), Some("fresh"));
        assert_eq!(body_of(&store, "fresh").await.as_deref(), Some("f"));
        assert!(body_of(&store, "gone").await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_does_not_resurrect_recent_removal() {
        let (mut applier, store) = applier();
        applier.apply_remote(1, RemoteEvent::Added(payload("a", "x"))).await.unwrap();
        let ticket = applier.pending().begin(|| 2);
        applier.apply_remote(3, RemoteEvent::Removed(RecordKey::from("a"))).await.unwrap();
        assert_eq!(applier.tombstone_count(), 1);

        let summary = applier
            .refresh(4, ticket.basis(), vec![payload("a", "x")], false)
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(body_of(&store, "a").await.is_none());

        drop(ticket);
        applier.prune_tombstones();
        assert_eq!(applier.tombstone_count(), 0);
    }

    #[tokio::test]
    async fn test_tombstones_dropped_without_pending_refresh() {
        let (mut applier, store) = applier();
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            let seq = i as Seq * 2 + 1;
            applier.apply_remote(seq, RemoteEvent::Added(payload(key, "x"))).await.unwrap();
            applier.apply_remote(seq + 1, RemoteEvent::Removed(RecordKey::from(*key))).await.unwrap();
        }
        applier.local_delete(7, RecordKey::from("d")).await.unwrap();

        assert_eq!(applier.tombstone_count(), 0);
        assert!(store.get_all(&path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tombstones_kept_only_above_lowest_pending_basis() {
        let (mut applier, _store) = applier();
        let early = applier.pending().begin(|| 2);
        let late = applier.pending().begin(|| 5);
        applier.apply_remote(2, RemoteEvent::Removed(RecordKey::from("a"))).await.unwrap();
        applier.apply_remote(4, RemoteEvent::Removed(RecordKey::from("b"))).await.unwrap();
        applier.apply_remote(6, RemoteEvent::Removed(RecordKey::from("c"))).await.unwrap();
        assert_eq!(applier.tombstone_count(), 2);

        drop(early);
        applier.prune_tombstones();
        assert_eq!(applier.tombstone_count(), 1);
        assert_eq!(applier.pending().len(), 1);

        drop(late);
        applier.prune_tombstones();
        assert_eq!(applier.tombstone_count(), 0);
        assert_eq!(applier.pending().lowest(), None);
    }

    proptest! {
        #[test]
        fn test_last_writer_wins(bodies in prop::collection::vec("[a-z]{1,6}", 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (mut applier, store) = applier();
                for (i, body) in bodies.iter().enumerate() {
                    let event = if i == 0 {
                        RemoteEvent::Added(payload("k", body))
                    } else {
                        RemoteEvent::Changed(payload("k", body))
                    };
                    applier.apply_remote(i as Seq + 1, event).await.unwrap();
                }

                let last = bodies.last().cloned();
                assert_eq!(body_of(&store, "k").await, last);
                assert_eq!(store.get_all(&path()).await.unwrap().len(), 1);
            });
        }
    }
}
