//! The per-collection sync coordinator.
//!
//! A [`Coordinator`] owns one collection: the serialized command queue and
//! its worker, the subscription state machine, the dual-write path, and the
//! fault broadcast. It is a cheap clonable handle; every clone drives the
//! same worker.
//!
//! # Ordering
//!
//! Remote events, local writes, local deletes and refresh snapshots are all
//! stamped by one [`Sequencer`] and applied by one worker in stamp order.
//! Remote calls (`fetch_once`, `write_by_key`, `delete_by_key`) run outside
//! the worker and feed their results back through the queue.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use replica_core::{
    CachedRecord, CodecError, CollectionPath, RecordCodec, RecordKey, RemoteError, Seq,
    SequencedEvent,
};
use replica_store::LocalStore;

use crate::apply::{Applied, Applier, ApplyStats, PendingRefreshes, RefreshSummary};
use crate::error::{CollectionFault, FaultKind, Result, SyncError};
use crate::queue::{Command, Sequencer};
use crate::registry::{ListenerOwner, ListenerRegistry};
use crate::remote::{EventHandler, RemoteChannel};
use crate::state::SyncState;

/// Per-collection behavior knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Fetch from the remote on every read-through.
    pub refresh_on_read: bool,
    /// Delete clean cached rows that a refresh snapshot no longer contains.
    pub prune_on_refresh: bool,
    /// Upper bound for each remote call. `None` waits indefinitely.
    pub remote_timeout: Option<Duration>,
    /// Buffered faults per observer before the slowest one starts lagging.
    pub fault_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            refresh_on_read: true,
            prune_on_refresh: true,
            remote_timeout: None,
            fault_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_refresh_on_read(mut self, enabled: bool) -> Self {
        self.refresh_on_read = enabled;
        self
    }

    pub fn with_prune_on_refresh(mut self, enabled: bool) -> Self {
        self.prune_on_refresh = enabled;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = Some(timeout);
        self
    }

    pub fn with_fault_capacity(mut self, capacity: usize) -> Self {
        self.fault_capacity = capacity.max(1);
        self
    }
}

/// State shared between the handle and the worker.
struct Shared {
    path: CollectionPath,
    state: watch::Sender<SyncState>,
    /// Bumped after every command that changed the cache.
    revision: watch::Sender<u64>,
    faults: broadcast::Sender<CollectionFault>,
    stats: watch::Sender<ApplyStats>,
    /// Why the subscription was cancelled, while degraded.
    cancelled: Mutex<Option<RemoteError>>,
}

impl Shared {
    fn set_state(&self, next: SyncState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(path = %self.path, from = %previous, to = %next, "state transition");
        }
    }

    /// Move to `next` only if the current state is `from`.
    fn transition(&self, from: SyncState, next: SyncState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(path = %self.path, from = %from, to = %next, "state transition");
        }
        moved
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    fn report(&self, seq: Option<Seq>, kind: FaultKind) {
        let fault = CollectionFault {
            path: self.path.clone(),
            seq,
            kind,
        };
        // No observers is fine.
        let _ = self.faults.send(fault);
    }

    fn cancel_reason(&self) -> Option<RemoteError> {
        self.cancelled.lock().ok().and_then(|r| r.clone())
    }

    fn set_cancel_reason(&self, reason: Option<RemoteError>) {
        if let Ok(mut slot) = self.cancelled.lock() {
            *slot = reason;
        }
    }
}

struct CoordinatorInner<C: RecordCodec> {
    codec: Arc<C>,
    store: Arc<dyn LocalStore>,
    channel: Arc<dyn RemoteChannel>,
    registry: Arc<ListenerRegistry>,
    /// Identity of this coordinator in the registry. Dropped with the last handle.
    owner: ListenerOwner,
    sequencer: Arc<Sequencer>,
    pending: Arc<PendingRefreshes>,
    shared: Arc<Shared>,
    config: CoordinatorConfig,
    /// Serializes subscribe and release.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Handle to one collection's sync coordinator.
pub struct Coordinator<C: RecordCodec> {
    inner: Arc<CoordinatorInner<C>>,
}

impl<C: RecordCodec> Clone for Coordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: RecordCodec> Coordinator<C> {
    /// Start a coordinator for `path` in the `Idle` state.
    ///
    /// Sequence numbers continue from the highest one persisted for the
    /// collection. Must be called within a tokio runtime; the worker task is
    /// spawned here and runs until every handle is dropped.
    pub async fn open(
        path: CollectionPath,
        codec: Arc<C>,
        store: Arc<dyn LocalStore>,
        registry: Arc<ListenerRegistry>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let last = store.max_sequence(&path).await?;
        let (sequencer, rx) = Sequencer::new(path.clone(), last);
        let channel = registry.source().channel(&path);

        let (faults, _) = broadcast::channel(config.fault_capacity.max(1));
        let shared = Arc::new(Shared {
            path: path.clone(),
            state: watch::channel(SyncState::Idle).0,
            revision: watch::channel(0).0,
            faults,
            stats: watch::channel(ApplyStats::default()).0,
            cancelled: Mutex::new(None),
        });

        let applier = Applier::new(path.clone(), Arc::clone(&store), Arc::clone(&codec));
        let pending = Arc::clone(applier.pending());
        tokio::spawn(run_worker(applier, rx, Arc::clone(&shared)));
        tracing::debug!(path = %path, last_seq = last, "coordinator opened");

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                codec,
                store,
                channel,
                registry,
                owner: ListenerOwner::new(),
                sequencer: Arc::new(sequencer),
                pending,
                shared,
                config,
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn path(&self) -> &CollectionPath {
        &self.inner.shared.path
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SyncState {
        *self.inner.shared.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<SyncState> {
        self.inner.shared.state.subscribe()
    }

    /// Watch the cache revision, bumped after every applied change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.shared.revision.subscribe()
    }

    /// Observe subscription faults. Only faults raised after this call are seen.
    pub fn faults(&self) -> broadcast::Receiver<CollectionFault> {
        self.inner.shared.faults.subscribe()
    }

    /// Counters of the worker so far.
    pub fn stats(&self) -> ApplyStats {
        *self.inner.shared.stats.borrow()
    }

    /// The last local sequence number issued.
    pub fn last_seq(&self) -> Seq {
        self.inner.sequencer.current()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.sequencer.is_closed()
    }

    fn closed(&self) -> SyncError {
        SyncError::Closed(self.path().clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscription lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Make sure a live listener feeds this collection.
    ///
    /// No-op when already `Active` or `Degraded`; a degraded collection stays
    /// degraded until [`release`](Self::release). Fails with
    /// [`SyncError::Closed`] after [`close`](Self::close).
    pub async fn ensure_subscribed(&self) -> Result<SyncState> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_closed() {
            return Err(self.closed());
        }

        let current = self.state();
        if matches!(current, SyncState::Active | SyncState::Degraded) {
            return Ok(current);
        }

        let shared = &self.inner.shared;
        shared.set_state(SyncState::Subscribing);

        let sequencer = Arc::downgrade(&self.inner.sequencer);
        let path = self.path().clone();
        let handler: EventHandler = Arc::new(move |event| {
            let Some(sequencer) = sequencer.upgrade() else {
                return;
            };
            if sequencer.push_remote(event).is_err() {
                tracing::debug!(path = %path, "event dropped, coordinator closed");
            }
        });

        match self
            .inner
            .registry
            .register_if_absent(self.path(), &self.inner.owner, handler)
            .await
        {
            Ok(registration) => {
                if !registration.is_created() {
                    tracing::debug!(path = %self.path(), "reusing existing listener");
                }
                shared.transition(SyncState::Subscribing, SyncState::Active);
                Ok(self.state())
            }
            Err(reason) => {
                shared.transition(SyncState::Subscribing, SyncState::Idle);
                tracing::warn!(path = %self.path(), error = %reason, "subscribe failed");
                Err(SyncError::SubscribeFailed(reason))
            }
        }
    }

    /// Subscribe explicitly. Unlike [`ensure_subscribed`](Self::ensure_subscribed),
    /// a degraded collection reports the cancellation as an error.
    pub async fn subscribe_remote(&self) -> Result<()> {
        match self.ensure_subscribed().await? {
            SyncState::Degraded => Err(SyncError::RemoteSubscriptionCancelled {
                path: self.path().clone(),
                reason: self
                    .inner
                    .shared
                    .cancel_reason()
                    .unwrap_or_else(|| RemoteError::Cancelled("subscription cancelled".into())),
            }),
            _ => Ok(()),
        }
    }

    /// Drop the live listener and return to `Idle`. Returns whether a listener
    /// was registered. Events already queued are still applied.
    pub async fn release(&self) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.release_locked().await
    }

    /// Release the listener and stop the worker for good.
    ///
    /// Cached reads keep working. Subscribing, writing, deleting and
    /// refreshing fail with [`SyncError::Closed`]; commands already queued
    /// are still applied.
    pub async fn close(&self) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.sequencer.close();
        let removed = self.release_locked().await;
        tracing::debug!(path = %self.path(), "coordinator closed");
        removed
    }

    async fn release_locked(&self) -> bool {
        let removed = self
            .inner
            .registry
            .unregister_owned(self.path(), &self.inner.owner)
            .await;
        self.inner.shared.set_cancel_reason(None);
        self.inner.shared.set_state(SyncState::Idle);
        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cache reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Read one record from the cache.
    pub async fn get(&self, key: &RecordKey) -> Result<Option<C::Record>> {
        match self.inner.store.get_by_key(self.path(), key).await? {
            Some(row) => self
                .inner
                .codec
                .decode(&row.payload)
                .map(Some)
                .map_err(SyncError::MalformedRecord),
            None => Ok(None),
        }
    }

    /// Every cached record, ordered by key. Rows that no longer decode are skipped.
    pub async fn snapshot(&self) -> Result<Vec<C::Record>> {
        let rows = self.inner.store.get_all(self.path()).await?;
        Ok(self.decode_rows(rows))
    }

    /// Records whose local write the remote has not confirmed.
    pub async fn unsynced(&self) -> Result<Vec<C::Record>> {
        let rows = self.inner.store.dirty(self.path()).await?;
        Ok(self.decode_rows(rows))
    }

    fn decode_rows(&self, rows: Vec<CachedRecord>) -> Vec<C::Record> {
        rows.into_iter()
            .filter_map(|row| match self.inner.codec.decode(&row.payload) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!(path = %self.path(), key = %row.key, error = %err, "skipping undecodable cached row");
                    None
                }
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Write a record locally, then remotely.
    ///
    /// The local row is visible (and dirty) before the remote write is issued.
    /// A failed remote write leaves it dirty; nothing is retried or rolled back.
    pub async fn write(&self, record: &C::Record) -> Result<()> {
        let key = self.inner.codec.key_of(record);
        if key.is_empty() {
            return Err(SyncError::Codec(CodecError::EmptyKey));
        }
        let payload = self.inner.codec.encode(record)?;

        let (ack, done) = oneshot::channel();
        let seq = self
            .inner
            .sequencer
            .submit(|seq| Command::LocalUpsert {
                seq,
                key: key.clone(),
                payload: payload.clone(),
                ack,
            })
            .map_err(|_| self.closed())?;
        done.await.map_err(|_| self.closed())??;

        let outcome = self
            .remote_call(self.inner.channel.write_by_key(&key, payload))
            .await;
        if let Err(reason) = outcome {
            tracing::warn!(path = %self.path(), seq, key = %key, error = %reason, "remote write failed, row left dirty");
            return Err(SyncError::RemoteWriteFailed { key, reason });
        }

        let (ack, done) = oneshot::channel();
        self.inner
            .sequencer
            .submit_unsequenced(Command::ConfirmWrite { key, seq, ack })
            .map_err(|_| self.closed())?;
        done.await.map_err(|_| self.closed())??;
        Ok(())
    }

    /// Delete a record locally, then remotely. Returns whether a cached row existed.
    ///
    /// A failed remote delete does not restore the local row.
    pub async fn delete(&self, key: &RecordKey) -> Result<bool> {
        let (ack, done) = oneshot::channel();
        let seq = self
            .inner
            .sequencer
            .submit(|seq| Command::LocalDelete {
                seq,
                key: key.clone(),
                ack,
            })
            .map_err(|_| self.closed())?;
        let existed = done.await.map_err(|_| self.closed())??;

        let outcome = self.remote_call(self.inner.channel.delete_by_key(key)).await;
        if let Err(reason) = outcome {
            tracing::warn!(path = %self.path(), seq, key = %key, error = %reason, "remote delete failed");
            return Err(SyncError::RemoteDeleteFailed {
                key: key.clone(),
                reason,
            });
        }
        Ok(existed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Refresh
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch the collection once and merge it into the cache.
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        if self.is_closed() {
            return Err(self.closed());
        }
        let sequencer = &self.inner.sequencer;
        let ticket = self.inner.pending.begin(|| sequencer.current());
        let payloads = self
            .remote_call(self.inner.channel.fetch_once())
            .await
            .map_err(SyncError::RemoteFetchFailed)?;

        let prune = self.inner.config.prune_on_refresh;
        let (ack, done) = oneshot::channel();
        self.inner
            .sequencer
            .submit(|seq| Command::Refresh {
                seq,
                ticket,
                payloads,
                prune,
                ack,
            })
            .map_err(|_| self.closed())?;
        done.await.map_err(|_| self.closed())?
    }

    async fn remote_call<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> std::result::Result<T, RemoteError> {
        match self.inner.config.remote_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| Err(RemoteError::TimedOut)),
            None => call.await,
        }
    }
}

/// Drain the queue until every sender is gone.
async fn run_worker<C: RecordCodec>(
    mut applier: Applier<C>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Remote(SequencedEvent { seq, event, .. }) => {
                if *shared.state.borrow() == SyncState::Degraded {
                    tracing::debug!(path = %shared.path, seq, kind = event.kind(), "degraded, event ignored");
                    continue;
                }
                match applier.apply_remote(seq, event).await {
                    Ok(Applied::Cancelled(reason)) => {
                        tracing::warn!(path = %shared.path, seq, error = %reason, "subscription cancelled, collection degraded");
                        shared.set_cancel_reason(Some(reason.clone()));
                        shared.set_state(SyncState::Degraded);
                        shared.report(Some(seq), FaultKind::SubscriptionCancelled(reason));
                    }
                    Ok(Applied::Malformed(err)) => {
                        shared.report(Some(seq), FaultKind::MalformedRecord(err));
                    }
                    Ok(applied) => {
                        if applied.changed_cache() {
                            shared.bump_revision();
                        }
                    }
                    Err(err) => {
                        tracing::error!(path = %shared.path, seq, error = %err, "failed to apply remote event");
                        shared.report(Some(seq), FaultKind::StorageFailure(err.to_string()));
                    }
                }
            }
            Command::LocalUpsert { seq, key, payload, ack } => {
                let result = applier.local_upsert(seq, key, payload).await;
                if result.is_ok() {
                    shared.bump_revision();
                }
                let _ = ack.send(result.map_err(SyncError::from));
            }
            Command::LocalDelete { seq, key, ack } => {
                let result = applier.local_delete(seq, key).await;
                if matches!(result, Ok(true)) {
                    shared.bump_revision();
                }
                let _ = ack.send(result.map_err(SyncError::from));
            }
            Command::ConfirmWrite { key, seq, ack } => {
                let result = applier.confirm_write(&key, seq).await;
                let _ = ack.send(result.map_err(SyncError::from));
            }
            Command::Refresh { seq, ticket, payloads, prune, ack } => {
                let result = applier.refresh(seq, ticket.basis(), payloads, prune).await;
                drop(ticket);
                applier.prune_tombstones();
                if let Ok(summary) = &result {
                    for err in &summary.malformed {
                        shared.report(Some(seq), FaultKind::MalformedRecord(err.clone()));
                    }
                    if summary.changed_cache() {
                        shared.bump_revision();
                    }
                }
                let _ = ack.send(result.map_err(SyncError::from));
            }
        }
        shared.stats.send_replace(applier.stats());
    }

    tracing::debug!(path = %shared.path, "coordinator worker stopped");
}

/// Type-erased view of a coordinator, for owners that manage collections of
/// different record types side by side.
#[async_trait]
pub trait ManagedCollection: Send + Sync {
    fn path(&self) -> &CollectionPath;

    fn state(&self) -> SyncState;

    /// Drop the live listener. See [`Coordinator::release`].
    async fn release(&self) -> bool;

    /// Drop the listener and stop the worker. See [`Coordinator::close`].
    async fn close(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<C: RecordCodec> ManagedCollection for Coordinator<C> {
    fn path(&self) -> &CollectionPath {
        Coordinator::path(self)
    }

    fn state(&self) -> SyncState {
        Coordinator::state(self)
    }

    async fn release(&self) -> bool {
        Coordinator::release(self).await
    }

    async fn close(&self) -> bool {
        Coordinator::close(self).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
