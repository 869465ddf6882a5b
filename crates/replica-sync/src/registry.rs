//! Listener registry: at most one live remote subscription per collection path.
//!
//! The registry owns every remote-side listener the engine creates. It is an
//! explicit object rather than process-wide state, and tearing it down with
//! [`ListenerRegistry::unregister_all`] releases every listener at shutdown.
//!
//! Every entry remembers the [`ListenerOwner`] that created it. An entry
//! whose owner has been dropped, or that belongs to another owner, is torn
//! down and replaced when the path is registered again, so a listener never
//! outlives the coordinator it feeds.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;

use replica_core::{CollectionPath, RemoteError};

use crate::remote::{EventHandler, ListenerId, RemoteChannel, RemoteSource};

/// Identifies one active registration.
///
/// A handle stays comparable after it is invalidated; use
/// [`ListenerRegistry::is_active`] to check whether it still owns a listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    path: CollectionPath,
    listener: ListenerId,
}

impl SubscriptionHandle {
    /// The subscribed collection.
    pub fn path(&self) -> &CollectionPath {
        &self.path
    }

    /// The remote-side listener this handle owns.
    pub fn listener(&self) -> ListenerId {
        self.listener
    }
}

/// Outcome of [`ListenerRegistry::register_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// A new remote listener was created.
    Created(SubscriptionHandle),
    /// The path was already subscribed; no listener was created.
    Existing(SubscriptionHandle),
}

impl Registration {
    pub fn handle(&self) -> &SubscriptionHandle {
        match self {
            Registration::Created(h) | Registration::Existing(h) => h,
        }
    }

    pub fn into_handle(self) -> SubscriptionHandle {
        match self {
            Registration::Created(h) | Registration::Existing(h) => h,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

/// Identity of the party a registration feeds.
///
/// Clones share one identity. When every clone is dropped, registrations
/// made with it become stale.
#[derive(Debug, Clone, Default)]
pub struct ListenerOwner(Arc<()>);

impl ListenerOwner {
    pub fn new() -> Self {
        Self::default()
    }
}

struct Entry {
    handle: SubscriptionHandle,
    channel: Arc<dyn RemoteChannel>,
    owner: Weak<()>,
}

impl Entry {
    fn owned_by(&self, owner: &ListenerOwner) -> bool {
        Weak::ptr_eq(&self.owner, &Arc::downgrade(&owner.0))
    }

    fn is_orphaned(&self) -> bool {
        self.owner.strong_count() == 0
    }

    async fn teardown(self) {
        self.channel.unsubscribe(self.handle.listener).await;
    }
}

/// Registry of live subscriptions, keyed by collection path.
pub struct ListenerRegistry {
    source: Arc<dyn RemoteSource>,
    entries: Mutex<HashMap<CollectionPath, Entry>>,
}

impl ListenerRegistry {
    /// Create an empty registry over a remote source.
    pub fn new(source: Arc<dyn RemoteSource>) -> Self {
        Self {
            source,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The remote source listeners are created on.
    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    /// Subscribe `path` for `owner` unless `owner` already holds its listener.
    ///
    /// The registry lock is held across the remote registration, so two
    /// concurrent calls for the same path create exactly one listener. When
    /// the path is already subscribed by `owner`, `handler` is dropped unused.
    /// A listener held by a dropped or different owner is replaced.
    pub async fn register_if_absent(
        &self,
        path: &CollectionPath,
        owner: &ListenerOwner,
        handler: EventHandler,
    ) -> Result<Registration, RemoteError> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(path) {
            if entry.owned_by(owner) {
                return Ok(Registration::Existing(entry.handle.clone()));
            }
        }
        if let Some(stale) = entries.remove(path) {
            tracing::info!(
                path = %path,
                listener = %stale.handle.listener,
                orphaned = stale.is_orphaned(),
                "replacing listener of another owner"
            );
            stale.teardown().await;
        }

        let channel = self.source.channel(path);
        let listener = channel.subscribe(handler).await?;
        let handle = SubscriptionHandle {
            path: path.clone(),
            listener,
        };

        tracing::info!(path = %path, %listener, "remote listener registered");
        entries.insert(
            path.clone(),
            Entry {
                handle: handle.clone(),
                channel,
                owner: Arc::downgrade(&owner.0),
            },
        );

        Ok(Registration::Created(handle))
    }

    /// Tear down the subscription of `path`. Returns whether one existed.
    pub async fn unregister(&self, path: &CollectionPath) -> bool {
        let entry = self.entries.lock().await.remove(path);
        match entry {
            Some(entry) => {
                tracing::info!(path = %path, listener = %entry.handle.listener, "remote listener removed");
                entry.teardown().await;
                true
            }
            None => false,
        }
    }

    /// Tear down the subscription of `path` only if `owner` holds it.
    pub async fn unregister_owned(&self, path: &CollectionPath, owner: &ListenerOwner) -> bool {
        let entry = {
            let mut entries = self.entries.lock().await;
            let owned = entries.get(path).map(|e| e.owned_by(owner)).unwrap_or(false);
            if owned {
                entries.remove(path)
            } else {
                None
            }
        };
        match entry {
            Some(entry) => {
                tracing::info!(path = %path, listener = %entry.handle.listener, "remote listener removed");
                entry.teardown().await;
                true
            }
            None => false,
        }
    }

    /// Tear down every listener whose owner has been dropped.
    pub async fn prune_orphans(&self) -> usize {
        let orphans: Vec<Entry> = {
            let mut entries = self.entries.lock().await;
            let paths: Vec<CollectionPath> = entries
                .iter()
                .filter(|(_, e)| e.is_orphaned())
                .map(|(p, _)| p.clone())
                .collect();
            paths.iter().filter_map(|p| entries.remove(p)).collect()
        };
        let count = orphans.len();
        for entry in orphans {
            entry.teardown().await;
        }
        if count > 0 {
            tracing::info!(count, "orphaned remote listeners removed");
        }
        count
    }

    /// Tear down every subscription. Returns how many were removed.
    pub async fn unregister_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries.lock().await.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            entry.teardown().await;
        }
        if count > 0 {
            tracing::info!(count, "all remote listeners removed");
        }
        count
    }

    /// Whether `handle` still owns the live subscription of its path.
    pub async fn is_active(&self, handle: &SubscriptionHandle) -> bool {
        self.entries
            .lock()
            .await
            .get(&handle.path)
            .map(|e| e.handle == *handle)
            .unwrap_or(false)
    }

    /// The live handle of a path, if subscribed.
    pub async fn handle(&self, path: &CollectionPath) -> Option<SubscriptionHandle> {
        self.entries.lock().await.get(path).map(|e| e.handle.clone())
    }

    /// Number of live subscriptions.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
