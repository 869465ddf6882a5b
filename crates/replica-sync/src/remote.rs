//! Remote channel abstraction.
//!
//! A remote channel is the engine's view of the push data source for one
//! collection path: a one-shot fetch, a continuous listener, and keyed
//! writes/deletes. Implementations may wrap a realtime database SDK, a
//! websocket feed, or anything else that can honor the event contract.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use replica_core::{CollectionPath, RecordKey, RemoteError, RemoteEvent};

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Callback receiving every event of a live listener.
///
/// Handlers are invoked on the transport's delivery path and must neither
/// block nor call back into the channel.
pub type EventHandler = Arc<dyn Fn(RemoteEvent) + Send + Sync>;

/// Identifier of one listener registered on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Push data source for one collection path.
///
/// Implementations must be thread-safe (Send + Sync). Failures are reported
/// once through the returned `Result`; channels never retry.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// The collection this channel serves.
    fn path(&self) -> &CollectionPath;

    /// Read the whole collection once, without subscribing.
    async fn fetch_once(&self) -> Result<Vec<Bytes>>;

    /// Register a continuous listener.
    ///
    /// `handler` receives every event for the path in the order the
    /// transport delivers them, which need not match upstream commit order.
    async fn subscribe(&self, handler: EventHandler) -> Result<ListenerId>;

    /// Remove a listener. Best-effort: events already in flight may still
    /// reach the handler afterwards.
    async fn unsubscribe(&self, listener: ListenerId);

    /// Upsert a record remotely.
    async fn write_by_key(&self, key: &RecordKey, payload: Bytes) -> Result<()>;

    /// Delete a record remotely.
    async fn delete_by_key(&self, key: &RecordKey) -> Result<()>;
}

/// Hands out a [`RemoteChannel`] per collection path.
pub trait RemoteSource: Send + Sync {
    /// Get the channel for a path.
    fn channel(&self, path: &CollectionPath) -> Arc<dyn RemoteChannel>;
}

/// An in-memory remote source for testing.
///
/// Behaves like a realtime database tree: each path holds keyed payloads,
/// listeners see existing children replayed as `Added` when they subscribe,
/// and every write is echoed to every listener of the path, including the
/// writer's own. Faults can be injected per operation kind.
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Mutex, MutexGuard};
    use std::time::Duration;

    /// Injected failures. `None` means the operation succeeds.
    #[derive(Debug, Clone, Default)]
    pub struct Faults {
        pub fetch: Option<RemoteError>,
        pub write: Option<RemoteError>,
        pub delete: Option<RemoteError>,
        pub subscribe: Option<RemoteError>,
        /// Delay applied to every fetch before it answers.
        pub fetch_delay: Option<Duration>,
    }

    #[derive(Default)]
    struct Tree {
        /// Records per collection.
        collections: HashMap<CollectionPath, BTreeMap<RecordKey, Bytes>>,
        /// Live listeners per collection.
        listeners: HashMap<CollectionPath, Vec<(ListenerId, EventHandler)>>,
        faults: Faults,
        fetches: u64,
    }

    struct Shared {
        tree: Mutex<Tree>,
        next_listener: AtomicU64,
    }

    /// Shared state for the in-memory remote. Cheap to clone.
    #[derive(Clone)]
    pub struct MemoryRemote {
        shared: Arc<Shared>,
    }

    impl MemoryRemote {
        /// Create an empty remote.
        pub fn new() -> Self {
            Self {
                shared: Arc::new(Shared {
                    tree: Mutex::new(Tree::default()),
                    next_listener: AtomicU64::new(1),
                }),
            }
        }

        fn tree(&self) -> Result<MutexGuard<'_, Tree>> {
            lock(&self.shared)
        }

        /// Replace the injected faults.
        pub fn set_faults(&self, faults: Faults) {
            if let Ok(mut tree) = self.tree() {
                tree.faults = faults;
            }
        }

        /// Clear every injected fault.
        pub fn heal(&self) {
            self.set_faults(Faults::default());
        }

        /// Upsert a record as another client would, notifying listeners.
        pub fn put(&self, path: &CollectionPath, key: &RecordKey, payload: impl Into<Bytes>) {
            if let Ok(mut tree) = self.tree() {
                put_locked(&mut tree, path, key, payload.into());
            }
        }

        /// Delete a record as another client would, notifying listeners.
        pub fn remove(&self, path: &CollectionPath, key: &RecordKey) {
            if let Ok(mut tree) = self.tree() {
                remove_locked(&mut tree, path, key);
            }
        }

        /// Deliver a raw event to every listener of a path without touching
        /// the stored records. Useful for duplicate, late, or malformed deliveries.
        pub fn emit(&self, path: &CollectionPath, event: RemoteEvent) {
            if let Ok(tree) = self.tree() {
                notify(&tree, path, &event);
            }
        }

        /// Cancel every listener of a path with the given error.
        pub fn cancel(&self, path: &CollectionPath, error: RemoteError) {
            if let Ok(mut tree) = self.tree() {
                let event = RemoteEvent::Cancelled(error);
                notify(&tree, path, &event);
                tree.listeners.remove(path);
            }
        }

        /// Number of live listeners on a path.
        pub fn listener_count(&self, path: &CollectionPath) -> usize {
            self.tree()
                .map(|t| t.listeners.get(path).map(Vec::len).unwrap_or(0))
                .unwrap_or(0)
        }

        /// Stored payloads of a path, ordered by key.
        pub fn records(&self, path: &CollectionPath) -> Vec<(RecordKey, Bytes)> {
            self.tree()
                .map(|t| {
                    t.collections
                        .get(path)
                        .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                        .unwrap_or_default()
                })
                .unwrap_or_default()
        }

        /// Number of one-shot fetches served so far.
        pub fn fetch_count(&self) -> u64 {
            self.tree().map(|t| t.fetches).unwrap_or(0)
        }
    }

    impl Default for MemoryRemote {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RemoteSource for MemoryRemote {
        fn channel(&self, path: &CollectionPath) -> Arc<dyn RemoteChannel> {
            Arc::new(MemoryChannel {
                path: path.clone(),
                shared: Arc::clone(&self.shared),
            })
        }
    }

    fn lock(shared: &Shared) -> Result<MutexGuard<'_, Tree>> {
        shared
            .tree
            .lock()
            .map_err(|_| RemoteError::Unavailable("remote tree poisoned".into()))
    }

    fn notify(tree: &Tree, path: &CollectionPath, event: &RemoteEvent) {
        if let Some(listeners) = tree.listeners.get(path) {
            for (_, handler) in listeners {
                handler(event.clone());
            }
        }
    }

    fn put_locked(tree: &mut Tree, path: &CollectionPath, key: &RecordKey, payload: Bytes) {
        let previous = tree
            .collections
            .entry(path.clone())
            .or_default()
            .insert(key.clone(), payload.clone());

        let event = match previous {
            Some(_) => RemoteEvent::Changed(payload),
            None => RemoteEvent::Added(payload),
        };
        notify(tree, path, &event);
    }

    fn remove_locked(tree: &mut Tree, path: &CollectionPath, key: &RecordKey) {
        let removed = tree
            .collections
            .get_mut(path)
            .and_then(|c| c.remove(key))
            .is_some();

        if removed {
            notify(tree, path, &RemoteEvent::Removed(key.clone()));
        }
    }

    /// Channel onto one path of a [`MemoryRemote`].
    pub struct MemoryChannel {
        path: CollectionPath,
        shared: Arc<Shared>,
    }

    #[async_trait]
    impl RemoteChannel for MemoryChannel {
        fn path(&self) -> &CollectionPath {
            &self.path
        }

        async fn fetch_once(&self) -> Result<Vec<Bytes>> {
            let delay = {
                let mut tree = lock(&self.shared)?;
                tree.fetches += 1;
                if let Some(err) = tree.faults.fetch.clone() {
                    return Err(err);
                }
                tree.faults.fetch_delay
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let tree = lock(&self.shared)?;
            Ok(tree
                .collections
                .get(&self.path)
                .map(|c| c.values().cloned().collect())
                .unwrap_or_default())
        }

        async fn subscribe(&self, handler: EventHandler) -> Result<ListenerId> {
            let mut tree = lock(&self.shared)?;
            if let Some(err) = tree.faults.subscribe.clone() {
                return Err(err);
            }

            let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::SeqCst));

            // Existing children are replayed before any later change can be seen.
            if let Some(records) = tree.collections.get(&self.path) {
                for payload in records.values() {
                    handler(RemoteEvent::Added(payload.clone()));
                }
            }

            tree.listeners
                .entry(self.path.clone())
                .or_default()
                .push((id, handler));

            Ok(id)
        }

        async fn unsubscribe(&self, listener: ListenerId) {
            if let Ok(mut tree) = lock(&self.shared) {
                if let Some(listeners) = tree.listeners.get_mut(&self.path) {
                    listeners.retain(|(id, _)| *id != listener);
                    if listeners.is_empty() {
                        tree.listeners.remove(&self.path);
                    }
                }
            }
        }

        async fn write_by_key(&self, key: &RecordKey, payload: Bytes) -> Result<()> {
            let mut tree = lock(&self.shared)?;
            if let Some(err) = tree.faults.write.clone() {
                return Err(err);
            }
            put_locked(&mut tree, &self.path, key, payload);
            Ok(())
        }

        async fn delete_by_key(&self, key: &RecordKey) -> Result<()> {
            let mut tree = lock(&self.shared)?;
            if let Some(err) = tree.faults.delete.clone() {
                return Err(err);
            }
            remove_locked(&mut tree, &self.path, key);
            Ok(())
        }
    }
}
