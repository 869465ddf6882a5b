//! The Engine: application-wide owner of every synchronized collection.
//!
//! The Engine holds the local store, the listener registry over the remote
//! source, and one coordinator per open collection path. Collections of
//! different record types live side by side; each path is bound to the codec
//! it was first opened with.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use replica_core::{CollectionPath, RecordCodec};
use replica_store::LocalStore;
use replica_sync::{
    Coordinator, CoordinatorConfig, ListenerRegistry, ManagedCollection, RemoteSource, SyncState,
};

use crate::error::{EngineError, Result};

/// Configuration for the Engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Applied to every collection the engine opens.
    pub coordinator: CoordinatorConfig,
}

impl EngineConfig {
    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }
}

/// The main Engine struct.
///
/// Provides a unified entry point for:
/// - Opening collections by path, one coordinator per path
/// - Releasing individual live subscriptions
/// - Tearing every subscription down on shutdown
pub struct Engine<S: LocalStore + 'static> {
    /// The durable cache, shared by every collection.
    store: Arc<S>,
    /// Live listeners over the remote source.
    registry: Arc<ListenerRegistry>,
    /// Configuration.
    config: EngineConfig,
    /// Open collections.
    collections: Mutex<HashMap<CollectionPath, Box<dyn ManagedCollection>>>,
}

impl<S: LocalStore + 'static> Engine<S> {
    /// Create an engine over a store and a remote source.
    pub fn new(store: S, source: Arc<dyn RemoteSource>, config: EngineConfig) -> Self {
        Self::with_shared_store(Arc::new(store), source, config)
    }

    /// Create an engine over a store the caller keeps a handle to.
    pub fn with_shared_store(store: Arc<S>, source: Arc<dyn RemoteSource>, config: EngineConfig) -> Self {
        Self {
            store,
            registry: Arc::new(ListenerRegistry::new(source)),
            config,
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Get the store reference.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the listener registry.
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Collections
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the coordinator of `path`, opening it with `codec` on first use.
    ///
    /// Later calls return the same coordinator and ignore `codec`, but fail
    /// with [`EngineError::CodecMismatch`] if the path was opened with a
    /// different codec type.
    pub async fn collection<C: RecordCodec>(&self, path: &CollectionPath, codec: C) -> Result<Coordinator<C>> {
        let mut collections = self.collections.lock().await;

        if let Some(existing) = collections.get(path) {
            return existing
                .as_any()
                .downcast_ref::<Coordinator<C>>()
                .cloned()
                .ok_or_else(|| EngineError::CodecMismatch {
                    path: path.clone(),
                    requested: std::any::type_name::<C>(),
                });
        }

        let store: Arc<dyn LocalStore> = self.store.clone();
        let coordinator = Coordinator::open(
            path.clone(),
            Arc::new(codec),
            store,
            Arc::clone(&self.registry),
            self.config.coordinator.clone(),
        )
        .await?;

        collections.insert(path.clone(), Box::new(coordinator.clone()));
        tracing::info!(path = %path, "collection opened");
        Ok(coordinator)
    }

    /// [`collection`](Self::collection) with a path given as a string.
    pub async fn open_collection<C: RecordCodec>(&self, path: &str, codec: C) -> Result<Coordinator<C>> {
        let path = CollectionPath::parse(path)?;
        self.collection(&path, codec).await
    }

    /// Release the live subscription of `path`. The collection stays open and
    /// resubscribes on its next read. Returns whether a listener was removed.
    pub async fn release(&self, path: &CollectionPath) -> bool {
        let collections = self.collections.lock().await;
        match collections.get(path) {
            Some(collection) => collection.release().await,
            None => false,
        }
    }

    /// Paths of every open collection, sorted.
    pub async fn collections(&self) -> Vec<CollectionPath> {
        let mut paths: Vec<CollectionPath> = self.collections.lock().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Lifecycle state of an open collection.
    pub async fn state(&self, path: &CollectionPath) -> Option<SyncState> {
        self.collections.lock().await.get(path).map(|c| c.state())
    }

    /// Paths of every collection with cached rows, open or not.
    pub async fn cached_collections(&self) -> Result<Vec<CollectionPath>> {
        Ok(self.store.list_collections().await?)
    }

    /// Close every collection and forget it.
    ///
    /// Handles held by callers keep serving cached reads; subscribing,
    /// writing and refreshing through them fail with `SyncError::Closed`.
    /// The engine can be used again afterwards and opens fresh coordinators.
    pub async fn shutdown(&self) {
        let drained: Vec<Box<dyn ManagedCollection>> =
            self.collections.lock().await.drain().map(|(_, c)| c).collect();

        for collection in &drained {
            collection.close().await;
        }
        let stragglers = self.registry.unregister_all().await;

        tracing::info!(collections = drained.len(), stragglers, "engine shut down");
    }
}
