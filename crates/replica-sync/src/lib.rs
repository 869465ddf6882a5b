//! # Replica Sync
//!
//! Keeps a local cache of remote collections consistent with a push data
//! source.
//!
//! ## Overview
//!
//! Each collection path gets one [`Coordinator`]. The coordinator owns a
//! single worker task that applies, in local sequence order, everything that
//! changes the cache: live remote events, optimistic local writes and
//! deletes, write confirmations, and refresh snapshots. Remote listeners are
//! owned by a [`ListenerRegistry`], which guarantees at most one listener per
//! path.
//!
//! ## Key Properties
//!
//! - **Ordered**: events for a collection are applied in increasing sequence order
//! - **Idempotent**: duplicate or late events never roll a row back
//! - **Remote delete wins**: `Removed` deletes a row even if a local write is pending
//! - **Optimistic writes**: local rows are visible before the remote confirms them
//! - **No retries**: remote failures are reported once and left for the caller
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica_core::{CollectionPath, JsonCodec};
//! use replica_store::MemoryStore;
//! use replica_sync::{Coordinator, CoordinatorConfig, ListenerRegistry, MemoryRemote};
//!
//! # #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! # struct Announcement { id: String }
//! # impl replica_core::Keyed for Announcement {
//! #     fn record_key(&self) -> replica_core::RecordKey { self.id.as_str().into() }
//! # }
//! async fn example() {
//!     let registry = Arc::new(ListenerRegistry::new(Arc::new(MemoryRemote::new())));
//!     let path = CollectionPath::parse("school-42/Announcements").unwrap();
//!
//!     let announcements = Coordinator::open(
//!         path,
//!         Arc::new(JsonCodec::<Announcement>::new()),
//!         Arc::new(MemoryStore::new()),
//!         registry,
//!         CoordinatorConfig::default(),
//!     )
//!     .await
//!     .unwrap();
//!
//!     // Cached rows first (if any), then the refreshed set.
//!     let mut read = announcements.read();
//!     while let Some(records) = read.next().await {
//!         println!("{} announcements", records.unwrap().len());
//!     }
//! }
//! ```
//!
//! ## Event Flow
//!
//! ```text
//! listener ──▶ Sequencer ──▶ queue ──▶ worker ──▶ LocalStore
//!                 ▲                      │
//! write/delete ───┤                      ├──▶ revision watch ──▶ LiveSnapshots
//! refresh ────────┘                      └──▶ fault broadcast
//! ```

pub mod apply;
pub mod coordinator;
pub mod error;
mod queue;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod state;

pub use apply::{Applied, ApplyStats, RefreshSummary};
pub use coordinator::{Coordinator, CoordinatorConfig, ManagedCollection};
pub use error::{CollectionFault, FaultKind, Result, SyncError};
pub use registry::{ListenerOwner, ListenerRegistry, Registration, SubscriptionHandle};
pub use remote::memory::{Faults, MemoryRemote};
pub use remote::{EventHandler, ListenerId, RemoteChannel, RemoteSource};
pub use resolver::{LiveSnapshots, ReadThrough};
pub use state::SyncState;
