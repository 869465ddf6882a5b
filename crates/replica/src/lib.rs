//! # Replica
//!
//! A local-first cache reconciliation engine: keeps a durable local copy of
//! remote collections consistent with a push data source.
//!
//! ## Overview
//!
//! Replica provides:
//!
//! - **Read-through**: cached records are delivered at once, then refreshed from the remote
//! - **Dual-write**: writes land locally first, then remotely, with unconfirmed rows marked dirty
//! - **Live sync**: one listener per collection applies remote changes in sequence order
//! - **Fault reporting**: cancelled subscriptions and malformed payloads reach every observer
//!
//! ## Key Concepts
//!
//! - **Collection path**: `<tenant>/<Collection>` scope of one set of records.
//! - **Codec**: encodes, decodes and keys one record type.
//! - **Dirty row**: a local write the remote has not confirmed yet.
//! - **Remote delete wins**: a remote removal discards even unconfirmed local writes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replica::{Engine, EngineConfig};
//! use replica::core::JsonCodec;
//! use replica::store::SqliteStore;
//! use replica::sync::MemoryRemote;
//!
//! # #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! # struct Announcement { id: String, text: String }
//! # impl replica::core::Keyed for Announcement {
//! #     fn record_key(&self) -> replica::core::RecordKey { self.id.as_str().into() }
//! # }
//! async fn example() {
//!     // Open storage
//!     let store = SqliteStore::open("replica.db").unwrap();
//!
//!     // Create the engine over a remote source
//!     let engine = Engine::new(store, Arc::new(MemoryRemote::new()), EngineConfig::default());
//!
//!     // Open a collection
//!     let announcements = engine
//!         .open_collection("school-42/Announcements", JsonCodec::<Announcement>::new())
//!         .await
//!         .unwrap();
//!
//!     // Write through
//!     announcements
//!         .write(&Announcement { id: "a1".into(), text: "Closed on Friday".into() })
//!         .await
//!         .unwrap();
//!
//!     // Read through: cached set first, refreshed set second
//!     let mut read = announcements.read();
//!     while let Some(records) = read.next().await {
//!         println!("{} announcements", records.unwrap().len());
//!     }
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `replica::core` - Core primitives (CollectionPath, CachedRecord, codecs)
//! - `replica::store` - Local store abstraction and SQLite
//! - `replica::sync` - Remote channels, registry and coordinators

pub mod engine;
pub mod error;

// Re-export component crates
pub use replica_core as core;
pub use replica_store as store;
pub use replica_sync as sync;

// Re-export main types for convenience
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, Result};

// Re-export commonly used types
pub use replica_core::{CollectionPath, JsonCodec, CborCodec, Keyed, RecordCodec, RecordKey};
pub use replica_sync::{
    CollectionFault, Coordinator, CoordinatorConfig, FaultKind, SyncError, SyncState,
};
