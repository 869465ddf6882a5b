//! # Replica Store
//!
//! Local store abstraction for Replica. Provides a trait-based interface for
//! the durable per-collection cache with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! The coordinator talks to the cache only through the [`LocalStore`] trait,
//! so it is storage-agnostic. The primary implementation is [`SqliteStore`],
//! with [`MemoryStore`] for testing.
//!
//! ## Key Types
//!
//! - [`LocalStore`] - The async trait for all cache operations
//! - [`SqliteStore`] - SQLite-based persistent storage, one table per collection
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replica_core::{CachedRecord, CollectionPath, RecordKey};
//! use replica_store::{LocalStore, SqliteStore};
//!
//! async fn example() {
//!     // Open a SQLite database
//!     let store = SqliteStore::open("replica.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let store = SqliteStore::open_memory().unwrap();
//!
//!     let path = CollectionPath::parse("school-42/Announcements").unwrap();
//!     let row = CachedRecord::clean(RecordKey::from("a1"), b"{}".to_vec(), 1);
//!     store.upsert_many(&path, &[row]).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Upsert by key**: writing a row whose key exists replaces it; keys are never duplicated
//! - **Atomic batches**: `upsert_many` is all-or-nothing
//! - **No network**: nothing in this crate performs remote I/O
//! - **No retries**: a failing backend surfaces the error to the caller

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{LocalStore, LocalStoreExt};
