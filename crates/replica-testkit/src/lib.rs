//! # Replica Testkit
//!
//! Testing utilities for Replica.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: sample record types and a [`TestFixture`](fixtures::TestFixture)
//!   wiring a memory store, a memory remote and an engine together
//! - **Generators**: proptest strategies for records and remote change scripts
//! - **Faults**: a store wrapper that fails on demand
//!
//! ## Fixtures
//!
//! ```rust,no_run
//! use replica_testkit::fixtures::{announcement, TestFixture};
//!
//! async fn example() {
//!     let fx = TestFixture::new();
//!     fx.seed_remote_announcements(&[announcement("a1", "Welcome back")]);
//!
//!     let announcements = fx.announcements().await;
//!     let deliveries = announcements.read().collect_all().await.unwrap();
//!     assert_eq!(deliveries.len(), 1);
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use replica_testkit::generators::remote_script;
//!
//! proptest! {
//!     #[test]
//!     fn cache_converges(script in remote_script(20)) {
//!         // apply the script to a MemoryRemote and compare
//!     }
//! }
//! ```

pub mod faults;
pub mod fixtures;
pub mod generators;

pub use faults::FailingStore;
pub use fixtures::{init_tracing, TestFixture};
