//! # Replica Core
//!
//! Pure primitives for Replica: collection paths, record keys, cached rows,
//! sync events and record codecs.
//!
//! This crate contains no I/O, no storage, no networking. Everything that
//! crosses a crate boundary in the engine is defined here.
//!
//! ## Key Types
//!
//! - [`CollectionPath`] - Hierarchical identifier of one synchronized collection
//! - [`RecordKey`] - Primary key of a record within its collection
//! - [`CachedRecord`] - A local-store row: payload plus `dirty` and `last_applied_seq`
//! - [`RemoteEvent`] / [`SequencedEvent`] - Change notifications from the remote source
//! - [`RecordCodec`] - Per-entity encode/decode/key-of capability
//!
//! ## Codecs
//!
//! Any `serde` type that implements [`Keyed`] can be synchronized with one of
//! the stock codecs, [`JsonCodec`] or [`CborCodec`].

pub mod codec;
pub mod error;
pub mod event;
pub mod path;
pub mod record;
pub mod types;

pub use codec::{CborCodec, JsonCodec, Keyed, RecordCodec};
pub use error::{CodecError, PathError, RemoteError};
pub use event::{RemoteEvent, SequencedEvent};
pub use path::CollectionPath;
pub use record::{now_millis, CachedRecord};
pub use types::{RecordKey, Seq};
