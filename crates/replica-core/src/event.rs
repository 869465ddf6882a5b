//! Sync events.
//!
//! The remote source reports changes as [`RemoteEvent`]s, in whatever order
//! its transport delivers them. On receipt the coordinator stamps each one
//! with a local sequence number, producing a [`SequencedEvent`].

use bytes::Bytes;

use crate::error::RemoteError;
use crate::path::CollectionPath;
use crate::types::{RecordKey, Seq};

/// A change notification from the remote source for one collection.
///
/// `Added` and `Changed` carry the encoded record; its key is recovered
/// through the collection's codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// A record appeared.
    Added(Bytes),
    /// A record was replaced.
    Changed(Bytes),
    /// A record was deleted.
    Removed(RecordKey),
    /// The remote closed the listener. No further events follow.
    Cancelled(RemoteError),
}

impl RemoteEvent {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteEvent::Added(_) => "added",
            RemoteEvent::Changed(_) => "changed",
            RemoteEvent::Removed(_) => "removed",
            RemoteEvent::Cancelled(_) => "cancelled",
        }
    }

    /// Whether this event terminates the subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteEvent::Cancelled(_))
    }
}

/// A [`RemoteEvent`] stamped with its collection and local sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedEvent {
    /// Collection the event belongs to.
    pub path: CollectionPath,
    /// Local sequence number assigned at receipt.
    pub seq: Seq,
    /// The change itself.
    pub event: RemoteEvent,
}

impl SequencedEvent {
    /// Stamp an event.
    pub fn new(path: CollectionPath, seq: Seq, event: RemoteEvent) -> Self {
        Self { path, seq, event }
    }
}
