//! Error types for the sync module.

use thiserror::Error;

use replica_core::{CodecError, CollectionPath, RecordKey, RemoteError, Seq};
use replica_store::StoreError;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The local store failed. Fatal to the operation, never retried.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),

    /// The remote rejected a write. The optimistic local row stays, marked dirty.
    #[error("remote write failed for key {key}: {reason}")]
    RemoteWriteFailed { key: RecordKey, reason: RemoteError },

    /// The remote rejected a delete. The row stays deleted locally.
    #[error("remote delete failed for key {key}: {reason}")]
    RemoteDeleteFailed { key: RecordKey, reason: RemoteError },

    /// A one-shot fetch failed.
    #[error("remote fetch failed: {0}")]
    RemoteFetchFailed(RemoteError),

    /// Registering the live listener failed.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(RemoteError),

    /// The live listener was cancelled by the remote; the collection is degraded.
    #[error("subscription to {path} cancelled: {reason}")]
    RemoteSubscriptionCancelled {
        path: CollectionPath,
        reason: RemoteError,
    },

    /// A stored or received payload could not be decoded.
    #[error("malformed record: {0}")]
    MalformedRecord(CodecError),

    /// A record could not be encoded for writing.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The coordinator's worker has stopped.
    #[error("coordinator for {0} is closed")]
    Closed(CollectionPath),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// What went wrong on a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// The remote cancelled the listener.
    SubscriptionCancelled(RemoteError),
    /// An event payload failed to decode and was skipped.
    MalformedRecord(CodecError),
    /// The local store failed while applying an event.
    StorageFailure(String),
}

/// A failure on a live subscription, broadcast to every error observer of
/// the collection since no single caller owns the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionFault {
    /// The affected collection.
    pub path: CollectionPath,
    /// Sequence number of the event that caused the fault, if any.
    pub seq: Option<Seq>,
    /// The failure.
    pub kind: FaultKind,
}

impl From<CollectionFault> for SyncError {
    fn from(fault: CollectionFault) -> Self {
        match fault.kind {
            FaultKind::SubscriptionCancelled(reason) => SyncError::RemoteSubscriptionCancelled {
                path: fault.path,
                reason,
            },
            FaultKind::MalformedRecord(err) => SyncError::MalformedRecord(err),
            FaultKind::StorageFailure(msg) => {
                SyncError::StorageUnavailable(StoreError::Unavailable(msg))
            }
        }
    }
}
