//! Error types for Replica Core.

use thiserror::Error;

/// Errors produced when parsing a collection path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("collection path is empty")]
    Empty,

    #[error("collection path {0:?} contains an empty segment")]
    EmptySegment(String),

    #[error("collection path {0:?} contains a control character")]
    ControlCharacter(String),
}

/// Errors produced by a [`RecordCodec`](crate::RecordCodec).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("encoding error: {0}")]
    Encode(String),

    #[error("decoding error: {0}")]
    Decode(String),

    #[error("record key is empty")]
    EmptyKey,
}

/// Failure reported by a remote data source.
///
/// Cloneable so it can travel inside [`RemoteEvent::Cancelled`](crate::RemoteEvent)
/// and be broadcast to several observers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The remote could not be reached or refused the operation.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The remote rejected the caller.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The remote did not answer within the configured bound.
    #[error("remote operation timed out")]
    TimedOut,

    /// The remote closed a live listener.
    #[error("listener cancelled: {0}")]
    Cancelled(String),
}
