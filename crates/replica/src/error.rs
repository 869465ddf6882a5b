//! Error types for the Engine.

use replica_core::{CollectionPath, PathError};
use replica_store::StoreError;
use replica_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during Engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid collection path.
    #[error("invalid collection path: {0}")]
    Path(#[from] PathError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The collection is already open with a different codec.
    #[error("collection {path} is open with a codec other than {requested}")]
    CodecMismatch {
        path: CollectionPath,
        requested: &'static str,
    },
}

/// Result type for Engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
