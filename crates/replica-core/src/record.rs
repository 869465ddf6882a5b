//! Cached record rows.
//!
//! A [`CachedRecord`] is what the local store holds for one key: the encoded
//! record plus the bookkeeping the coordinator needs to reconcile it with the
//! remote source.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{RecordKey, Seq};

/// One local-store row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRecord {
    /// Primary key of the record.
    pub key: RecordKey,
    /// Encoded record, as produced by the collection's codec.
    pub payload: Bytes,
    /// True while a local write has not been confirmed by the remote.
    pub dirty: bool,
    /// Sequence number of the last change applied to this row.
    pub last_applied_seq: Seq,
    /// Local time of the last mutation (Unix ms).
    pub updated_at: i64,
}

impl CachedRecord {
    /// A row confirmed by the remote source.
    pub fn clean(key: RecordKey, payload: impl Into<Bytes>, seq: Seq) -> Self {
        Self {
            key,
            payload: payload.into(),
            dirty: false,
            last_applied_seq: seq,
            updated_at: now_millis(),
        }
    }

    /// A row written locally and not yet confirmed remotely.
    pub fn dirty(key: RecordKey, payload: impl Into<Bytes>, seq: Seq) -> Self {
        Self {
            dirty: true,
            ..Self::clean(key, payload, seq)
        }
    }

    /// Whether a change with sequence `seq` is stale for this row.
    pub fn supersedes(&self, seq: Seq) -> bool {
        self.last_applied_seq >= seq
    }
}

/// Get current time in milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
