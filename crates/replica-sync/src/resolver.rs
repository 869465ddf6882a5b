//! Read-through resolution.
//!
//! A read delivers what the cache already holds, then what the remote says.
//! Callers therefore see up to two record sets per request:
//!
//! 1. the cached snapshot, immediately, when it is not empty;
//! 2. the snapshot after a refresh from the remote.
//!
//! When the cache is empty only the second delivery happens, and it is an
//! empty set when the remote is empty or unreachable. A failed refresh with
//! a non-empty cache produces no second delivery.
//!
//! Remote failures never fail a read. A local store failure does: it is
//! delivered as the final `Err` of the stream.

use tokio::sync::{mpsc, watch};

use replica_core::RecordCodec;

use crate::coordinator::Coordinator;
use crate::error::{Result, SyncError};

/// The record sets produced by one read-through request.
///
/// The stream ends after its last delivery or after an error.
pub struct ReadThrough<R> {
    rx: mpsc::Receiver<Result<Vec<R>>>,
}

impl<R> ReadThrough<R> {
    /// Wait for the next delivery. `None` once the read is complete.
    pub async fn next(&mut self) -> Option<Result<Vec<R>>> {
        self.rx.recv().await
    }

    /// Wait for every delivery, stopping at the first error.
    pub async fn collect_all(mut self) -> Result<Vec<Vec<R>>> {
        let mut deliveries = Vec::new();
        while let Some(records) = self.rx.recv().await {
            deliveries.push(records?);
        }
        Ok(deliveries)
    }
}

/// A live view of a collection: the current snapshot, then a fresh snapshot
/// after every applied change. Changes that land while the caller is busy are
/// coalesced into one delivery.
pub struct LiveSnapshots<C: RecordCodec> {
    coordinator: Coordinator<C>,
    changes: watch::Receiver<u64>,
    primed: bool,
}

impl<C: RecordCodec> LiveSnapshots<C> {
    /// Wait for the next snapshot.
    pub async fn next(&mut self) -> Result<Vec<C::Record>> {
        if self.primed {
            // The coordinator keeps the sender alive for as long as we hold it.
            let _ = self.changes.changed().await;
        }
        self.primed = true;
        let _ = self.changes.borrow_and_update();
        self.coordinator.snapshot().await
    }
}

impl<C: RecordCodec> Coordinator<C> {
    /// Read the collection through the cache.
    ///
    /// Ensures a live subscription as a side effect. Must be called within a
    /// tokio runtime.
    pub fn read(&self) -> ReadThrough<C::Record> {
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(self.clone().resolve(tx));
        ReadThrough { rx }
    }

    async fn resolve(self, tx: mpsc::Sender<Result<Vec<C::Record>>>) {
        let cached = match self.snapshot().await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(path = %self.path(), error = %err, "cache read failed");
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        let had_cache = !cached.is_empty();
        if had_cache && tx.send(Ok(cached)).await.is_err() {
            return;
        }

        if let Err(err) = self.ensure_subscribed().await {
            tracing::warn!(path = %self.path(), error = %err, "read continues without a live subscription");
        }

        let fresh = if self.config().refresh_on_read {
            match self.refresh().await {
                Ok(_) => Some(self.snapshot().await),
                Err(err @ SyncError::StorageUnavailable(_)) => Some(Err(err)),
                Err(err) => {
                    tracing::warn!(path = %self.path(), error = %err, "refresh failed");
                    None
                }
            }
        } else {
            None
        };

        let delivery = match fresh {
            Some(Err(err)) => {
                tracing::warn!(path = %self.path(), error = %err, "cache update failed");
                Err(err)
            }
            Some(Ok(records)) => Ok(records),
            None if !had_cache => Ok(Vec::new()),
            None => return,
        };
        let _ = tx.send(delivery).await;
    }

    /// Observe the collection continuously.
    ///
    /// Ensures a live subscription first; a degraded collection still yields
    /// cache snapshots.
    pub async fn subscribe(&self) -> Result<LiveSnapshots<C>> {
        self.ensure_subscribed().await?;
        Ok(LiveSnapshots {
            coordinator: self.clone(),
            changes: self.changes(),
            primed: false,
        })
    }
}
