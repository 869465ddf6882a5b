//! The per-collection command queue.
//!
//! Every mutation of a collection's cache travels through one unbounded
//! channel consumed by a single worker task. The [`Sequencer`] stamps each
//! command with the next local sequence number and pushes it under the same
//! lock, so queue order and sequence order can never disagree.

use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use replica_core::{CollectionPath, RecordKey, RemoteEvent, Seq, SequencedEvent};

use crate::apply::{RefreshSummary, RefreshTicket};
use crate::error::Result;

/// Work for the collection's worker.
pub(crate) enum Command {
    /// An event from the live listener.
    Remote(SequencedEvent),
    /// Optimistic local write, stored dirty.
    LocalUpsert {
        seq: Seq,
        key: RecordKey,
        payload: Bytes,
        ack: oneshot::Sender<Result<()>>,
    },
    /// Local delete ahead of the remote delete.
    LocalDelete {
        seq: Seq,
        key: RecordKey,
        ack: oneshot::Sender<Result<bool>>,
    },
    /// The remote accepted the write stamped `seq`.
    ConfirmWrite {
        key: RecordKey,
        seq: Seq,
        ack: oneshot::Sender<Result<bool>>,
    },
    /// A one-shot fetch result. The ticket holds the last sequence number
    /// issued before the fetch started and stays pending until applied.
    Refresh {
        seq: Seq,
        ticket: RefreshTicket,
        payloads: Vec<Bytes>,
        prune: bool,
        ack: oneshot::Sender<Result<RefreshSummary>>,
    },
}

/// The worker is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueClosed;

struct SequencerInner {
    path: CollectionPath,
    last: Seq,
    /// `None` once closed.
    tx: Option<mpsc::UnboundedSender<Command>>,
}

impl SequencerInner {
    fn send(&self, command: Command) -> std::result::Result<(), QueueClosed> {
        match &self.tx {
            Some(tx) => tx.send(command).map_err(|_| QueueClosed),
            None => Err(QueueClosed),
        }
    }
}

/// Assigns sequence numbers and enqueues commands atomically.
pub(crate) struct Sequencer {
    inner: Mutex<SequencerInner>,
}

impl Sequencer {
    /// Create a sequencer for `path` whose first assigned number is `last + 1`.
    pub fn new(path: CollectionPath, last: Seq) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sequencer = Self {
            inner: Mutex::new(SequencerInner {
                path,
                last,
                tx: Some(tx),
            }),
        };
        (sequencer, rx)
    }

    /// Stamp and enqueue a command built from the next sequence number.
    pub fn submit(&self, build: impl FnOnce(Seq) -> Command) -> std::result::Result<Seq, QueueClosed> {
        let mut inner = self.inner.lock().map_err(|_| QueueClosed)?;
        let seq = inner.last + 1;
        if inner.tx.is_none() {
            return Err(QueueClosed);
        }
        let command = build(seq);
        inner.send(command)?;
        inner.last = seq;
        Ok(seq)
    }

    /// Enqueue a command that does not consume a sequence number.
    pub fn submit_unsequenced(&self, command: Command) -> std::result::Result<(), QueueClosed> {
        let inner = self.inner.lock().map_err(|_| QueueClosed)?;
        inner.send(command)
    }

    /// Stamp and enqueue a remote event. Called from the listener's delivery path.
    pub fn push_remote(&self, event: RemoteEvent) -> std::result::Result<Seq, QueueClosed> {
        let mut inner = self.inner.lock().map_err(|_| QueueClosed)?;
        let seq = inner.last + 1;
        let stamped = SequencedEvent::new(inner.path.clone(), seq, event);
        inner.send(Command::Remote(stamped))?;
        inner.last = seq;
        Ok(seq)
    }

    /// The last sequence number handed out.
    pub fn current(&self) -> Seq {
        self.inner.lock().map(|i| i.last).unwrap_or(0)
    }

    /// Stop accepting commands. The worker drains what is already queued
    /// and then stops.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.tx.take().is_some() {
                tracing::debug!(path = %inner.path, last_seq = inner.last, "sequencer closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|i| i.tx.is_none()).unwrap_or(true)
    }
}
