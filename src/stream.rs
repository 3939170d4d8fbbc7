// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication event stream.
//!
//! The replication collaborator reports progress by callbacks, possibly from
//! several tasks at once. The session manager wants a single ordered,
//! cancellable sequence it can pull from. This module sits in between:
//!
//! ```text
//!   collaborator callbacks          mailbox (bounded)         session loop
//!   ─────────────────────           ─────────────────         ────────────
//!   sink.post(Change)  ──┐
//!   sink.post(Paused)  ──┼──► lock ──► [e1, e2, e3 ...] ──► stream.next().await
//!   sink.post(Finally) ──┘     (one writer at a time)
//! ```
//!
//! # Ending
//!
//! [`ReplicationEventStream::next`] returns `None` when the cancel token
//! fires, when every [`EventSink`] clone has been dropped, or on the call
//! after `Finally` was yielded. Once ended (or dropped) the stream releases:
//! the replication handle is cancelled exactly once and the mailbox is
//! closed so that further posts are discarded.
//!
//! # Back-pressure
//!
//! The mailbox holds [`MAILBOX_CAPACITY`] events. A post into a full mailbox
//! waits for the consumer rather than dropping the event.

use crate::model::RawDocument;
use crate::store::ReplicationHandle;
use futures::stream::{self, Stream};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Events buffered between the collaborator and the session loop.
pub const MAILBOX_CAPACITY: usize = 10_000;

/// Transfer direction of a change batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Pull,
    Push,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Pull => write!(f, "pull"),
            Direction::Push => write!(f, "push"),
        }
    }
}

/// Documents transferred in one step.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    /// Present for bidirectional replications; one-way replications leave
    /// it to the session's mode.
    pub direction: Option<Direction>,
    pub docs: Vec<RawDocument>,
    /// Sequence reached by this batch (string or number).
    pub last_seq: Value,
}

/// Failure detail attached to error-like events.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransferFailure {
    /// HTTP-like status, when the transport reported one.
    pub status: Option<u16>,
    pub message: String,
}

impl TransferFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

/// One progress notification from a replication.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    Change(ChangeBatch),
    Active,
    Complete,
    Error(TransferFailure),
    Denied(TransferFailure),
    Paused(Option<TransferFailure>),
    /// The replication has settled; nothing follows.
    Finally,
}

impl ReplicationEvent {
    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationEvent::Change(_) => "change",
            ReplicationEvent::Active => "active",
            ReplicationEvent::Complete => "complete",
            ReplicationEvent::Error(_) => "error",
            ReplicationEvent::Denied(_) => "denied",
            ReplicationEvent::Paused(_) => "paused",
            ReplicationEvent::Finally => "finally",
        }
    }
}

/// Create a mailbox: the sink handed to the collaborator and the receiver
/// that backs a [`ReplicationEventStream`].
pub fn mailbox() -> (EventSink, mpsc::Receiver<ReplicationEvent>) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    (
        EventSink {
            tx: Arc::new(Mutex::new(tx)),
        },
        rx,
    )
}

/// Writer side of the mailbox. Cheap to clone; all clones share one lock.
#[derive(Clone)]
pub struct EventSink {
    tx: Arc<Mutex<mpsc::Sender<ReplicationEvent>>>,
}

impl EventSink {
    /// Insert an event. Concurrent posts are applied one at a time.
    ///
    /// Returns `false` if the mailbox has been closed; the event is dropped.
    pub async fn post(&self, event: ReplicationEvent) -> bool {
        let tx = self.tx.lock().await;
        let kind = event.kind();
        match tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                trace!(kind, "Mailbox closed, event discarded");
                false
            }
        }
    }

    /// Check if the consumer side has gone away.
    pub async fn is_closed(&self) -> bool {
        self.tx.lock().await.is_closed()
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Ordered, cancellable pull sequence over a replication's events.
pub struct ReplicationEventStream {
    rx: mpsc::Receiver<ReplicationEvent>,
    handle: Option<Box<dyn ReplicationHandle>>,
    cancel: CancellationToken,
    settled: bool,
}

impl ReplicationEventStream {
    pub fn new(
        rx: mpsc::Receiver<ReplicationEvent>,
        handle: Box<dyn ReplicationHandle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            handle: Some(handle),
            cancel,
            settled: false,
        }
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ReplicationEvent> {
        if self.settled || self.handle.is_none() {
            self.release();
            return None;
        }

        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        };

        match event {
            Some(ReplicationEvent::Finally) => {
                self.settled = true;
                Some(ReplicationEvent::Finally)
            }
            Some(event) => Some(event),
            None => {
                self.release();
                None
            }
        }
    }

    /// Cancel the handle (once) and close the mailbox.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
        self.rx.close();
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = ReplicationEvent> + Send {
        stream::unfold(self, |mut s| async move { s.next().await.map(|event| (event, s)) })
    }
}

impl Drop for ReplicationEventStream {
    fn drop(&mut self) {
        self.release();
    }
}
