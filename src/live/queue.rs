//! # Audio Input Channel
//!
//! Per-connection FIFO handoff between the WebSocket actor (producer, on the
//! actix worker thread) and the session's send duty (consumer, on the
//! session's own arbiter thread).
//!
//! The channel is a `tokio::sync::mpsc` unbounded channel, so pushes never
//! block the actor and never take a lock. A shared counter tracks how many
//! items are waiting so the receive duty can tell whether the send duty is
//! parked on an empty queue.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One entry in the audio queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioItem {
    /// Raw audio bytes, forwarded in arrival order.
    Chunk(Bytes),
    /// No more audio will arrive on this connection.
    Sentinel,
}

/// Why a push was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The Sentinel is already queued; nothing after it would ever be read.
    Closed,
    /// The consuming half has been dropped.
    Disconnected,
}

#[derive(Debug)]
struct Shared {
    pending: AtomicUsize,
    closed: AtomicBool,
}

/// Producer half. Cheap to clone; every clone feeds the same queue.
#[derive(Debug, Clone)]
pub struct AudioQueue {
    tx: mpsc::UnboundedSender<AudioItem>,
    shared: Arc<Shared>,
}

/// Consumer half, owned by the send duty.
#[derive(Debug)]
pub struct AudioReceiver {
    rx: mpsc::UnboundedReceiver<AudioItem>,
    shared: Arc<Shared>,
}

/// Create a fresh queue for one client connection.
pub fn audio_channel() -> (AudioQueue, AudioReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        pending: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
    });
    (
        AudioQueue {
            tx,
            shared: shared.clone(),
        },
        AudioReceiver { rx, shared },
    )
}

impl AudioQueue {
    /// Enqueue one audio chunk without blocking.
    pub fn push(&self, chunk: Bytes) -> Result<(), PushError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PushError::Closed);
        }
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(AudioItem::Chunk(chunk)).map_err(|_| {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            PushError::Disconnected
        })
    }

    /// Enqueue the Sentinel. Only the first call queues anything.
    ///
    /// Returns `true` when this call queued the Sentinel.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(AudioItem::Sentinel).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }

    /// Number of items queued but not yet taken by the consumer.
    pub fn len(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AudioReceiver {
    /// Wait for the next item. `None` once every producer is gone.
    ///
    /// Cancel-safe: dropping the future before it resolves loses nothing.
    pub async fn recv(&mut self) -> Option<AudioItem> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }
}
