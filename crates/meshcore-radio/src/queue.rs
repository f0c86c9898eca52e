//! Bounded hand-off between the adapter thread and the presentation loop.
//!
//! The adapter side only ever pushes; the consumer drains whatever is there.
//! Neither side takes a lock. A full queue sheds its oldest entry instead of
//! blocking the producer, and counts what it shed.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use crossbeam_queue::ArrayQueue;
use meshcore_codec::RawPacket;
use meshcore_types::Message;

/// Connection lifecycle as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// First link-up after `connect`.
    Connected,
    /// The link dropped without being asked to.
    Lost { reason: String },
    /// Link back after a loss; `attempts` reconnects were needed.
    Restored { attempts: u32 },
    /// Deliberate shutdown.
    Disconnected,
}

/// A normalized adapter callback or local action.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Raw bytes as received, decoded later by the consumer.
    Packet(RawPacket),
    Connection(ConnectionEvent),
    /// A non-fatal adapter error.
    RadioError { message: String },
    /// An outbound message was handed to the radio and recorded as pending.
    MessageSent(Message),
}

/// A [`BridgeEvent`] stamped with the time it was enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub queued_at: DateTime<Utc>,
    pub event: BridgeEvent,
}

/// Bounded multi-producer queue that drops its oldest entry when full.
#[derive(Debug)]
pub struct HandoffQueue {
    items: ArrayQueue<QueuedEvent>,
    dropped: AtomicU64,
}

impl HandoffQueue {
    /// A queue holding at most `capacity` events (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues without blocking. Returns `false` if an older entry had to
    /// be dropped to make room.
    pub fn push(&self, event: BridgeEvent) -> bool {
        let item = QueuedEvent {
            queued_at: Utc::now(),
            event,
        };
        match self.items.force_push(item) {
            None => true,
            Some(_evicted) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Takes everything queued so far, oldest first.
    ///
    /// At most one queue's worth per call; events pushed meanwhile wait for
    /// the next drain.
    pub fn drain(&self) -> Vec<QueuedEvent> {
        let mut out = Vec::with_capacity(self.items.len());
        while out.len() < self.items.capacity() {
            match self.items.pop() {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out
    }

    /// Events currently queued.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bound fixed at construction.
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Entries shed because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
