//! Bounded FIFO for messages produced while not connected.

use std::collections::{HashSet, VecDeque};

use tokio::sync::oneshot;

use crate::protocol::OutboundMessage;
use crate::types::Error;

/// Resolves when the queued message is emitted, or with the reason it never will be.
pub(crate) type SentNotifier = oneshot::Sender<Result<(), Error>>;

pub(crate) struct QueuedMessage {
    pub(crate) message: OutboundMessage,
    pub(crate) sent: Option<SentNotifier>,
}

impl QueuedMessage {
    pub(crate) fn new(message: OutboundMessage, sent: Option<SentNotifier>) -> Self {
        Self { message, sent }
    }

    pub(crate) fn mark_sent(self) {
        if let Some(tx) = self.sent {
            let _ = tx.send(Ok(()));
        }
    }

    pub(crate) fn fail(self, err: Error) {
        if let Some(tx) = self.sent {
            let _ = tx.send(Err(err));
        }
    }
}

/// Drop-oldest bounded queue. Length never exceeds `max_size`.
pub(crate) struct OutboundQueue {
    items: VecDeque<QueuedMessage>,
    max_size: usize,
}

impl OutboundQueue {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Append to the tail, evicting from the head when full. Returns the ids of
    /// evicted messages; their waiters receive [`Error::QueueOverflow`].
    pub(crate) fn enqueue(&mut self, item: QueuedMessage) -> Vec<String> {
        let mut evicted = Vec::new();
        if self.max_size == 0 {
            let id = item.message.id.clone();
            item.fail(Error::QueueOverflow { id: id.clone() });
            evicted.push(id);
            return evicted;
        }
        while self.items.len() >= self.max_size {
            let Some(old) = self.items.pop_front() else {
                break;
            };
            let id = old.message.id.clone();
            tracing::warn!(
                id = %id,
                topic = %old.message.topic,
                max_size = self.max_size,
                "outbound queue full, dropping oldest message"
            );
            old.fail(Error::QueueOverflow { id: id.clone() });
            evicted.push(id);
        }
        self.items.push_back(item);
        evicted
    }

    /// Take everything, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }

    /// Put unsent messages back at the head, keeping their order.
    pub(crate) fn requeue_front(&mut self, items: Vec<QueuedMessage>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
        while self.items.len() > self.max_size {
            if let Some(newest) = self.items.pop_back() {
                let id = newest.message.id.clone();
                newest.fail(Error::QueueOverflow { id });
            }
        }
    }

    /// Drop queued copies of the given message ids.
    pub(crate) fn discard(&mut self, ids: &HashSet<String>) {
        self.items.retain(|item| !ids.contains(&item.message.id));
    }

    /// Empty the queue, failing every waiter with `err()`.
    pub(crate) fn clear_with(&mut self, err: impl Fn() -> Error) {
        for item in self.items.drain(..) {
            item.fail(err());
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.message.id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }
}
