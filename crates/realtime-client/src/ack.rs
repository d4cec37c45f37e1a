//! At-least-once delivery for publishes that require an ack.

use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;

use crate::config::AckPolicy;
use crate::protocol::AckFrame;
use crate::types::Error;

type AckSender = oneshot::Sender<Result<AckFrame, Error>>;
pub(crate) type AckWaiter = oneshot::Receiver<Result<AckFrame, Error>>;

/// Receiver that resolves once a queued send was flushed.
pub(crate) type SentWaiter = oneshot::Receiver<Result<(), Error>>;

struct PendingAck {
    topic: String,
    attempts: u32,
    tx: AckSender,
}

/// Correlates message ids with the publish futures waiting on them.
#[derive(Default)]
pub(crate) struct AckTracker {
    pending: HashMap<String, PendingAck>,
}

impl AckTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`. Fails if the id is already pending.
    pub(crate) fn register(&mut self, id: &str, topic: &str) -> Result<AckWaiter, Error> {
        if self.pending.contains_key(id) {
            return Err(Error::DuplicateMessageId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.to_string(),
            PendingAck {
                topic: topic.to_string(),
                attempts: 0,
                tx,
            },
        );
        Ok(rx)
    }

    /// Count a send. `None` when the entry is gone (acked, rejected or forgotten).
    pub(crate) fn record_attempt(&mut self, id: &str) -> Option<u32> {
        let entry = self.pending.get_mut(id)?;
        entry.attempts += 1;
        Some(entry.attempts)
    }

    /// Settle the waiter for `ack.id`. Returns `false` for unknown ids.
    pub(crate) fn resolve(&mut self, ack: AckFrame) -> bool {
        match self.pending.remove(&ack.id) {
            Some(entry) => {
                tracing::debug!(
                    id = %ack.id,
                    topic = %entry.topic,
                    attempts = entry.attempts,
                    "ack received"
                );
                let _ = entry.tx.send(Ok(ack));
                true
            }
            None => false,
        }
    }

    /// Stop tracking `id` without settling its waiter.
    pub(crate) fn forget(&mut self, id: &str) {
        self.pending.remove(id);
    }

    /// Reject every pending waiter with `err()`. Returns the rejected ids.
    pub(crate) fn reject_all(&mut self, err: impl Fn() -> Error) -> HashSet<String> {
        let mut ids = HashSet::with_capacity(self.pending.len());
        for (id, entry) in self.pending.drain() {
            let _ = entry.tx.send(Err(err()));
            ids.insert(id);
        }
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Result of handing one attempt to the connection.
pub(crate) enum Dispatch {
    /// Emitted on the live connection.
    Sent,
    /// Buffered; the receiver fires when the queue is flushed or the copy is evicted.
    Queued(SentWaiter),
    /// A copy from an earlier attempt is still buffered; nothing new was queued.
    StillQueued,
    /// Entry no longer pending; nothing was sent.
    Skipped,
}

/// Run the send / wait / back off loop until ack, exhaustion or rejection.
///
/// `send` is called once per attempt with the 1-based attempt number. Each
/// attempt's ack timeout starts when it is handed off, emitted or queued. A
/// queued copy that gets evicted fails the publish with its eviction error.
/// Returns the ack and the attempt it arrived on.
pub(crate) async fn send_with_ack<F>(
    id: &str,
    mut waiter: AckWaiter,
    policy: &AckPolicy,
    mut send: F,
) -> Result<(AckFrame, u32), Error>
where
    F: FnMut(u32) -> Result<Dispatch, Error>,
{
    let max_attempts = policy.max_retries.max(1);
    let mut queued: Option<SentWaiter> = None;
    for attempt in 1..=max_attempts {
        match send(attempt)? {
            Dispatch::Queued(sent) => queued = Some(sent),
            Dispatch::Sent => queued = None,
            Dispatch::StillQueued | Dispatch::Skipped => {}
        }

        tokio::select! {
            biased;
            res = &mut waiter => return settle(res, attempt),
            err = evicted(&mut queued) => return Err(err),
            _ = tokio::time::sleep(policy.timeout()) => {}
        }

        if attempt < max_attempts {
            let delay = policy.retry_delay(attempt);
            tracing::warn!(
                id,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "ack timed out, retrying"
            );
            tokio::select! {
                biased;
                res = &mut waiter => return settle(res, attempt),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    tracing::error!(id, attempts = max_attempts, "ack retries exhausted");
    Err(Error::AckTimeout {
        id: id.to_string(),
        attempts: max_attempts,
    })
}

/// Resolves only if the queued copy is dropped from the queue with an error.
/// A successful flush clears `queued` and pends like an empty slot.
async fn evicted(queued: &mut Option<SentWaiter>) -> Error {
    if let Some(sent) = queued.as_mut() {
        let flushed = sent.await;
        *queued = None;
        if let Ok(Err(e)) = flushed {
            return e;
        }
    }
    std::future::pending().await
}

fn settle(
    res: Result<Result<AckFrame, Error>, oneshot::error::RecvError>,
    attempt: u32,
) -> Result<(AckFrame, u32), Error> {
    match res {
        Ok(Ok(ack)) => Ok((ack, attempt)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Closed),
    }
}
