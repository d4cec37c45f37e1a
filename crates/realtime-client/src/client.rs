//! Public entry point: [`RealtimeClient`] and the handles it hands out.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::ack;
use crate::config::RealtimeOptions;
use crate::connection::{self, ConnectionListener, Shared, Unacked};
use crate::protocol::{OutboundMessage, error_code};
use crate::registry::{Listener, ListenerId};
use crate::transport::Transport;
use crate::types::{ClientStats, ConnectionStatus, Error, PublishOptions, PublishOutcome, Result};

/// Topic pub/sub client over a pluggable [`Transport`].
///
/// One instance owns one logical connection. Dropping the client disconnects
/// it; handles it gave out become inert.
pub struct RealtimeClient {
    shared: Arc<Shared>,
}

impl RealtimeClient {
    pub fn new(transport: Arc<dyn Transport>, options: RealtimeOptions) -> Self {
        Self {
            shared: Arc::new(Shared::new(transport, options)),
        }
    }

    /// Replace the configuration and reset the client.
    ///
    /// Disconnects, drops every subscription and queued message, and rejects
    /// pending publishes and in-flight connects with [`Error::Reset`].
    /// Connection listeners are kept. Calling it twice with the same options
    /// leaves the client in the same state as calling it once.
    pub fn init(&self, options: RealtimeOptions) {
        self.shared.reinit(options);
    }

    /// Connect and wait for the first successful handshake.
    ///
    /// Resolves immediately when already connected and joins an attempt that
    /// is already running. Errors before the first connection are also
    /// reported to connection listeners.
    pub async fn connect(&self) -> Result<()> {
        self.shared.connect().await
    }

    /// [`init`](Self::init) with `options`, then [`connect`](Self::connect).
    ///
    /// Any live or in-flight connection is torn down first, so this always
    /// performs a fresh handshake with the new configuration.
    pub async fn connect_with(&self, options: RealtimeOptions) -> Result<()> {
        self.shared.reinit(options);
        self.shared.connect().await
    }

    /// Close the connection. Pending acks are rejected with
    /// [`Error::Disconnected`]; a running `connect()` fails with [`Error::Closed`].
    /// Subscriptions and unacked queued messages survive for the next `connect()`.
    pub fn disconnect(&self) {
        tracing::info!("disconnect requested");
        self.shared.disconnect();
    }

    /// Disconnect and clear everything, connection listeners included.
    pub fn destroy(self) {
        self.shared.destroy();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock().state.status()
    }

    pub fn stats(&self) -> ClientStats {
        self.shared.lock().stats()
    }

    /// Register `listener` for events on `topic`.
    ///
    /// The first listener for a topic sends a `subscribe` request when
    /// connected; otherwise the topic is subscribed on the next connect.
    pub fn subscribe(&self, topic: &str, listener: Listener) -> SubscriptionHandle {
        let id = self.shared.subscribe(topic, listener);
        SubscriptionHandle {
            topic: topic.to_string(),
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Publish `payload` to `topic`.
    ///
    /// With `ack_required` the call resolves once the server acks the message,
    /// resending on timeout up to `ack.max_retries` sends in total. Without it,
    /// the call resolves once the message is sent (or queued while offline).
    pub async fn publish(
        &self,
        topic: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<PublishOutcome> {
        let message =
            OutboundMessage::new(topic, payload, options.message_id, options.ack_required);
        if !message.ack_required {
            return self.publish_unacked(message).await;
        }

        let id = message.id.clone();
        let (waiter, policy) = {
            let mut m = self.shared.lock();
            (m.tracker.register(&id, topic)?, m.options.ack.clone())
        };
        let guard = PendingAckGuard {
            shared: &self.shared,
            id: Some(id.clone()),
        };

        let (ack, attempts) = ack::send_with_ack(&id, waiter, &policy, |attempt| {
            self.shared.send_attempt(&message, attempt)
        })
        .await?;
        guard.disarm();

        Ok(PublishOutcome::Acknowledged {
            id,
            attempts,
            code: ack.code,
            message: ack.message,
        })
    }

    async fn publish_unacked(&self, message: OutboundMessage) -> Result<PublishOutcome> {
        let id = message.id.clone();
        let (reply, timeout) = match self.shared.send_unacked(message)? {
            Unacked::Queued => return Ok(PublishOutcome::Queued { id }),
            Unacked::Sent { reply, timeout } => (reply, timeout),
        };

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) if reply.is_success() => Ok(PublishOutcome::Sent {
                id,
                delivered_to: reply.delivered_to,
            }),
            Ok(Ok(reply)) => Err(Error::Protocol {
                code: error_code::REJECTED,
                message: reply
                    .error
                    .unwrap_or_else(|| "publish rejected".to_string()),
            }),
            Ok(Err(_)) | Err(_) => {
                tracing::debug!(id = %id, "no publish reply");
                Ok(PublishOutcome::Sent {
                    id,
                    delivered_to: None,
                })
            }
        }
    }

    /// Watch connection status. `listener` is called right away with the
    /// current status, then on every change.
    pub fn on_connection_change(&self, listener: ConnectionListener) -> ConnectionListenerHandle {
        let (id, change) = {
            let mut m = self.shared.lock();
            (m.add_listener(Arc::clone(&listener)), m.state.change(None))
        };
        connection::notify(&listener, &change);
        ConnectionListenerHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

/// Forgets a pending ack when a publish ends without one: retries exhausted,
/// or the publish future dropped.
struct PendingAckGuard<'a> {
    shared: &'a Shared,
    id: Option<String>,
}

impl PendingAckGuard<'_> {
    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for PendingAckGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let mut m = self.shared.lock();
            m.tracker.forget(&id);
            m.queue.discard(&HashSet::from([id]));
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Returned by [`RealtimeClient::subscribe`].
pub struct SubscriptionHandle {
    topic: String,
    id: ListenerId,
    shared: Weak<Shared>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the topic still has any listener (not necessarily this one).
    pub fn is_active(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        shared.lock().registry.contains(&self.topic)
    }

    /// Remove this listener. The topic goes away with its last listener.
    /// No wire message is sent.
    pub fn unsubscribe(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.lock().registry.remove(&self.topic, self.id) {
            tracing::debug!(topic = %self.topic, "last listener removed, topic dropped");
        }
    }
}

/// Returned by [`RealtimeClient::on_connection_change`].
pub struct ConnectionListenerHandle {
    id: u64,
    shared: Weak<Shared>,
}

impl ConnectionListenerHandle {
    /// Stop receiving changes. Returns `false` if already removed.
    pub fn remove(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.lock().remove_listener(self.id))
    }
}
