//! In-process transport that plays the server.
//!
//! Every frame makes a full codec round trip, so the loopback exercises the
//! same envelope encoding a socket transport would put on the wire.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::config::ReconnectPolicy;
use crate::protocol::{AckFrame, ClientFrame, Codec, InboundEvent, Reply, ServerFrame};
use crate::transport::{ConnectRequest, Transport, TransportError, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Server {
    /// Unbounded so server-side delivery never drops; a forwarder task feeds
    /// the bounded client stream in order.
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    reconnect: ReconnectPolicy,
    topics: HashSet<String>,
}

/// A [`Transport`] with the server living in the same process.
///
/// Replies to `subscribe` and `publish`, echoes published payloads to
/// subscribed topics as `event` frames, acks ack-required publishes and
/// answers heartbeats. Useful offline and in tests.
#[derive(Default)]
pub struct LoopbackTransport {
    codec: Codec,
    server: Mutex<Server>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(codec: Codec) -> Self {
        Self {
            codec,
            server: Mutex::default(),
        }
    }

    /// Simulate a dropped link. With reconnection enabled the loopback
    /// reconnects at once; the server forgets all subscriptions either way.
    pub fn drop_connection(&self) {
        let mut server = self.server();
        server.topics.clear();
        let Some(tx) = server.events.clone() else {
            return;
        };
        push(
            &tx,
            TransportEvent::Disconnected {
                reason: Some("loopback connection dropped".to_string()),
            },
        );
        if server.reconnect.enabled {
            push(&tx, TransportEvent::ReconnectAttempt { attempt: 1 });
            push(&tx, TransportEvent::Connected);
        } else {
            server.events = None;
        }
    }

    /// Topics the server currently considers subscribed.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.server().topics.iter().cloned().collect();
        topics.sort();
        topics
    }

    fn server(&self) -> MutexGuard<'_, Server> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decode what a remote server would have received.
    fn receive(&self, frame: ClientFrame) -> Result<ClientFrame, TransportError> {
        let bytes = frame
            .to_envelope()
            .and_then(|env| self.codec.encode(&env))
            .map_err(|e| TransportError::Other(e.to_string()))?;
        self.codec
            .decode(&bytes)
            .and_then(ClientFrame::from_envelope)
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    /// Encode on the server side and decode on the client side.
    fn deliver(&self, tx: &mpsc::UnboundedSender<TransportEvent>, frame: ServerFrame) {
        let decoded = frame
            .to_envelope()
            .and_then(|env| self.codec.encode(&env))
            .and_then(|bytes| self.codec.decode(&bytes))
            .and_then(ServerFrame::from_envelope);
        match decoded {
            Ok(frame) => push(tx, TransportEvent::Frame(frame)),
            Err(e) => tracing::warn!(error = %e, "loopback dropped undecodable frame"),
        }
    }

    fn handle(&self, frame: ClientFrame) -> Result<Reply, TransportError> {
        let frame = self.receive(frame)?;
        let mut server = self.server();
        let tx = server.events.clone().ok_or(TransportError::NotConnected)?;

        let reply = match frame {
            ClientFrame::Subscribe(req) => {
                server.topics.insert(req.topic);
                Reply {
                    subscriber_count: Some(1),
                    ..Reply::success()
                }
            }
            ClientFrame::Publish(req) => {
                let subscribed = server.topics.contains(&req.topic);
                drop(server);
                if subscribed {
                    self.deliver(
                        &tx,
                        ServerFrame::Event(InboundEvent {
                            topic: req.topic,
                            payload: req.payload,
                            id: Some(req.message_id.clone()),
                            timestamp: req.timestamp,
                        }),
                    );
                }
                if req.ack_required {
                    self.deliver(
                        &tx,
                        ServerFrame::Ack(AckFrame {
                            id: req.message_id,
                            code: None,
                            message: None,
                        }),
                    );
                }
                Reply {
                    delivered_to: Some(u64::from(subscribed)),
                    ..Reply::success()
                }
            }
            ClientFrame::Heartbeat(hb) => {
                drop(server);
                self.deliver(&tx, ServerFrame::HeartbeatAck(json!({ "timestamp": hb.timestamp })));
                Reply::success()
            }
        };
        Ok(reply)
    }
}

fn push(tx: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent) {
    if tx.send(event).is_err() {
        tracing::debug!("loopback event stream closed, event dropped");
    }
}

/// Move events from the server buffer to the client stream, waiting for room.
/// Ends once the server side is closed and drained, or the client stops listening.
async fn forward(
    mut inbox: mpsc::UnboundedReceiver<TransportEvent>,
    outbox: mpsc::Sender<TransportEvent>,
) {
    while let Some(event) = inbox.recv().await {
        if outbox.send(event).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        push(&inbox_tx, TransportEvent::Connected);
        tokio::spawn(forward(inbox_rx, tx));
        let mut server = self.server();
        server.topics.clear();
        server.reconnect = request.reconnect;
        server.events = Some(inbox_tx);
        tracing::debug!(url = %request.url, codec = ?self.codec, "loopback connected");
        Ok(rx)
    }

    fn emit(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.handle(frame).map(|_| ())
    }

    fn emit_with_reply(
        &self,
        frame: ClientFrame,
    ) -> Result<oneshot::Receiver<Reply>, TransportError> {
        let reply = self.handle(frame)?;
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(reply);
        Ok(rx)
    }

    fn close(&self) {
        let mut server = self.server();
        server.events = None;
        server.topics.clear();
    }
}
