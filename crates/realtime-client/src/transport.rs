//! The transport seam: whatever actually moves frames to and from the server.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::config::ReconnectPolicy;
use crate::protocol::{ClientFrame, Reply, ServerFrame};
use crate::types::TokenProvider;

/// Everything a transport needs to open (and later re-open) the connection.
#[derive(Clone)]
pub struct ConnectRequest {
    /// Endpoint with identity query parameters already attached.
    pub url: url::Url,
    /// Token fetched for the first handshake.
    pub token: Option<String>,
    /// Provider for fresh tokens on reconnect handshakes.
    pub auth: Option<TokenProvider>,
    /// The transport owns the reconnection timer and must follow this policy.
    pub reconnect: ReconnectPolicy,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("url", &self.url.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("auth", &self.auth.is_some())
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// Lifecycle and inbound traffic reported by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed (first connect or a successful reconnect).
    Connected,
    /// The link dropped. The transport reconnects on its own if the policy allows.
    Disconnected { reason: Option<String> },
    /// A connection attempt failed.
    ConnectError { message: String },
    /// The transport is about to make reconnection attempt `attempt` (1-based).
    ReconnectAttempt { attempt: u32 },
    /// The transport gave up reconnecting.
    ReconnectFailed,
    Frame(ServerFrame),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Capability object for the underlying socket.
///
/// `emit` and `emit_with_reply` must not block: implementations buffer
/// internally and return immediately, the way a socket client's `emit` does.
/// Frames emitted in sequence must reach the wire in that order.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting. Returns the stream of events for this connection;
    /// the stream ends when the transport is closed.
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Fire-and-forget emit.
    fn emit(&self, frame: ClientFrame) -> Result<(), TransportError>;

    /// Emit with a reply callback; the receiver resolves with the server's reply.
    fn emit_with_reply(
        &self,
        frame: ClientFrame,
    ) -> Result<oneshot::Receiver<Reply>, TransportError>;

    /// Tear the connection down and stop any reconnection loop.
    fn close(&self);
}
