//! Public types for the realtime-client crate.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;

use crate::transport::TransportError;

/// A future that returns a bearer token.
pub type TokenFuture = Pin<Box<dyn Future<Output = std::result::Result<String, BoxError>> + Send>>;

/// A boxed error type for the token callback.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Callback that returns a fresh bearer token from your auth service.
///
/// Called once per `connect()` and handed to the transport so it can fetch a
/// new token for every reconnect handshake.
pub type TokenProvider = Arc<dyn Fn() -> TokenFuture + Send + Sync>;

/// Connection status held by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Only ever reported through [`ConnectionChange`]; never held.
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivered to connection-change listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChange {
    /// `Error` when this change reports a fault; the held status is unchanged.
    pub status: ConnectionStatus,
    pub error: Option<String>,
    /// Attempts in the current reconnection streak (0 while connected).
    pub reconnect_attempt: u32,
}

/// Options for [`RealtimeClient::publish`](crate::RealtimeClient::publish).
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Track the message until the server acks it, retrying on timeout.
    pub ack_required: bool,
    /// Correlation id. A UUID v4 is generated when `None`.
    pub message_id: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            ack_required: true,
            message_id: None,
        }
    }
}

impl PublishOptions {
    /// Fire-and-forget publish: resolves once sent or queued.
    pub fn unacked() -> Self {
        Self {
            ack_required: false,
            message_id: None,
        }
    }
}

/// How a publish settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Emitted on the live connection.
    Sent {
        id: String,
        delivered_to: Option<u64>,
    },
    /// Buffered until the next successful connection.
    Queued { id: String },
    /// The server acked the message.
    Acknowledged {
        id: String,
        attempts: u32,
        code: Option<i64>,
        message: Option<String>,
    },
}

impl PublishOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Sent { id, .. } | Self::Queued { id } | Self::Acknowledged { id, .. } => id,
        }
    }
}

/// Read-only snapshot returned by [`RealtimeClient::stats`](crate::RealtimeClient::stats).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub status: ConnectionStatus,
    pub subscriptions: usize,
    pub queue_size: usize,
    pub reconnect_count: u64,
    pub pending_acks: usize,
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("no ack for message {id} after {attempts} attempts")]
    AckTimeout { id: String, attempts: u32 },

    #[error("message {id} evicted from the outbound queue")]
    QueueOverflow { id: String },

    #[error("protocol error: code={code}, {message}")]
    Protocol { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("token fetch failed: {0}")]
    TokenFetch(BoxError),

    #[error("client disconnected")]
    Disconnected,

    #[error("client closed")]
    Closed,

    #[error("client state was reset")]
    Reset,

    #[error("message id {0} is already awaiting an ack")]
    DuplicateMessageId(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("admin API returned {status}: {body}")]
    Admin { status: u16, body: String },

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;
