//! Reliable topic-based pub/sub client over a pluggable realtime transport.
//!
//! The crate owns everything above the socket: connection lifecycle,
//! reconnection accounting, topic subscriptions, an offline queue, and
//! at-least-once publishing with ack tracking. The socket itself is a
//! [`Transport`] you provide; [`LoopbackTransport`] plays the server in-process.
//!
//! # Features
//! - Resubscribe-all and queue flush after every reconnect
//! - Bounded drop-oldest queue for publishes made while offline
//! - Ack-tracked publishes with timeout, capped exponential backoff and retry
//! - Heartbeat keep-alive while connected
//! - JSON and MessagePack envelope codecs for transport implementors
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), realtime_client::Error> {
//! use std::sync::Arc;
//!
//! use realtime_client::{
//!     InboundEvent, LoopbackTransport, PublishOptions, RealtimeClient, RealtimeOptions,
//! };
//!
//! let client = RealtimeClient::new(
//!     Arc::new(LoopbackTransport::new()),
//!     RealtimeOptions::new("wss://realtime.example.com/socket"),
//! );
//! client.connect().await?;
//!
//! let _sub = client.subscribe(
//!     "orders",
//!     Arc::new(|event: &InboundEvent| println!("got: {}", event.payload)),
//! );
//! let outcome = client
//!     .publish("orders", serde_json::json!({"id": 1}), PublishOptions::default())
//!     .await?;
//! println!("published {}", outcome.id());
//! # Ok(())
//! # }
//! ```

mod ack;
mod admin;
mod backoff;
mod client;
mod config;
mod connection;
mod heartbeat;
mod loopback;
pub mod protocol;
mod queue;
mod registry;
mod state;
pub mod transport;
mod types;

pub use admin::{AdminClient, BroadcastResult, ServerStats};
pub use client::{ConnectionListenerHandle, RealtimeClient, SubscriptionHandle};
pub use config::{AckPolicy, RealtimeOptions, ReconnectPolicy, UserIdentity};
pub use connection::ConnectionListener;
pub use loopback::LoopbackTransport;
pub use protocol::{Codec, InboundEvent};
pub use registry::Listener;
pub use transport::{ConnectRequest, Transport, TransportError, TransportEvent};
pub use types::{
    BoxError, ClientStats, ConnectionChange, ConnectionStatus, Error, PublishOptions,
    PublishOutcome, Result, TokenFuture, TokenProvider,
};
