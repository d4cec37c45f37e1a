//! Wire protocol: event names, payload types, frame unions and envelope codecs.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub mod event {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const PUBLISH: &str = "publish";
    pub const EVENT: &str = "event";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
    pub const ACK: &str = "ack";
    pub const ERROR: &str = "error";
}

pub mod error_code {
    /// Server replied `status: "error"` without a code of its own.
    pub const REJECTED: i64 = 40000;
    /// Frame could not be decoded or names an unknown event.
    pub const MALFORMED: i64 = 40001;
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub topic: String,
    pub message_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    pub message_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub ack_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Server response to an emit carrying a reply callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_to: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn success() -> Self {
        Self {
            status: ReplyStatus::Success,
            subscriber_count: None,
            delivered_to: None,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            subscriber_count: None,
            delivered_to: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }
}

/// A message delivered to topic listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub code: i64,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Outbound message
// ---------------------------------------------------------------------------

/// A message created by `publish()`. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub timestamp: i64,
    pub ack_required: bool,
}

impl OutboundMessage {
    pub fn new(
        topic: impl Into<String>,
        payload: Value,
        id: Option<String>,
        ack_required: bool,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            topic: topic.into(),
            payload,
            timestamp: now_ms(),
            ack_required,
        }
    }

    pub fn to_frame(&self) -> ClientFrame {
        ClientFrame::Publish(PublishRequest {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            message_id: self.id.clone(),
            timestamp: self.timestamp,
            ack_required: self.ack_required,
        })
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Wire envelope: `{"event": <name>, "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Subscribe(SubscribeRequest),
    Publish(PublishRequest),
    Heartbeat(Heartbeat),
}

impl ClientFrame {
    pub fn subscribe(topic: &str) -> Self {
        Self::Subscribe(SubscribeRequest {
            topic: topic.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_ms(),
        })
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat(Heartbeat {
            timestamp: now_ms(),
        })
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => event::SUBSCRIBE,
            Self::Publish(_) => event::PUBLISH,
            Self::Heartbeat(_) => event::HEARTBEAT,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, Error> {
        let data = match self {
            Self::Subscribe(p) => serde_json::to_value(p)?,
            Self::Publish(p) => serde_json::to_value(p)?,
            Self::Heartbeat(p) => serde_json::to_value(p)?,
        };
        Ok(Envelope {
            event: self.event_name().to_string(),
            data,
        })
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, Error> {
        let frame = match envelope.event.as_str() {
            event::SUBSCRIBE => Self::Subscribe(serde_json::from_value(envelope.data)?),
            event::PUBLISH => Self::Publish(serde_json::from_value(envelope.data)?),
            event::HEARTBEAT => Self::Heartbeat(serde_json::from_value(envelope.data)?),
            other => return Err(unknown_event(other)),
        };
        Ok(frame)
    }
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Event(InboundEvent),
    Ack(AckFrame),
    HeartbeatAck(Value),
    Error(ServerError),
}

impl ServerFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Event(_) => event::EVENT,
            Self::Ack(_) => event::ACK,
            Self::HeartbeatAck(_) => event::HEARTBEAT_ACK,
            Self::Error(_) => event::ERROR,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, Error> {
        let data = match self {
            Self::Event(p) => serde_json::to_value(p)?,
            Self::Ack(p) => serde_json::to_value(p)?,
            Self::HeartbeatAck(v) => v.clone(),
            Self::Error(p) => serde_json::to_value(p)?,
        };
        Ok(Envelope {
            event: self.event_name().to_string(),
            data,
        })
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, Error> {
        let frame = match envelope.event.as_str() {
            event::EVENT => Self::Event(serde_json::from_value(envelope.data)?),
            event::ACK => Self::Ack(serde_json::from_value(envelope.data)?),
            event::HEARTBEAT_ACK => Self::HeartbeatAck(envelope.data),
            event::ERROR => Self::Error(serde_json::from_value(envelope.data)?),
            other => return Err(unknown_event(other)),
        };
        Ok(frame)
    }
}

fn unknown_event(name: &str) -> Error {
    Error::Protocol {
        code: error_code::MALFORMED,
        message: format!("unknown event {name:?}"),
    }
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

/// Byte encoding for envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    #[default]
    Json,
    MsgPack,
}

impl Codec {
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, Error> {
        match self {
            Self::Json => encode_json(envelope),
            Self::MsgPack => encode_msgpack(envelope),
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Envelope, Error> {
        match self {
            Self::Json => decode_json(data),
            Self::MsgPack => decode_msgpack(data),
        }
    }
}

pub fn encode_json(envelope: &Envelope) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(envelope)?)
}

pub fn decode_json(data: &[u8]) -> Result<Envelope, Error> {
    serde_json::from_slice(data).map_err(|e| Error::Protocol {
        code: error_code::MALFORMED,
        message: format!("json decode error: {e}"),
    })
}

pub fn encode_msgpack(envelope: &Envelope) -> Result<Vec<u8>, Error> {
    Ok(rmp_serde::to_vec_named(envelope)?)
}

/// Decode through `rmpv::Value` so binary payloads survive: they arrive as
/// base64 strings in the resulting JSON.
pub fn decode_msgpack(data: &[u8]) -> Result<Envelope, Error> {
    let mut cursor = std::io::Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor).map_err(|e| Error::Protocol {
        code: error_code::MALFORMED,
        message: format!("msgpack decode error: {e}"),
    })?;
    serde_json::from_value(msgpack_to_json(value)).map_err(|e| Error::Protocol {
        code: error_code::MALFORMED,
        message: format!("envelope decode error: {e}"),
    })
}

fn msgpack_to_json(value: rmpv::Value) -> Value {
    match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(i) => i
            .as_i64()
            .map(Value::from)
            .or_else(|| i.as_u64().map(Value::from))
            .unwrap_or(Value::Null),
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(f))
            .map_or(Value::Null, Value::Number),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        rmpv::Value::String(s) => Value::String(utf8_or_empty(s)),
        rmpv::Value::Binary(bytes) | rmpv::Value::Ext(_, bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        rmpv::Value::Array(items) => Value::Array(items.into_iter().map(msgpack_to_json).collect()),
        rmpv::Value::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) => utf8_or_empty(s),
                        other => other.to_string(),
                    };
                    (key, msgpack_to_json(v))
                })
                .collect(),
        ),
    }
}

fn utf8_or_empty(s: rmpv::Utf8String) -> String {
    s.into_str().unwrap_or_else(|| {
        tracing::warn!("msgpack string contains invalid UTF-8, substituting empty string");
        String::new()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
