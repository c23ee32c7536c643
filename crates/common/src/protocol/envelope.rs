// Wire envelopes for the taskdeck WebSocket: broadcasts, correlated requests
// and their responses all share the `{ type, payload }` shape.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Path of the sync socket relative to the backend base URL.
pub const WS_PATH: &str = "/ws";

/// A broadcast or fire-and-forget message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self { topic: topic.into(), payload }
    }
}

/// Identity of one outstanding request on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a correlation ID echoed back by the server. Anything that is
    /// not one of ours cannot match a pending call, so `None` is fine.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Client → server request expecting exactly one response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelatedRequest {
    #[serde(rename = "type")]
    pub topic: String,
    pub payload: Value,
    pub correlation_id: CorrelationId,
}

/// Error object attached to a response frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    #[serde(default)]
    pub code: String,
    pub message: String,
}

/// Server → client answer to a [`CorrelatedRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub topic: String,
    pub correlation_id: String,
    pub outcome: Result<Value, WireError>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Broadcast(Envelope),
    Response(Response),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not a valid envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame has an empty `type`")]
    EmptyTopic,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    topic: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    error: Option<WireError>,
}

/// Decode one text frame into a broadcast or a correlated response.
///
/// Frames carrying a `correlation_id` are responses. A response fails when
/// it has a top-level `error` object, or when its payload is an object with
/// an `error` member (either a string or `{ message }`).
pub fn decode_frame(text: &str) -> Result<Inbound, FrameError> {
    let raw: RawFrame = serde_json::from_str(text)?;
    if raw.topic.is_empty() {
        return Err(FrameError::EmptyTopic);
    }

    let Some(correlation_id) = raw.correlation_id else {
        return Ok(Inbound::Broadcast(Envelope { topic: raw.topic, payload: raw.payload }));
    };

    let outcome = match raw.error {
        Some(error) => Err(error),
        None => match payload_error(&raw.payload) {
            Some(error) => Err(error),
            None => Ok(raw.payload),
        },
    };

    Ok(Inbound::Response(Response { topic: raw.topic, correlation_id, outcome }))
}

fn payload_error(payload: &Value) -> Option<WireError> {
    let error = payload.as_object()?.get("error")?;
    match error {
        Value::String(message) => Some(WireError { code: String::new(), message: message.clone() }),
        Value::Object(fields) => Some(WireError {
            code: fields.get("code").and_then(Value::as_str).unwrap_or_default().to_string(),
            message: fields
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string(),
        }),
        _ => None,
    }
}
