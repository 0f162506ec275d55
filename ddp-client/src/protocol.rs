//! DDP wire protocol: message kinds, the inbound envelope reader and the
//! outbound message encoder.
//!
//! Wire format (one JSON object per text frame):
//! ```text
//! {"msg": "<kind>", ...kind specific fields...}
//! ```
//!
//! Inbound frames are parsed into an [`Envelope`] (kind tag + opaque body).
//! The body is only decoded into one of the typed structs below by the
//! component the envelope is routed to, so a frame for a collection nobody
//! observes is never decoded past its `collection` field.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Protocol versions this client speaks, most preferred first.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1", "pre2", "pre1"];

/// Closed set of `msg` discriminators understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Client handshake request
    Connect,
    /// Handshake accepted
    Connected,
    /// Handshake rejected
    Failed,
    /// Remote method call
    Method,
    /// Method outcome
    Result,
    /// Method writes visible
    Updated,
    /// Subscribe
    Sub,
    /// Unsubscribe
    Unsub,
    /// Subscriptions ready
    Ready,
    /// Subscription stopped or rejected
    NoSub,
    /// Document inserted
    Added,
    /// Document inserted at a position
    AddedBefore,
    /// Document fields updated
    Changed,
    /// Document deleted
    Removed,
    /// Document reordered
    MovedBefore,
    /// Keep-alive probe
    Ping,
    /// Keep-alive answer
    Pong,
    /// Server rejected a client message
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Method => "method",
            Self::Result => "result",
            Self::Updated => "updated",
            Self::Sub => "sub",
            Self::Unsub => "unsub",
            Self::Ready => "ready",
            Self::NoSub => "nosub",
            Self::Added => "added",
            Self::AddedBefore => "addedBefore",
            Self::Changed => "changed",
            Self::Removed => "removed",
            Self::MovedBefore => "movedBefore",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
        }
    }

    /// Whether this kind is one of the five collection diff events.
    pub fn is_collection_diff(&self) -> bool {
        matches!(
            self,
            Self::Added | Self::AddedBefore | Self::Changed | Self::Removed | Self::MovedBefore
        )
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "connect" => Self::Connect,
            "connected" => Self::Connected,
            "failed" => Self::Failed,
            "method" => Self::Method,
            "result" => Self::Result,
            "updated" => Self::Updated,
            "sub" => Self::Sub,
            "unsub" => Self::Unsub,
            "ready" => Self::Ready,
            "nosub" => Self::NoSub,
            "added" => Self::Added,
            "addedBefore" => Self::AddedBefore,
            "changed" => Self::Changed,
            "removed" => Self::Removed,
            "movedBefore" => Self::MovedBefore,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "error" => Self::Error,
            other => return Err(ProtocolError::UnknownKind(other.to_string())),
        };
        Ok(kind)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed inbound frame.
///
/// Immutable once parsed; lives for a single dispatch cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    /// The whole JSON object, `msg` field included.
    pub body: Value,
}

impl Envelope {
    /// Parse a raw text frame.
    ///
    /// Fails for non-JSON text, non-object JSON, a missing or non-string
    /// `msg` field, and unrecognized kinds. Callers drop such frames.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let body: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = match body.get("msg") {
            Some(Value::String(tag)) => tag.parse()?,
            Some(_) | None => return Err(ProtocolError::MissingKind),
        };
        Ok(Self { kind, body })
    }

    /// Read a top-level string field without decoding the rest of the body.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.body.get(name).and_then(Value::as_str)
    }

    /// Decode the body into a kind-specific shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.body).map_err(|e| ProtocolError::Decode {
            kind: self.kind,
            reason: e.to_string(),
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Inbound bodies
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectedMessage {
    pub session: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FailedMessage {
    /// Version the server would accept.
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultMessage {
    pub id: String,
    #[serde(default)]
    pub result: Option<Value>,
    /// Kept raw; see [`crate::methods::RemoteError::from_value`].
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdatedMessage {
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadyMessage {
    #[serde(default)]
    pub subs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NoSubMessage {
    pub id: String,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddedMessage {
    pub collection: String,
    pub id: String,
    #[serde(default)]
    pub fields: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddedBeforeMessage {
    pub collection: String,
    pub id: String,
    #[serde(default)]
    pub fields: Option<Map<String, Value>>,
    /// `None` appends at the end.
    #[serde(default)]
    pub before: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangedMessage {
    pub collection: String,
    pub id: String,
    #[serde(default)]
    pub fields: Option<Map<String, Value>>,
    #[serde(default)]
    pub cleared: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemovedMessage {
    pub collection: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MovedBeforeMessage {
    pub collection: String,
    pub id: String,
    #[serde(default)]
    pub before: Option<String>,
}

/// Body of both `ping` and `pong`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeartbeatMessage {
    #[serde(default)]
    pub id: Option<String>,
}

/// Server-side rejection of a malformed client message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorMessage {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub offending_message: Option<Value>,
}

// ───────────────────────────────────────────────────────────────────
// Outbound
// ───────────────────────────────────────────────────────────────────

/// Messages the client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage<'a> {
    Connect {
        version: &'a str,
        support: &'a [String],
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<&'a str>,
    },
    Method {
        method: &'a str,
        params: &'a [Value],
        id: &'a str,
    },
    Sub {
        id: &'a str,
        name: &'a str,
        params: &'a [Value],
    },
    Unsub {
        id: &'a str,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a str>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a str>,
    },
}

impl ClientMessage<'_> {
    /// Serialize to a single text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Frame has no msg field")]
    MissingKind,
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),
    #[error("Invalid {kind} message: {reason}")]
    Decode { kind: MessageKind, reason: String },
    #[error("Serialization error: {0}")]
    Encode(String),
}
