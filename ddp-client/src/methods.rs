//! Method Invocation Registry.
//!
//! Maps the correlation id of each outstanding `method` to its completion.
//! An entry is removed before its completion runs, so a completion fires at
//! most once, and a duplicate or late `result` finds nothing to resolve.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::DdpError;
use crate::listeners::lock;
use crate::protocol::ResultMessage;

/// Structured error object sent by the server in `result.error` or
/// `nosub.error`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteError {
    /// Error code; a number or a string depending on the server.
    #[serde(default)]
    pub error: Value,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

impl RemoteError {
    /// Decode an error payload. Non-object payloads are kept as the code.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => serde_json::from_value(value.clone()).unwrap_or(Self {
                error: value,
                reason: None,
                message: None,
                error_type: None,
                details: None,
            }),
            other => Self {
                error: other,
                reason: None,
                message: None,
                error_type: None,
                details: None,
            },
        }
    }

    /// Error code rendered as text.
    pub fn code(&self) -> String {
        match &self.error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.reason) {
            (Some(message), _) => write!(f, "{message}"),
            (None, Some(reason)) => write!(f, "{reason} [{}]", self.code()),
            (None, None) => write!(f, "Remote error [{}]", self.code()),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Why a call completed without a result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("Method failed: {0}")]
    Remote(RemoteError),
    #[error("Connection closed before a result arrived")]
    ConnectionClosed,
    /// The server rejected the handshake the call was pipelined behind.
    #[error("Handshake failed; server wants protocol version {server_version}")]
    HandshakeFailed { server_version: String },
    #[error("Could not decode result: {0}")]
    Decode(String),
    #[error(transparent)]
    Send(#[from] DdpError),
}

pub type CallOutcome = Result<Value, CallError>;

/// One-shot completion for a pending call.
pub type Completion = Box<dyn FnOnce(CallOutcome) + Send>;

#[derive(Default)]
pub struct MethodRegistry {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, Completion>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh correlation id, unique for the lifetime of this registry.
    pub fn next_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub fn register(&self, id: impl Into<String>, completion: Completion) {
        let id = id.into();
        if lock(&self.pending).insert(id.clone(), completion).is_some() {
            log::warn!("Replaced pending completion for method id {id}");
        }
    }

    /// Drop a pending entry without running it. Used when the call could
    /// not be sent.
    pub fn unregister(&self, id: &str) -> bool {
        lock(&self.pending).remove(id).is_some()
    }

    /// Resolve the call named by `message.id`.
    ///
    /// The completion gets `Err(CallError::Remote)` when the body carries an
    /// `error` field and the `result` value (or `null`) otherwise. Returns
    /// `false` when nothing was pending for that id.
    pub fn resolve(&self, message: ResultMessage) -> bool {
        let Some(completion) = lock(&self.pending).remove(&message.id) else {
            log::debug!("Ignoring result for unknown method id {}", message.id);
            return false;
        };
        let outcome = match message.error {
            Some(error) => Err(CallError::Remote(RemoteError::from_value(error))),
            None => Ok(message.result.unwrap_or(Value::Null)),
        };
        completion(outcome);
        true
    }

    /// Complete every pending call with `error`, leaving the registry empty.
    pub fn fail_all(&self, error: CallError) -> usize {
        let drained: Vec<(String, Completion)> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (_, completion) in drained {
            completion(Err(error.clone()));
        }
        count
    }

    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.pending).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }
}
