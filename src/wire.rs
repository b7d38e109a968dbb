//! The JSON-RPC wire envelope exchanged with every component.
//!
//! One shape serves all three message kinds: a request has `id` + `method`,
//! a notification has `method` without `id`, and a response has `id` with
//! exactly one of `result`/`error`. [`WireMessage::classify`] is the single
//! place that distinction is made; everything downstream works on the
//! classified form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC message id. The conductor mints string (UUID) ids for its own
/// outgoing requests but must round-trip whatever ids its peers choose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        MessageId::Number(n)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId::String(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId::String(s)
    }
}

/// A JSON-RPC error object, used both on the wire and as the error half of
/// every internally routed response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

impl WireError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "parse error")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// The envelope serialized as one line of newline-delimited JSON on every
/// transport. Fields that are absent on the wire stay `None` here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// A [`WireMessage`] broken down by kind, after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum WireKind {
    Request {
        id: MessageId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: MessageId,
        payload: Result<Value, WireError>,
    },
}

impl WireMessage {
    pub fn request(id: impl Into<MessageId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response(id: MessageId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: MessageId, error: WireError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    pub fn from_payload(id: MessageId, payload: Result<Value, WireError>) -> Self {
        match payload {
            Ok(result) => Self::response(id, result),
            Err(error) => Self::error_response(id, error),
        }
    }

    /// Determine which of the three message kinds this envelope is.
    ///
    /// Shapes that fit none of them (missing version, a response carrying
    /// both `result` and `error`, an id-only message, ...) are rejected so
    /// that the routing layer never has to second-guess a message.
    pub fn classify(self) -> Result<WireKind, WireError> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(WireError::invalid_request(format!(
                "unsupported jsonrpc version: {:?}",
                self.jsonrpc
            )));
        }

        match (self.id, self.method, self.result, self.error) {
            (Some(id), Some(method), None, None) => Ok(WireKind::Request {
                id,
                method,
                params: self.params,
            }),
            (None, Some(method), None, None) => Ok(WireKind::Notification {
                method,
                params: self.params,
            }),
            (Some(id), None, Some(result), None) => Ok(WireKind::Response {
                id,
                payload: Ok(result),
            }),
            (Some(id), None, None, Some(error)) => Ok(WireKind::Response {
                id,
                payload: Err(error),
            }),
            _ => Err(WireError::invalid_request(
                "message is not a request, notification, or response",
            )),
        }
    }
}
