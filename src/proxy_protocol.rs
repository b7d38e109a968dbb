//! The `_proxy/successor/*` codec.
//!
//! A proxy has exactly one connection (to the conductor), so traffic headed
//! toward its successor must be distinguishable from traffic headed toward
//! its predecessor. Messages flowing left-to-right through a proxy are
//! wrapped under the reserved methods below; everything plain is
//! right-to-left. A pure pass-through proxy can therefore relay wrapped
//! messages without inspecting their payloads at all.
//!
//! The whole `_proxy/` namespace is reserved; application components must
//! not choose method names under it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wire::WireError;

pub const SUCCESSOR_REQUEST: &str = "_proxy/successor/request";
pub const SUCCESSOR_NOTIFICATION: &str = "_proxy/successor/notification";
pub const RESERVED_PREFIX: &str = "_proxy/";

/// The payload carried by both reserved methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessorPayload {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// True for any method in the reserved `_proxy/` namespace.
pub fn is_reserved(method: &str) -> bool {
    method.starts_with(RESERVED_PREFIX)
}

/// True exactly for the two successor-traffic methods. Callers must check
/// this before attempting [`unwrap`].
pub fn is_successor_message(method: &str) -> bool {
    method == SUCCESSOR_REQUEST || method == SUCCESSOR_NOTIFICATION
}

/// Wrap a request's method and params for delivery through a proxy.
pub fn wrap_request(method: String, params: Option<Value>) -> (String, Value) {
    let payload = SuccessorPayload { method, params };
    (
        SUCCESSOR_REQUEST.to_string(),
        serde_json::to_value(payload).expect("successor payload serializes"),
    )
}

/// Wrap a notification's method and params for delivery through a proxy.
pub fn wrap_notification(method: String, params: Option<Value>) -> (String, Value) {
    let payload = SuccessorPayload { method, params };
    (
        SUCCESSOR_NOTIFICATION.to_string(),
        serde_json::to_value(payload).expect("successor payload serializes"),
    )
}

/// Recover the inner method and params from a wrapped message's params.
/// Wrapping never loses information, so `unwrap(wrap(m, p)) == (m, p)`.
pub fn unwrap(params: Option<Value>) -> Result<(String, Option<Value>), WireError> {
    let params = params
        .ok_or_else(|| WireError::invalid_request("successor message is missing params"))?;
    let payload: SuccessorPayload = serde_json::from_value(params).map_err(|err| {
        WireError::invalid_request(format!("malformed successor payload: {err}"))
    })?;
    Ok((payload.method, payload.params))
}
