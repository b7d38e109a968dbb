//! HTTP bridge exposing the agent's MCP server to local MCP clients.
//!
//! MCP clients speak JSON-RPC over HTTP to the bridge; the bridge relays
//! each envelope to the agent over the existing agent connection as
//! `_mcp/*` traffic, by pushing events onto the conductor's queue and
//! waiting on a oneshot for the verdict. The routing loop stays the single
//! authority: the bridge never touches the agent connection directly.
//!
//! Surface:
//!
//! * `POST /mcp/connect` — body is the MCP `initialize` request envelope.
//!   On success the response envelope carries the agent's initialize result
//!   and the `Mcp-Connection-Id` header identifies the session.
//! * `POST /mcp/message` — body is any client-to-server envelope; requires
//!   the `Mcp-Connection-Id` header. Requests block until the agent
//!   responds; notifications are accepted immediately.
//! * `POST /mcp/disconnect` — ends the session; repeats are a no-op.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::conductor::ConductorMessage;
use crate::queue::QueueSender;
use crate::wire::{WireKind, WireMessage};

/// Response header (and request header on `message`/`disconnect`) carrying
/// the session id.
pub const CONNECTION_ID_HEADER: &str = "mcp-connection-id";

#[derive(Clone)]
struct BridgeState {
    queue: QueueSender,
}

pub fn router(queue: QueueSender) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/mcp/connect", post(connect))
        .route("/mcp/message", post(message))
        .route("/mcp/disconnect", post(disconnect))
        .with_state(BridgeState { queue })
}

/// Serve the bridge on an already-bound listener until the process exits.
pub async fn serve(listener: tokio::net::TcpListener, queue: QueueSender) -> anyhow::Result<()> {
    axum::serve(listener, router(queue)).await?;
    Ok(())
}

async fn connect(
    State(state): State<BridgeState>,
    headers: HeaderMap,
    Json(envelope): Json<WireMessage>,
) -> Response {
    let kind = match envelope.classify() {
        Ok(kind) => kind,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    let WireKind::Request { id, method, params } = kind else {
        return (
            StatusCode::BAD_REQUEST,
            "connect body must be a JSON-RPC request",
        )
            .into_response();
    };
    if method != "initialize" {
        return (
            StatusCode::BAD_REQUEST,
            format!("connect expects `initialize`, got `{method}`"),
        )
            .into_response();
    }

    // Callers may pin their own connection id; otherwise one is assigned.
    let connection_id =
        connection_id_from(&headers).unwrap_or_else(|| Uuid::new_v4().to_string());
    debug!(connection_id, "MCP connect received");
    let (reply_tx, reply_rx) = oneshot::channel();
    state.queue.push(ConductorMessage::McpConnectionReceived {
        connection_id: connection_id.clone(),
        params,
        reply: reply_tx,
    });

    match reply_rx.await {
        Ok(Ok(result)) => {
            info!(connection_id, "MCP connect accepted");
            (
                [(CONNECTION_ID_HEADER, connection_id)],
                Json(WireMessage::response(id, result)),
            )
                .into_response()
        }
        Ok(Err(err)) => Json(WireMessage::error_response(id, err)).into_response(),
        Err(_) => conductor_gone(),
    }
}

async fn message(
    State(state): State<BridgeState>,
    headers: HeaderMap,
    Json(envelope): Json<WireMessage>,
) -> Response {
    let Some(connection_id) = connection_id_from(&headers) else {
        return missing_header();
    };

    match envelope.classify() {
        Ok(WireKind::Request { id, method, params }) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            state.queue.push(ConductorMessage::McpClientToServer {
                connection_id,
                method,
                id: Some(id.clone()),
                params,
                reply: Some(reply_tx),
            });
            match reply_rx.await {
                Ok(payload) => Json(WireMessage::from_payload(id, payload)).into_response(),
                Err(_) => conductor_gone(),
            }
        }
        Ok(WireKind::Notification { method, params }) => {
            state.queue.push(ConductorMessage::McpClientToServer {
                connection_id,
                method,
                id: None,
                params,
                reply: None,
            });
            StatusCode::ACCEPTED.into_response()
        }
        Ok(WireKind::Response { .. }) => (
            StatusCode::BAD_REQUEST,
            "only client-to-server requests and notifications can be relayed",
        )
            .into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn disconnect(State(state): State<BridgeState>, headers: HeaderMap) -> Response {
    let Some(connection_id) = connection_id_from(&headers) else {
        return missing_header();
    };
    state
        .queue
        .push(ConductorMessage::McpConnectionDisconnected { connection_id });
    StatusCode::NO_CONTENT.into_response()
}

fn connection_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONNECTION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

fn missing_header() -> Response {
    (
        StatusCode::BAD_REQUEST,
        format!("missing {CONNECTION_ID_HEADER} header"),
    )
        .into_response()
}

fn conductor_gone() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "conductor is shutting down").into_response()
}
