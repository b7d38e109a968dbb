//! The in-process envelope the routing layer works on.
//!
//! A [`Dispatch`] is a wire message decoupled from its framing. Requests
//! carry a [`Responder`] instead of a bare id: the capability knows *how*
//! the reply gets delivered (back out a connection, or into an in-process
//! oneshot), so routing code never has to.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::component::ConnectionSender;
use crate::wire::{MessageId, WireError, WireMessage};

/// A normalized request, notification, or response moving through the
/// conductor.
#[derive(Debug)]
pub enum Dispatch {
    Request {
        id: MessageId,
        method: String,
        params: Option<Value>,
        responder: Responder,
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

/// A one-shot reply capability bound to a specific pending request.
///
/// Consuming `self` is what enforces the exactly-once contract: once a
/// dispatch is accepted for routing, its responder must be resolved via
/// [`respond`](Self::respond) or [`respond_with_error`](Self::respond_with_error),
/// never both and never twice.
pub struct Responder(ResponderInner);

enum ResponderInner {
    /// Reply by writing a wire response (with the original id) back to the
    /// connection the request arrived on.
    Connection {
        sender: ConnectionSender,
        id: MessageId,
    },
    /// Reply to an in-process caller (MCP bridge handler, handshake
    /// interception, tests).
    Channel(oneshot::Sender<Result<Value, WireError>>),
}

impl Responder {
    /// A responder that writes the reply back to `sender` under the wire id
    /// the peer chose.
    pub fn bound_to(sender: ConnectionSender, id: MessageId) -> Self {
        Responder(ResponderInner::Connection { sender, id })
    }

    /// A responder delivering into a oneshot; the receiver half observes the
    /// eventual result. Dropping the responder unresolved surfaces as a
    /// `RecvError` on that half.
    pub fn detached() -> (Self, oneshot::Receiver<Result<Value, WireError>>) {
        let (tx, rx) = oneshot::channel();
        (Responder::channel(tx), rx)
    }

    /// A responder delivering into an existing oneshot sender.
    pub fn channel(tx: oneshot::Sender<Result<Value, WireError>>) -> Self {
        Responder(ResponderInner::Channel(tx))
    }

    pub fn respond(self, result: Value) {
        self.respond_with_result(Ok(result));
    }

    pub fn respond_with_error(self, error: WireError) {
        self.respond_with_result(Err(error));
    }

    pub fn respond_with_result(self, payload: Result<Value, WireError>) {
        match self.0 {
            ResponderInner::Connection { sender, id } => {
                let message = WireMessage::from_payload(id.clone(), payload);
                if let Err(err) = sender.send(message) {
                    tracing::warn!(%id, %err, "dropping reply: connection is gone");
                }
            }
            ResponderInner::Channel(tx) => {
                if tx.send(payload).is_err() {
                    tracing::warn!("dropping reply: requester is gone");
                }
            }
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            ResponderInner::Connection { id, .. } => {
                f.debug_struct("Responder").field("wire_id", id).finish()
            }
            ResponderInner::Channel(_) => f.debug_struct("Responder").finish_non_exhaustive(),
        }
    }
}
