//! Shared harness for conductor integration tests: scripted endpoints for
//! the client/agent sides of in-memory connections, and a realistic
//! pass-through proxy component.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use acp_conductor::{
    ComponentConnection, ComponentConnector, MessageId, WireError, WireKind, WireMessage,
};

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("test timed out")
}

/// A connector whose peer connection is handed to the test once the
/// conductor connects it.
pub fn handoff_connector(
    label: &str,
) -> (ComponentConnector, mpsc::UnboundedReceiver<ComponentConnection>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = ComponentConnector::in_process(label, move |conn| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(conn);
        }
    });
    (connector, rx)
}

/// One scripted side of a connection: sends with its own id sequence,
/// receives with buffering so out-of-order arrivals can be awaited by id.
pub struct Endpoint {
    conn: ComponentConnection,
    next_id: i64,
    buffered: VecDeque<WireMessage>,
}

impl Endpoint {
    pub fn new(conn: ComponentConnection) -> Self {
        Endpoint {
            conn,
            next_id: 0,
            buffered: VecDeque::new(),
        }
    }

    pub fn send_request(&mut self, method: &str, params: Option<Value>) -> MessageId {
        self.next_id += 1;
        let id = MessageId::Number(self.next_id);
        self.conn
            .send(WireMessage::request(id.clone(), method, params))
            .expect("endpoint connection is open");
        id
    }

    pub fn send_notification(&self, method: &str, params: Option<Value>) {
        self.conn
            .send(WireMessage::notification(method, params))
            .expect("endpoint connection is open");
    }

    pub fn respond(&self, id: MessageId, result: Value) {
        self.conn
            .send(WireMessage::response(id, result))
            .expect("endpoint connection is open");
    }

    pub fn respond_with_error(&self, id: MessageId, error: WireError) {
        self.conn
            .send(WireMessage::error_response(id, error))
            .expect("endpoint connection is open");
    }

    pub async fn recv(&mut self) -> WireMessage {
        if let Some(message) = self.buffered.pop_front() {
            return message;
        }
        within(self.conn.recv())
            .await
            .expect("connection ended")
            .expect("transport error")
    }

    /// Next message, which must be a request.
    pub async fn recv_request(&mut self) -> (MessageId, String, Option<Value>) {
        let message = self.recv().await;
        match message.classify().expect("classifiable message") {
            WireKind::Request { id, method, params } => (id, method, params),
            other => panic!("expected a request, got {other:?}"),
        }
    }

    /// Next message, which must be a notification.
    pub async fn recv_notification(&mut self) -> (String, Option<Value>) {
        let message = self.recv().await;
        match message.classify().expect("classifiable message") {
            WireKind::Notification { method, params } => (method, params),
            other => panic!("expected a notification, got {other:?}"),
        }
    }

    /// Await the response to `id`, buffering any other traffic that
    /// arrives first.
    pub async fn response_for(&mut self, id: &MessageId) -> Result<Value, WireError> {
        let is_response_to = |message: &WireMessage| {
            message.id.as_ref() == Some(id) && message.method.is_none()
        };
        let message = match self.buffered.iter().position(is_response_to) {
            Some(pos) => self.buffered.remove(pos).expect("position is in range"),
            None => loop {
                let message = within(self.conn.recv())
                    .await
                    .expect("connection ended")
                    .expect("transport error");
                if is_response_to(&message) {
                    break message;
                }
                self.buffered.push_back(message);
            },
        };
        match message.classify() {
            Ok(WireKind::Response { payload, .. }) => payload,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    /// True once the inbound stream has ended.
    pub async fn closed(&mut self) -> bool {
        loop {
            match within(self.conn.recv()).await {
                None => return true,
                Some(Ok(message)) => self.buffered.push_back(message),
                Some(Err(_)) => return true,
            }
        }
    }
}

/// Build a pass-through proxy component. It relays everything it receives
/// back out under fresh ids (wrapped successor traffic toward its
/// successor, plain traffic toward its predecessor) and maps responses
/// back to the original requests. When `ack` is set it merges the
/// `_meta.proxy = true` acknowledgment into initialize responses, the way
/// a well-behaved proxy must.
///
/// `relayed` counts the non-initialize requests that passed through.
pub fn pass_through_proxy(label: &str, ack: bool, relayed: Arc<AtomicUsize>) -> ComponentConnector {
    ComponentConnector::in_process(label, move |conn| {
        run_proxy(conn, ack, relayed.clone())
    })
}

async fn run_proxy(mut conn: ComponentConnection, ack: bool, relayed: Arc<AtomicUsize>) {
    let mut next_id = 0i64;
    // forwarded id -> (original id, response needs the initialize ack)
    let mut inflight: std::collections::HashMap<MessageId, (MessageId, bool)> =
        std::collections::HashMap::new();

    while let Some(Ok(message)) = conn.recv().await {
        let Ok(kind) = message.classify() else {
            continue;
        };
        match kind {
            WireKind::Request { id, method, params } => {
                let inner_method = params
                    .as_ref()
                    .and_then(|p| p.get("method"))
                    .and_then(Value::as_str);
                let is_initialize = inner_method == Some("initialize");
                if !is_initialize {
                    relayed.fetch_add(1, Ordering::SeqCst);
                }

                next_id += 1;
                let fwd_id = MessageId::Number(next_id);
                inflight.insert(fwd_id.clone(), (id, is_initialize));
                if conn.send(WireMessage::request(fwd_id, method, params)).is_err() {
                    break;
                }
            }
            WireKind::Notification { method, params } => {
                if conn.send(WireMessage::notification(method, params)).is_err() {
                    break;
                }
            }
            WireKind::Response { id, payload } => {
                let Some((original_id, was_initialize)) = inflight.remove(&id) else {
                    continue;
                };
                let payload = match payload {
                    Ok(mut result) => {
                        if was_initialize && ack {
                            merge_proxy_ack(&mut result);
                        }
                        Ok(result)
                    }
                    Err(err) => Err(err),
                };
                if conn
                    .send(WireMessage::from_payload(original_id, payload))
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

fn merge_proxy_ack(result: &mut Value) {
    if let Value::Object(map) = result {
        let meta = map
            .entry("_meta".to_string())
            .or_insert_with(|| json!({}));
        if let Value::Object(meta) = meta {
            meta.insert("proxy".to_string(), Value::Bool(true));
        }
    }
}
