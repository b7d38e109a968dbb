//! The conductor: orchestrates a chain of proxy components between one
//! upstream client and one downstream agent.
//!
//! ```text
//! Client <-> [Proxy 0] <-> [Proxy 1] <-> ... <-> Agent
//! ```
//!
//! Every participant connects to the conductor alone; the chain topology is
//! the conductor's doing. Each connection gets a reader task that turns
//! every inbound message into a [`ConductorMessage`] on the shared queue,
//! and a single loop consumes that queue. That loop is the one place
//! routing decisions happen, which is what makes the ordering guarantee
//! hold: events are processed in exactly the order they were pushed, and
//! nothing else touches the pending-request tables or the component set.
//!
//! ## Traffic direction and the successor wrapping
//!
//! A proxy has one connection, so the two directions of traffic flowing
//! through it must be told apart by the messages themselves:
//!
//! * Everything moving **left-to-right** (client toward agent) through a
//!   proxy is wrapped under `_proxy/successor/*` (see
//!   [`crate::proxy_protocol`]). A pure pass-through proxy can relay those
//!   wrapped messages verbatim without reading their payloads. When the
//!   conductor receives a wrapped message back from proxy `i`, it unwraps
//!   it and forwards to hop `i + 1`. The agent, being terminal, always
//!   receives plain messages.
//! * Everything **right-to-left** (agent toward client) is plain. A plain
//!   request or notification from hop `i` is forwarded to hop `i - 1`, or
//!   to the client when `i` is 0.
//!
//! ## Correlation
//!
//! For every request the conductor originates it mints a fresh UUID id and
//! records the dispatch's [`Responder`] in the destination's pending table.
//! Components on either side may pick overlapping id spaces; the minted ids
//! keep them from ever colliding inside the conductor. A response resolves
//! its entry exactly once; a response with no entry is logged and dropped,
//! never fatal.
//!
//! ## Initialization
//!
//! The chain is built lazily when the client's first `initialize` request
//! arrives: the [`ComponentInstantiator`] may inspect that request to
//! choose the components. Initialize requests bound for a proxy carry the
//! `_meta.proxy = true` capability offer; each proxy must echo the flag in
//! its response or the client's initialize fails with an error and the
//! chain is poisoned.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::component::{
    CloseHandle, ComponentConnection, ComponentInstantiator, ComponentSet, ConnectionSender,
    InboundStream,
};
use crate::dispatch::{Dispatch, Responder};
use crate::message_log::{Direction, MessageLog};
use crate::proxy_protocol;
use crate::queue::{MessageQueue, QueueSender};
use crate::wire::{MessageId, WireError, WireKind, WireMessage};

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_MCP_CONNECT: &str = "_mcp/connect";
pub const METHOD_MCP_MESSAGE: &str = "_mcp/message";
pub const METHOD_MCP_DISCONNECT: &str = "_mcp/disconnect";

/// The protocol roles a participant can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleId {
    Client,
    Proxy,
    Agent,
    Conductor,
}

impl RoleId {
    /// The fixed peer a response from this role routes back toward.
    pub fn counterpart(self) -> RoleId {
        match self {
            RoleId::Client => RoleId::Agent,
            RoleId::Agent => RoleId::Client,
            RoleId::Proxy => RoleId::Conductor,
            RoleId::Conductor => RoleId::Client,
        }
    }
}

/// Which participant produced a right-to-left message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceIndex {
    Proxy(usize),
    Agent,
}

impl SourceIndex {
    pub fn role(self) -> RoleId {
        match self {
            SourceIndex::Proxy(_) => RoleId::Proxy,
            SourceIndex::Agent => RoleId::Agent,
        }
    }

    fn hop_index(self, hop_count: usize) -> usize {
        match self {
            SourceIndex::Proxy(i) => i,
            SourceIndex::Agent => hop_count - 1,
        }
    }
}

/// Events consumed by the conductor's routing loop. Producers are the
/// per-connection reader tasks and the MCP bridge's HTTP handlers.
#[derive(Debug)]
pub enum ConductorMessage {
    /// A message bound for hop `target` (0 = first hop, last = agent).
    /// Pushed by the client's reader with `target = 0`; a response variant
    /// is the client answering a request the conductor forwarded to it.
    LeftToRight { target: usize, dispatch: Dispatch },

    /// A message arriving from a hop, destined back toward the client (or
    /// toward the hop's predecessor).
    RightToLeft {
        source: SourceIndex,
        dispatch: Dispatch,
    },

    /// A new MCP session wants to attach. The loop issues `_mcp/connect`
    /// to the agent; `reply` eventually receives the agent's verdict.
    McpConnectionReceived {
        connection_id: String,
        params: Option<Value>,
        reply: oneshot::Sender<Result<Value, WireError>>,
    },

    /// The agent answered `_mcp/connect`; register the session and release
    /// the waiting HTTP caller.
    McpConnectionEstablished {
        connection_id: String,
        result: Result<Value, WireError>,
        reply: oneshot::Sender<Result<Value, WireError>>,
    },

    /// An MCP-client message for an established session, to be relayed to
    /// the agent as `_mcp/message`. `reply` is `Some` for inner requests,
    /// `None` for inner notifications.
    McpClientToServer {
        connection_id: String,
        method: String,
        id: Option<MessageId>,
        params: Option<Value>,
        reply: Option<oneshot::Sender<Result<Value, WireError>>>,
    },

    /// An MCP session went away (explicitly or at the transport level).
    /// Repeats for the same id are a no-op.
    McpConnectionDisconnected { connection_id: String },

    /// Terminates the loop. Injected by [`QueueSender::close`]; never
    /// yielded to the loop by the queue itself.
    Shutdown,
}

/// Conductor construction options.
#[derive(Debug, Default)]
pub struct ConductorConfig {
    /// Bind address for the MCP bridge listener; `None` disables the
    /// bridge.
    pub mcp_listen: Option<SocketAddr>,

    /// Diagnostic replay log for routed messages.
    pub message_log: Option<MessageLog>,
}

/// One entry in a pending-request table: how to deliver the eventual
/// response, and whether it must carry the proxy-capability acknowledgment.
#[derive(Debug)]
struct PendingEntry {
    responder: Responder,
    method: String,
    expect_proxy_ack: bool,
}

/// A connected participant the loop can send to: its outbound half, its
/// close handle, and the table of requests the conductor has in flight
/// toward it.
#[derive(Debug)]
struct Link {
    role: RoleId,
    name: String,
    sender: ConnectionSender,
    close: CloseHandle,
    pending: HashMap<MessageId, PendingEntry>,
}

impl Link {
    fn new(role: RoleId, name: String, sender: ConnectionSender, close: CloseHandle) -> Self {
        Link {
            role,
            name,
            sender,
            close,
            pending: HashMap::new(),
        }
    }
}

/// Bridge-side state for one established MCP session.
#[derive(Debug)]
struct McpConnection {
    established_at: Instant,
}

/// Where a reader task's traffic originates, which determines the queue
/// event it becomes.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Client,
    Hop(SourceIndex),
}

pub struct Conductor {
    queue_tx: QueueSender,
    instantiator: Box<dyn ComponentInstantiator>,
    message_log: Option<MessageLog>,

    /// Proxies in chain order, then the agent; empty until the first
    /// `initialize` arrives.
    hops: Vec<Link>,
    instantiated: bool,

    /// Set when the capability handshake failed; nothing is forwarded to a
    /// poisoned chain.
    chain_failed: bool,

    /// Established MCP sessions, keyed by connection id.
    mcp_connections: HashMap<String, McpConnection>,
}

impl Conductor {
    /// Serve a session over `client` until it disconnects or the queue is
    /// closed. Components are produced lazily by `instantiator`.
    pub async fn run(
        client: ComponentConnection,
        instantiator: impl ComponentInstantiator + 'static,
        config: ConductorConfig,
    ) -> anyhow::Result<()> {
        Self::run_with_queue(MessageQueue::new(), client, instantiator, config).await
    }

    /// Like [`run`](Self::run), but over a caller-provided queue. Useful
    /// when external producers (an already-bound MCP bridge, tests) need a
    /// [`QueueSender`] before the loop starts.
    pub async fn run_with_queue(
        queue: MessageQueue,
        client: ComponentConnection,
        instantiator: impl ComponentInstantiator + 'static,
        config: ConductorConfig,
    ) -> anyhow::Result<()> {
        let queue_tx = queue.sender();

        if let Some(addr) = config.mcp_listen {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(addr = %listener.local_addr()?, "MCP bridge listening");
            tokio::spawn(crate::mcp_bridge::serve(listener, queue_tx.clone()));
        }

        let client_name = client.name().to_string();
        let (sender, inbound, close) = client.into_parts();
        let client_link = Link::new(RoleId::Client, client_name, sender.clone(), close.clone());
        tokio::spawn(pump_connection(
            Origin::Client,
            sender,
            inbound,
            close,
            queue_tx.clone(),
        ));

        let conductor = Conductor {
            queue_tx,
            instantiator: Box::new(instantiator),
            message_log: config.message_log,
            hops: Vec::new(),
            instantiated: false,
            chain_failed: false,
            mcp_connections: HashMap::new(),
        };
        conductor.serve(queue, client_link).await
    }

    /// The single consuming loop: the authority for ordering and routing.
    async fn serve(mut self, mut queue: MessageQueue, mut client: Link) -> anyhow::Result<()> {
        info!("conductor ready, awaiting client traffic");
        while let Some(event) = queue.next().await {
            self.handle(&mut client, event).await;
        }
        self.shutdown(client);
        Ok(())
    }

    async fn handle(&mut self, client: &mut Link, event: ConductorMessage) {
        debug!(?event, "conductor event");
        match event {
            ConductorMessage::LeftToRight { target, dispatch } => {
                self.handle_left_to_right(client, target, dispatch).await;
            }
            ConductorMessage::RightToLeft { source, dispatch } => {
                self.handle_right_to_left(client, source, dispatch);
            }
            ConductorMessage::McpConnectionReceived {
                connection_id,
                params,
                reply,
            } => self.handle_mcp_connect(connection_id, params, reply),
            ConductorMessage::McpConnectionEstablished {
                connection_id,
                result,
                reply,
            } => self.handle_mcp_established(connection_id, result, reply),
            ConductorMessage::McpClientToServer {
                connection_id,
                method,
                id,
                params,
                reply,
            } => self.handle_mcp_message(connection_id, method, id, params, reply),
            ConductorMessage::McpConnectionDisconnected { connection_id } => {
                self.handle_mcp_disconnect(connection_id);
            }
            // The queue terminates on Shutdown without yielding it.
            ConductorMessage::Shutdown => {}
        }
    }

    async fn handle_left_to_right(&mut self, client: &mut Link, target: usize, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Request {
                id,
                method,
                params,
                responder,
            } => {
                if proxy_protocol::is_reserved(&method) {
                    responder.respond_with_error(WireError::method_not_found(&method));
                    return;
                }
                if !self.instantiated {
                    if method != METHOD_INITIALIZE {
                        responder.respond_with_error(WireError::invalid_request(format!(
                            "`{method}` received before initialize"
                        )));
                        return;
                    }
                    let raw = WireMessage::request(id, method.clone(), params.clone());
                    if let Err(err) = self.instantiate_chain(&raw).await {
                        responder.respond_with_error(err);
                        return;
                    }
                }
                self.forward_request(target, method, params, responder);
            }
            Dispatch::Notification { method, params } => {
                if proxy_protocol::is_reserved(&method) {
                    warn!(method, "dropping reserved-method notification from client");
                    return;
                }
                if !self.instantiated {
                    warn!(method, "dropping notification received before initialize");
                    return;
                }
                self.forward_notification(target, method, params);
            }
            // The client answering a request that was forwarded to it.
            Dispatch::Response { id, payload } => {
                resolve_response(client, id, payload);
            }
        }
    }

    fn handle_right_to_left(&mut self, client: &mut Link, source: SourceIndex, dispatch: Dispatch) {
        let hop = source.hop_index(self.hops.len());
        match dispatch {
            Dispatch::Response { id, payload } => {
                let Some(entry) = self.hops[hop].pending.remove(&id) else {
                    // Possibly a late duplicate from a slow component; a
                    // stray response must never take the chain down.
                    warn!(
                        %id,
                        endpoint = %self.hops[hop].name,
                        "response for unknown id, discarding"
                    );
                    return;
                };
                if entry.expect_proxy_ack {
                    self.finish_proxy_initialize(hop, entry, payload);
                } else {
                    entry.responder.respond_with_result(payload);
                }
            }
            Dispatch::Request {
                id: _,
                method,
                params,
                responder,
            } => {
                if proxy_protocol::is_successor_message(&method) {
                    match source {
                        SourceIndex::Proxy(i) => match proxy_protocol::unwrap(params) {
                            Ok((inner_method, inner_params)) => {
                                self.forward_request(i + 1, inner_method, inner_params, responder);
                            }
                            Err(err) => responder.respond_with_error(err),
                        },
                        SourceIndex::Agent => {
                            warn!(method, "agent sent successor-protocol method");
                            responder.respond_with_error(WireError::invalid_request(format!(
                                "`{method}` is reserved for proxies"
                            )));
                        }
                    }
                } else if proxy_protocol::is_reserved(&method) {
                    responder.respond_with_error(WireError::method_not_found(&method));
                } else {
                    self.forward_upstream_request(client, hop, method, params, responder);
                }
            }
            Dispatch::Notification { method, params } => {
                if proxy_protocol::is_successor_message(&method) {
                    match source {
                        SourceIndex::Proxy(i) => match proxy_protocol::unwrap(params) {
                            Ok((inner_method, inner_params)) => {
                                self.forward_notification(i + 1, inner_method, inner_params);
                            }
                            Err(err) => warn!(%err, "dropping malformed successor notification"),
                        },
                        SourceIndex::Agent => {
                            warn!(method, "dropping successor-protocol notification from agent");
                        }
                    }
                } else if proxy_protocol::is_reserved(&method) {
                    warn!(method, "dropping reserved-method notification");
                } else {
                    self.forward_upstream_notification(client, hop, method, params);
                }
            }
        }
    }

    /// Instantiate and connect the component chain, triggered by the
    /// client's first `initialize` request. The raw request is handed to
    /// the instantiator so it can choose components dynamically.
    async fn instantiate_chain(&mut self, initialize: &WireMessage) -> Result<(), WireError> {
        info!("instantiating component chain");
        let ComponentSet { proxies, agent } = self
            .instantiator
            .instantiate(initialize)
            .await
            .map_err(|err| {
                WireError::internal_error(format!("component instantiation failed: {err}"))
            })?;

        let proxy_count = proxies.len();
        let connectors = proxies
            .into_iter()
            .enumerate()
            .map(|(i, connector)| (RoleId::Proxy, SourceIndex::Proxy(i), format!("proxy-{i}"), connector))
            .chain(std::iter::once((
                RoleId::Agent,
                SourceIndex::Agent,
                "agent".to_string(),
                agent,
            )));

        for (role, source, name, mut connector) in connectors {
            match connector.connect().await {
                Ok(connection) => self.add_hop(role, source, name, connection),
                Err(err) => {
                    warn!(component = %name, %err, "failed to connect component");
                    // Tear down whatever partially came up; their readers
                    // will close the queue and end the session.
                    for hop in &self.hops {
                        hop.close.close();
                    }
                    return Err(WireError::internal_error(format!(
                        "failed to connect component `{name}`: {err}"
                    )));
                }
            }
        }

        self.instantiated = true;
        info!(proxies = proxy_count, "component chain connected");
        Ok(())
    }

    fn add_hop(&mut self, role: RoleId, source: SourceIndex, name: String, connection: ComponentConnection) {
        let (sender, inbound, close) = connection.into_parts();
        tokio::spawn(pump_connection(
            Origin::Hop(source),
            sender.clone(),
            inbound,
            close.clone(),
            self.queue_tx.clone(),
        ));
        self.hops.push(Link::new(role, name, sender, close));
    }

    /// Send a request left-to-right to hop `target`, minting a local id and
    /// recording the responder in that hop's pending table. Requests bound
    /// for a proxy are wrapped as successor traffic; the agent gets them
    /// plain. `initialize` additionally carries the proxy-capability offer
    /// (proxies) or has it stripped (agent).
    fn forward_request(
        &mut self,
        target: usize,
        method: String,
        mut params: Option<Value>,
        responder: Responder,
    ) {
        if self.chain_failed {
            responder.respond_with_error(WireError::internal_error(
                "proxy chain failed during initialization",
            ));
            return;
        }
        if target >= self.hops.len() {
            responder.respond_with_error(WireError::internal_error(format!(
                "no component at chain position {target}"
            )));
            return;
        }

        let is_agent = target + 1 == self.hops.len();
        let mut expect_proxy_ack = false;
        if method == METHOD_INITIALIZE {
            if is_agent {
                retract_proxy_capability(&mut params);
            } else {
                params = Some(offer_proxy_capability(params));
                expect_proxy_ack = true;
            }
        }

        let (wire_method, wire_params) = if is_agent {
            (method.clone(), params)
        } else {
            let (m, p) = proxy_protocol::wrap_request(method.clone(), params);
            (m, Some(p))
        };

        send_correlated_request(
            self.message_log.as_ref(),
            Direction::LeftToRight,
            &mut self.hops[target],
            wire_method,
            wire_params,
            PendingEntry {
                responder,
                method,
                expect_proxy_ack,
            },
        );
    }

    fn forward_notification(&mut self, target: usize, method: String, params: Option<Value>) {
        if self.chain_failed {
            warn!(method, "dropping notification for poisoned chain");
            return;
        }
        if target >= self.hops.len() {
            warn!(method, target, "dropping notification for nonexistent hop");
            return;
        }

        let is_agent = target + 1 == self.hops.len();
        let (wire_method, wire_params) = if is_agent {
            (method, params)
        } else {
            let (m, p) = proxy_protocol::wrap_notification(method, params);
            (m, Some(p))
        };

        send_notification(
            self.message_log.as_ref(),
            Direction::LeftToRight,
            &mut self.hops[target],
            wire_method,
            wire_params,
        );
    }

    /// Route a plain request from hop `from` one step toward the client.
    fn forward_upstream_request(
        &mut self,
        client: &mut Link,
        from: usize,
        method: String,
        params: Option<Value>,
        responder: Responder,
    ) {
        let destination = if from == 0 {
            client
        } else {
            &mut self.hops[from - 1]
        };
        send_correlated_request(
            self.message_log.as_ref(),
            Direction::RightToLeft,
            destination,
            method.clone(),
            params,
            PendingEntry {
                responder,
                method,
                expect_proxy_ack: false,
            },
        );
    }

    fn forward_upstream_notification(
        &mut self,
        client: &mut Link,
        from: usize,
        method: String,
        params: Option<Value>,
    ) {
        let destination = if from == 0 {
            client
        } else {
            &mut self.hops[from - 1]
        };
        send_notification(
            self.message_log.as_ref(),
            Direction::RightToLeft,
            destination,
            method,
            params,
        );
    }

    /// A proxy answered its (wrapped) initialize. The response must carry
    /// the `_meta.proxy = true` acknowledgment; the flag is stripped before
    /// relaying upstream, since it is conductor-to-proxy bookkeeping.
    fn finish_proxy_initialize(
        &mut self,
        hop: usize,
        entry: PendingEntry,
        payload: Result<Value, WireError>,
    ) {
        match payload {
            Ok(mut result) => {
                if accepted_proxy_capability(&mut result) {
                    debug!(component = %self.hops[hop].name, "proxy capability acknowledged");
                    entry.responder.respond(result);
                } else {
                    let name = self.hops[hop].name.clone();
                    warn!(component = %name, "initialize response lacks proxy acknowledgment");
                    entry.responder.respond_with_error(WireError::internal_error(format!(
                        "component `{name}` did not accept proxy capability"
                    )));
                    self.poison_chain();
                }
            }
            // Downstream errors propagate unchanged.
            Err(err) => entry.responder.respond_with_error(err),
        }
    }

    /// Stop forwarding to a chain whose handshake failed, and wind the
    /// session down. The error response to the originating initialize is
    /// already on its way to the client; closing the queue afterwards lets
    /// it drain out first.
    fn poison_chain(&mut self) {
        self.chain_failed = true;
        for hop in &self.hops {
            hop.close.close();
        }
        self.queue_tx.close();
    }

    fn handle_mcp_connect(
        &mut self,
        connection_id: String,
        params: Option<Value>,
        reply: oneshot::Sender<Result<Value, WireError>>,
    ) {
        if !self.instantiated || self.chain_failed || self.hops.is_empty() {
            let _ = reply.send(Err(WireError::internal_error(
                "agent is not available for MCP connections",
            )));
            return;
        }

        // Ask the agent to accept the session; once its verdict arrives,
        // re-enter the loop so the registration happens in order with
        // everything else.
        let (responder, verdict_rx) = Responder::detached();
        let queue_tx = self.queue_tx.clone();
        let id = connection_id.clone();
        tokio::spawn(async move {
            let result = match verdict_rx.await {
                Ok(result) => result,
                Err(_) => Err(WireError::internal_error(
                    "agent connection lost before `_mcp/connect` was answered",
                )),
            };
            queue_tx.push(ConductorMessage::McpConnectionEstablished {
                connection_id: id,
                result,
                reply,
            });
        });

        let mut connect_params = serde_json::Map::new();
        connect_params.insert("connectionId".to_string(), json!(connection_id));
        if let Some(params) = params {
            connect_params.insert("initialize".to_string(), params);
        }

        let agent = self.hops.last_mut().expect("chain is instantiated");
        send_correlated_request(
            self.message_log.as_ref(),
            Direction::RightToLeft,
            agent,
            METHOD_MCP_CONNECT.to_string(),
            Some(Value::Object(connect_params)),
            PendingEntry {
                responder,
                method: METHOD_MCP_CONNECT.to_string(),
                expect_proxy_ack: false,
            },
        );
    }

    fn handle_mcp_established(
        &mut self,
        connection_id: String,
        result: Result<Value, WireError>,
        reply: oneshot::Sender<Result<Value, WireError>>,
    ) {
        match result {
            Ok(value) => {
                info!(connection_id, "MCP connection established");
                self.mcp_connections.insert(
                    connection_id,
                    McpConnection {
                        established_at: Instant::now(),
                    },
                );
                let _ = reply.send(Ok(value));
            }
            Err(err) => {
                warn!(connection_id, %err, "MCP connection rejected");
                let _ = reply.send(Err(err));
            }
        }
    }

    fn handle_mcp_message(
        &mut self,
        connection_id: String,
        method: String,
        id: Option<MessageId>,
        params: Option<Value>,
        reply: Option<oneshot::Sender<Result<Value, WireError>>>,
    ) {
        if !self.mcp_connections.contains_key(&connection_id) {
            warn!(connection_id, method, "MCP message for unknown connection");
            if let Some(reply) = reply {
                let _ = reply.send(Err(WireError::invalid_request(format!(
                    "unknown MCP connection id: {connection_id}"
                ))));
            }
            return;
        }

        let mut message_params = serde_json::Map::new();
        message_params.insert("connectionId".to_string(), json!(connection_id));
        message_params.insert("method".to_string(), json!(method));
        if let Some(id) = &id {
            message_params.insert("id".to_string(), json!(id));
        }
        if let Some(params) = params {
            message_params.insert("params".to_string(), params);
        }
        let wire_params = Some(Value::Object(message_params));

        let agent = self.hops.last_mut().expect("connections imply a chain");
        match reply {
            Some(reply) => send_correlated_request(
                self.message_log.as_ref(),
                Direction::RightToLeft,
                agent,
                METHOD_MCP_MESSAGE.to_string(),
                wire_params,
                PendingEntry {
                    responder: Responder::channel(reply),
                    method,
                    expect_proxy_ack: false,
                },
            ),
            None => send_notification(
                self.message_log.as_ref(),
                Direction::RightToLeft,
                agent,
                METHOD_MCP_MESSAGE.to_string(),
                wire_params,
            ),
        }
    }

    fn handle_mcp_disconnect(&mut self, connection_id: String) {
        match self.mcp_connections.remove(&connection_id) {
            Some(connection) => {
                info!(
                    connection_id,
                    lived = ?connection.established_at.elapsed(),
                    "MCP connection disconnected"
                );
                let agent = self.hops.last_mut().expect("connections imply a chain");
                send_notification(
                    self.message_log.as_ref(),
                    Direction::RightToLeft,
                    agent,
                    METHOD_MCP_DISCONNECT.to_string(),
                    Some(json!({"connectionId": connection_id})),
                );
            }
            // Second disconnect for the same id is a no-op, not an error.
            None => debug!(connection_id, "disconnect for unknown connection, ignoring"),
        }
    }

    /// Close every connection and fail whatever is still in flight. A hop
    /// that never responds would otherwise leave its requester waiting
    /// forever, so outstanding entries get a synthesized error response.
    fn shutdown(mut self, mut client: Link) {
        info!("conductor shutting down");
        for link in std::iter::once(&mut client).chain(self.hops.iter_mut()) {
            for (_, entry) in link.pending.drain() {
                debug!(method = %entry.method, endpoint = %link.name, "failing in-flight request at shutdown");
                entry.responder.respond_with_error(WireError::internal_error(
                    "conductor shut down before the component responded",
                ));
            }
        }
        for link in std::iter::once(&client).chain(self.hops.iter()) {
            link.close.close();
        }
    }
}

/// Resolve a response arriving at `link` against its pending table.
fn resolve_response(link: &mut Link, id: MessageId, payload: Result<Value, WireError>) {
    let Some(entry) = link.pending.remove(&id) else {
        warn!(%id, endpoint = %link.name, role = ?link.role, "response for unknown id, discarding");
        return;
    };
    debug!(
        method = %entry.method,
        endpoint = %link.name,
        back_toward = ?link.role.counterpart(),
        "resolving response"
    );
    entry.responder.respond_with_result(payload);
}

/// Mint a local id, record the pending entry, and send the request. The
/// minted id gives every hop its own id namespace, so components choosing
/// overlapping ids never collide in the conductor's tables.
fn send_correlated_request(
    log: Option<&MessageLog>,
    direction: Direction,
    link: &mut Link,
    wire_method: String,
    wire_params: Option<Value>,
    entry: PendingEntry,
) {
    let local_id = MessageId::String(Uuid::new_v4().to_string());
    let wire = WireMessage::request(local_id.clone(), wire_method, wire_params);
    if let Some(log) = log {
        log.record(direction, &link.name, &wire);
    }
    match link.sender.send(wire) {
        Ok(()) => {
            link.pending.insert(local_id, entry);
        }
        Err(err) => {
            warn!(endpoint = %link.name, %err, "request could not be sent");
            entry.responder.respond_with_error(WireError::internal_error(format!(
                "component `{}` is unreachable",
                link.name
            )));
        }
    }
}

fn send_notification(
    log: Option<&MessageLog>,
    direction: Direction,
    link: &mut Link,
    method: String,
    params: Option<Value>,
) {
    let wire = WireMessage::notification(method, params);
    if let Some(log) = log {
        log.record(direction, &link.name, &wire);
    }
    if let Err(err) = link.sender.send(wire) {
        warn!(endpoint = %link.name, %err, "notification could not be sent");
    }
}

/// Reader task: one per connection. Every inbound message becomes a queue
/// event before any routing decision is made. When the connection ends
/// (peer exit, transport failure, protocol violation) the session winds
/// down: close the connection and the queue; the loop's shutdown pass
/// fails anything still pending.
async fn pump_connection(
    origin: Origin,
    sender: ConnectionSender,
    mut inbound: InboundStream,
    close: CloseHandle,
    queue: QueueSender,
) {
    while let Some(item) = inbound.next().await {
        match item {
            Ok(wire) => {
                let wire_id = wire.id.clone();
                match wire.classify() {
                    Ok(kind) => {
                        let dispatch = to_dispatch(kind, &sender);
                        let event = match origin {
                            Origin::Client => ConductorMessage::LeftToRight {
                                target: 0,
                                dispatch,
                            },
                            Origin::Hop(source) => {
                                ConductorMessage::RightToLeft { source, dispatch }
                            }
                        };
                        queue.push(event);
                    }
                    Err(err) => {
                        warn!(?origin, %err, "unroutable message shape, terminating connection");
                        if let Some(id) = wire_id {
                            let _ = sender.send(WireMessage::error_response(id, err));
                        }
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(?origin, %err, "transport failure, terminating connection");
                break;
            }
        }
    }
    debug!(?origin, "connection ended");
    close.close();
    queue.close();
}

fn to_dispatch(kind: WireKind, sender: &ConnectionSender) -> Dispatch {
    match kind {
        WireKind::Request { id, method, params } => Dispatch::Request {
            responder: Responder::bound_to(sender.clone(), id.clone()),
            id,
            method,
            params,
        },
        WireKind::Notification { method, params } => Dispatch::Notification { method, params },
        WireKind::Response { id, payload } => Dispatch::Response { id, payload },
    }
}

const META_KEY: &str = "_meta";
const PROXY_FLAG: &str = "proxy";

/// Add `_meta.proxy = true` to initialize params bound for a proxy.
fn offer_proxy_capability(params: Option<Value>) -> Value {
    let mut params = match params {
        Some(params @ Value::Object(_)) => params,
        // Initialize params are an object by convention; anything else is
        // replaced wholesale, there is nowhere to attach the offer.
        _ => json!({}),
    };
    if let Value::Object(map) = &mut params {
        let meta = map
            .entry(META_KEY.to_string())
            .or_insert_with(|| json!({}));
        if let Value::Object(meta) = meta {
            meta.insert(PROXY_FLAG.to_string(), Value::Bool(true));
        }
    }
    params
}

/// Remove the proxy offer from initialize params bound for the agent.
fn retract_proxy_capability(params: &mut Option<Value>) {
    if let Some(Value::Object(map)) = params {
        if let Some(Value::Object(meta)) = map.get_mut(META_KEY) {
            meta.remove(PROXY_FLAG);
            if meta.is_empty() {
                map.remove(META_KEY);
            }
        }
    }
}

/// Check for (and strip) the `_meta.proxy = true` acknowledgment in a
/// proxy's initialize response.
fn accepted_proxy_capability(result: &mut Value) -> bool {
    let Value::Object(map) = result else {
        return false;
    };
    let Some(Value::Object(meta)) = map.get_mut(META_KEY) else {
        return false;
    };
    let accepted = meta.get(PROXY_FLAG) == Some(&Value::Bool(true));
    meta.remove(PROXY_FLAG);
    if meta.is_empty() {
        map.remove(META_KEY);
    }
    accepted
}
