//! Connections to the components of a chain, and the connectors that
//! produce them.
//!
//! A [`ComponentConnection`] is the one channel abstraction the routing
//! layer sees: an outbound `send`, an inbound stream of parsed wire
//! messages, and an idempotent `close`. The two connector implementations
//! (spawned subprocess speaking newline-delimited JSON over its stdio, and
//! an in-memory pair for embedding and tests) differ only in what backs the
//! channels.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::wire::WireMessage;

/// Transport-level failures. These travel the inbound stream's error path;
/// they never crash the conductor, but they do terminate the connection
/// they occurred on.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("transport i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot spawn component `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unparseable component command: {0:?}")]
    BadCommand(String),
}

/// The outbound half of a connection. Cloneable so that responders and the
/// routing loop can write to the same peer independently.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    tx: mpsc::UnboundedSender<Result<WireMessage, ConnectionError>>,
    closed: watch::Receiver<bool>,
}

impl ConnectionSender {
    /// Queue a message for delivery. Fire-and-forget: this waits for
    /// nothing, it only fails if the connection is already closed.
    pub fn send(&self, message: WireMessage) -> Result<(), ConnectionError> {
        if *self.closed.borrow() {
            return Err(ConnectionError::Closed);
        }
        self.tx
            .send(Ok(message))
            .map_err(|_| ConnectionError::Closed)
    }
}

/// Idempotent close signal for a connection. Closing unblocks any consumer
/// suspended on the inbound stream and, for subprocess connections, kills
/// the child.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The inbound half of a connection: parsed wire messages in arrival order,
/// or a [`ConnectionError`] when the transport misbehaves. Ends (`None`)
/// when the peer goes away or the connection is closed.
#[derive(Debug)]
pub struct InboundStream {
    rx: mpsc::UnboundedReceiver<Result<WireMessage, ConnectionError>>,
    closed: watch::Receiver<bool>,
}

impl InboundStream {
    pub async fn next(&mut self) -> Option<Result<WireMessage, ConnectionError>> {
        // Deliver anything already buffered before honoring a close signal,
        // so messages sent just before a close are not lost.
        match self.rx.try_recv() {
            Ok(item) => return Some(item),
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => return None,
        }
        if *self.closed.borrow() {
            return None;
        }
        tokio::select! {
            closed = async { self.closed.wait_for(|closed| *closed).await.is_ok() } => {
                if closed {
                    self.rx.try_recv().ok()
                } else {
                    // Close handle dropped without closing: keep draining
                    // until the senders are gone.
                    self.rx.recv().await
                }
            }
            message = self.rx.recv() => message,
        }
    }
}

/// A live, bidirectional connection to one component (or to the upstream
/// client, which uses the identical abstraction).
#[derive(Debug)]
pub struct ComponentConnection {
    name: String,
    sender: ConnectionSender,
    inbound: InboundStream,
    close: CloseHandle,
}

impl ComponentConnection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, message: WireMessage) -> Result<(), ConnectionError> {
        self.sender.send(message)
    }

    pub async fn recv(&mut self) -> Option<Result<WireMessage, ConnectionError>> {
        self.inbound.next().await
    }

    pub fn close(&self) {
        self.close.close();
    }

    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Split into the pieces the conductor needs: the loop keeps the sender
    /// and close handle, a spawned reader task owns the inbound stream.
    pub fn into_parts(self) -> (ConnectionSender, InboundStream, CloseHandle) {
        (self.sender, self.inbound, self.close)
    }

    /// A connected pair of endpoints with FIFO delivery in each direction
    /// and no serialization.
    pub fn in_memory_pair(a: &str, b: &str) -> (ComponentConnection, ComponentConnection) {
        let (a_in_tx, a_in_rx) = mpsc::unbounded_channel();
        let (b_in_tx, b_in_rx) = mpsc::unbounded_channel();
        let (a_close_tx, a_close_rx) = watch::channel(false);
        let (b_close_tx, b_close_rx) = watch::channel(false);

        let side = |name: &str,
                    out_tx: mpsc::UnboundedSender<_>,
                    in_rx: mpsc::UnboundedReceiver<_>,
                    close_tx: watch::Sender<bool>,
                    close_rx: watch::Receiver<bool>| {
            ComponentConnection {
                name: name.to_string(),
                sender: ConnectionSender {
                    tx: out_tx,
                    closed: close_rx.clone(),
                },
                inbound: InboundStream {
                    rx: in_rx,
                    closed: close_rx,
                },
                close: CloseHandle {
                    tx: Arc::new(close_tx),
                },
            }
        };

        (
            side(a, b_in_tx, a_in_rx, a_close_tx, a_close_rx),
            side(b, a_in_tx, b_in_rx, b_close_tx, b_close_rx),
        )
    }

    /// A connection framed as newline-delimited JSON over an arbitrary
    /// byte stream pair. Spawns the writer and reader tasks that own the
    /// raw I/O; closing the connection stops both.
    pub fn from_io(
        name: impl Into<String>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        let name = name.into();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);

        tokio::spawn(write_frames(
            name.clone(),
            writer,
            out_rx,
            in_tx.clone(),
            close_rx.clone(),
        ));
        tokio::spawn(read_frames(name.clone(), reader, in_tx, close_rx.clone()));

        ComponentConnection {
            name,
            sender: ConnectionSender {
                tx: out_tx,
                closed: close_rx.clone(),
            },
            inbound: InboundStream {
                rx: in_rx,
                closed: close_rx,
            },
            close: CloseHandle {
                tx: Arc::new(close_tx),
            },
        }
    }

    fn closed_watch(&self) -> watch::Receiver<bool> {
        self.sender.closed.clone()
    }
}

/// Serializes outgoing messages, one JSON object per line.
async fn write_frames(
    name: String,
    mut writer: impl AsyncWrite + Unpin,
    mut out_rx: mpsc::UnboundedReceiver<Result<WireMessage, ConnectionError>>,
    in_tx: mpsc::UnboundedSender<Result<WireMessage, ConnectionError>>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            // Flush whatever was queued before the close, then stop.
            _ = close_rx.wait_for(|closed| *closed) => match out_rx.try_recv() {
                Ok(Ok(message)) => message,
                _ => break,
            },
            item = out_rx.recv() => match item {
                Some(Ok(message)) => message,
                Some(Err(_)) | None => break,
            },
        };

        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(err) => {
                warn!(connection = %name, %err, "failed to serialize outgoing message");
                continue;
            }
        };
        line.push(b'\n');

        if let Err(err) = writer.write_all(&line).await {
            // Broken pipe: report on the inbound error path and stop.
            let _ = in_tx.send(Err(ConnectionError::Io(err)));
            break;
        }
        if let Err(err) = writer.flush().await {
            let _ = in_tx.send(Err(ConnectionError::Io(err)));
            break;
        }
    }
}

/// Parses incoming lines into wire messages. Partial lines are buffered by
/// the underlying reader until a full line is available; a malformed line
/// is reported as an error and terminates the stream.
async fn read_frames(
    name: String,
    reader: impl AsyncRead + Unpin,
    in_tx: mpsc::UnboundedSender<Result<WireMessage, ConnectionError>>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = close_rx.wait_for(|closed| *closed) => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WireMessage>(&line) {
                    Ok(message) => {
                        if in_tx.send(Ok(message)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(connection = %name, %err, "malformed frame");
                        let _ = in_tx.send(Err(ConnectionError::MalformedFrame(line)));
                        break;
                    }
                }
            }
            // EOF: peer is gone.
            Ok(None) => break,
            Err(err) => {
                let _ = in_tx.send(Err(ConnectionError::Io(err)));
                break;
            }
        }
    }
}

type ConnectionHandler = Box<dyn FnMut(ComponentConnection) -> BoxFuture<'static, ()> + Send>;

/// In-memory connector state. Holds at most one pending peer endpoint;
/// callers must retrieve it right after `connect()`, before connecting
/// again on the same connector.
pub struct InMemoryConnector {
    label: String,
    handler: Option<ConnectionHandler>,
    pending_peer: Option<ComponentConnection>,
}

/// Specifies how to reach a component. `connect()` can be called more than
/// once and yields independent connections each time.
pub enum ComponentConnector {
    /// Spawn the given command line and speak ndjson over its stdio.
    Command(String),

    /// In-process endpoints, for embedding components and for tests.
    InMemory(InMemoryConnector),
}

impl ComponentConnector {
    pub fn command(command: impl Into<String>) -> Self {
        ComponentConnector::Command(command.into())
    }

    /// A connector whose peer endpoint is handed back through
    /// [`take_peer`](Self::take_peer) after each `connect()`.
    pub fn in_memory(label: impl Into<String>) -> Self {
        ComponentConnector::InMemory(InMemoryConnector {
            label: label.into(),
            handler: None,
            pending_peer: None,
        })
    }

    /// A connector that serves each new peer endpoint with `handler`,
    /// spawned as its own task.
    pub fn in_process<F, Fut>(label: impl Into<String>, mut handler: F) -> Self
    where
        F: FnMut(ComponentConnection) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        ComponentConnector::InMemory(InMemoryConnector {
            label: label.into(),
            handler: Some(Box::new(move |conn| Box::pin(handler(conn)))),
            pending_peer: None,
        })
    }

    /// A component that echoes every inbound message back verbatim.
    pub fn echo(label: impl Into<String>) -> Self {
        Self::in_process(label, |mut conn: ComponentConnection| async move {
            while let Some(Ok(message)) = conn.recv().await {
                if conn.send(message).is_err() {
                    break;
                }
            }
        })
    }

    pub async fn connect(&mut self) -> Result<ComponentConnection, ConnectionError> {
        match self {
            ComponentConnector::Command(command) => connect_command(command).await,
            ComponentConnector::InMemory(inner) => {
                let local_name = format!("{}(conductor-end)", inner.label);
                let (local, peer) = ComponentConnection::in_memory_pair(&local_name, &inner.label);
                match &mut inner.handler {
                    Some(handler) => {
                        tokio::spawn(handler(peer));
                    }
                    None => {
                        if inner.pending_peer.is_some() {
                            warn!(label = %inner.label, "unretrieved peer endpoint replaced");
                        }
                        inner.pending_peer = Some(peer);
                    }
                }
                Ok(local)
            }
        }
    }

    /// Retrieve the peer endpoint created by the most recent `connect()` on
    /// an in-memory connector. The slot holds exactly one pending value.
    pub fn take_peer(&mut self) -> Option<ComponentConnection> {
        match self {
            ComponentConnector::Command(_) => None,
            ComponentConnector::InMemory(inner) => inner.pending_peer.take(),
        }
    }
}

async fn connect_command(command: &str) -> Result<ComponentConnection, ConnectionError> {
    let argv = shlex::split(command)
        .filter(|argv| !argv.is_empty())
        .ok_or_else(|| ConnectionError::BadCommand(command.to_string()))?;

    let mut child = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|source| ConnectionError::Spawn {
            command: command.to_string(),
            source,
        })?;

    let stdin = child.stdin.take().expect("child stdin was piped");
    let stdout = child.stdout.take().expect("child stdout was piped");

    let connection = ComponentConnection::from_io(command, stdin, stdout);

    // Tie the child's lifetime to the connection: closing kills it, exiting
    // on its own simply ends the inbound stream via EOF.
    let mut closed = connection.closed_watch();
    let name = connection.name.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            status = child.wait() => {
                debug!(connection = %name, ?status, "component process exited");
            }
        }
    });

    Ok(connection)
}

/// The components of one conductor session, in chain order.
pub struct ComponentSet {
    pub proxies: Vec<ComponentConnector>,
    pub agent: ComponentConnector,
}

/// Produces the component set for a session, lazily, from the client's raw
/// `initialize` request. Implementations may inspect the request's params
/// to decide which proxies and agent to use.
pub trait ComponentInstantiator: Send {
    fn instantiate(&mut self, initialize: &WireMessage)
    -> BoxFuture<'_, anyhow::Result<ComponentSet>>;
}

/// The fixed component set used by the CLI: the configured proxy commands
/// plus the agent command, regardless of what the initialize request says.
pub struct StaticComponents(Option<ComponentSet>);

impl StaticComponents {
    pub fn new(set: ComponentSet) -> Self {
        Self(Some(set))
    }
}

impl ComponentInstantiator for StaticComponents {
    fn instantiate(
        &mut self,
        _initialize: &WireMessage,
    ) -> BoxFuture<'_, anyhow::Result<ComponentSet>> {
        Box::pin(async move {
            self.0
                .take()
                .ok_or_else(|| anyhow::anyhow!("component set was already instantiated"))
        })
    }
}
