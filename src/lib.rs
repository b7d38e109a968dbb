//! A message-routing orchestrator for ACP component chains.
//!
//! The conductor sits between one client and one agent, threading an
//! ordered chain of proxy components between them:
//!
//! ```text
//! Client <-> Conductor <-> [Proxy...] <-> Agent
//! ```
//!
//! Each participant holds a single JSON-RPC connection to the conductor;
//! the conductor owns all routing, request correlation, and lifecycle. It
//! can additionally expose the agent's MCP server to local MCP clients
//! over HTTP (see [`mcp_bridge`]).
//!
//! The library surface exists so the conductor can be embedded: supply
//! your own [`ComponentInstantiator`] and in-memory connections instead of
//! spawned subprocesses. The binary in `main.rs` is a thin wrapper that
//! serves one session over stdio.

pub mod component;
pub mod conductor;
pub mod dispatch;
pub mod mcp_bridge;
pub mod message_log;
pub mod proxy_protocol;
pub mod queue;
pub mod wire;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

pub use component::{
    ComponentConnection, ComponentConnector, ComponentInstantiator, ComponentSet, ConnectionError,
    StaticComponents,
};
pub use conductor::{Conductor, ConductorConfig, ConductorMessage, RoleId, SourceIndex};
pub use dispatch::{Dispatch, Responder};
pub use message_log::{Direction, MessageLog};
pub use queue::{MessageQueue, QueueSender};
pub use wire::{MessageId, WireError, WireKind, WireMessage};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct ConductorArgs {
    /// Proxy command to insert into the chain; may repeat, in chain order
    #[arg(long = "proxy", value_name = "COMMAND")]
    pub proxies: Vec<String>,

    /// Bind address for the MCP-over-HTTP bridge (e.g. 127.0.0.1:8173)
    #[arg(long, value_name = "ADDR")]
    pub mcp_listen: Option<SocketAddr>,

    /// Write a replay log of routed messages to this file
    #[arg(long, value_name = "PATH")]
    pub message_log: Option<PathBuf>,

    /// Command line of the agent at the end of the chain
    pub agent: String,
}

impl ConductorArgs {
    /// Serve one conductor session over the process's stdio.
    pub async fn run(self) -> anyhow::Result<()> {
        let message_log = match &self.message_log {
            Some(path) => {
                let file = tokio::fs::File::create(path).await?;
                Some(MessageLog::to_writer(file))
            }
            None => None,
        };
        let config = ConductorConfig {
            mcp_listen: self.mcp_listen,
            message_log,
        };
        let components = ComponentSet {
            proxies: self
                .proxies
                .into_iter()
                .map(ComponentConnector::command)
                .collect(),
            agent: ComponentConnector::command(self.agent),
        };
        let client =
            ComponentConnection::from_io("client", tokio::io::stdout(), tokio::io::stdin());
        Conductor::run(client, StaticComponents::new(components), config).await
    }
}
