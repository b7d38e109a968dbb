//! Chains with proxies: the capability handshake, successor wrapping, and
//! exactly-once delivery through multiple hops.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use acp_conductor::{
    ComponentConnection, ComponentConnector, ComponentSet, Conductor, ConductorConfig,
    StaticComponents, wire,
};
use common::{Endpoint, handoff_connector, pass_through_proxy, within};

fn start_conductor(proxies: Vec<ComponentConnector>, agent: ComponentConnector) -> Endpoint {
    let (conductor_side, client_side) =
        ComponentConnection::in_memory_pair("client(conductor-end)", "client");
    let components = ComponentSet { proxies, agent };
    tokio::spawn(Conductor::run(
        conductor_side,
        StaticComponents::new(components),
        ConductorConfig::default(),
    ));
    Endpoint::new(client_side)
}

#[tokio::test]
async fn handshake_succeeds_and_capability_metadata_never_leaks() {
    let relayed = Arc::new(AtomicUsize::new(0));
    let proxy = pass_through_proxy("proxy-0", true, relayed);
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![proxy], agent_conn);

    let init_id = client.send_request("initialize", Some(json!({"protocolVersion": 1})));
    let mut agent = Endpoint::new(within(agent_rx.recv()).await.expect("agent connected"));

    let (id, method, params) = agent.recv_request().await;
    assert_eq!(method, "initialize");
    let params = params.expect("initialize params");
    assert!(
        params.get("_meta").is_none(),
        "capability offer must not reach the agent"
    );
    assert_eq!(params["protocolVersion"], 1);

    agent.respond(id, json!({"protocolVersion": 1, "agentCapabilities": {}}));
    let result = client.response_for(&init_id).await.expect("initialize succeeds");
    // The proxy's acknowledgment is conductor bookkeeping; the client sees
    // the agent's result as-is.
    assert_eq!(result, json!({"protocolVersion": 1, "agentCapabilities": {}}));
}

#[tokio::test]
async fn missing_acknowledgment_fails_initialize() {
    let relayed = Arc::new(AtomicUsize::new(0));
    let proxy = pass_through_proxy("legacy-proxy", false, relayed);
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![proxy], agent_conn);

    let init_id = client.send_request("initialize", Some(json!({"protocolVersion": 1})));
    let mut agent = Endpoint::new(within(agent_rx.recv()).await.expect("agent connected"));
    let (id, _, _) = agent.recv_request().await;
    agent.respond(id, json!({"protocolVersion": 1}));

    let err = client.response_for(&init_id).await.unwrap_err();
    assert_eq!(err.code, wire::INTERNAL_ERROR);
    assert!(
        err.message.contains("did not accept proxy capability"),
        "unexpected message: {}",
        err.message
    );
    assert!(client.closed().await, "failed handshake ends the session");
}

#[tokio::test]
async fn requests_traverse_each_proxy_exactly_once() {
    let first_count = Arc::new(AtomicUsize::new(0));
    let second_count = Arc::new(AtomicUsize::new(0));
    let proxies = vec![
        pass_through_proxy("proxy-0", true, first_count.clone()),
        pass_through_proxy("proxy-1", true, second_count.clone()),
    ];
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(proxies, agent_conn);

    let init_id = client.send_request("initialize", Some(json!({"protocolVersion": 1})));
    let mut agent = Endpoint::new(within(agent_rx.recv()).await.expect("agent connected"));
    let (id, method, _) = agent.recv_request().await;
    assert_eq!(method, "initialize");
    agent.respond(id, json!({"protocolVersion": 1}));
    client.response_for(&init_id).await.expect("initialize succeeds");

    let prompt_id = client.send_request("session/prompt", Some(json!({"text": "hello"})));
    let (id, method, params) = agent.recv_request().await;
    assert_eq!(method, "session/prompt");
    assert_eq!(params, Some(json!({"text": "hello"})));
    agent.respond(id, json!({"stopReason": "end_turn"}));

    assert_eq!(
        client.response_for(&prompt_id).await.unwrap(),
        json!({"stopReason": "end_turn"})
    );
    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn right_to_left_traffic_crosses_the_chain() {
    let relayed = Arc::new(AtomicUsize::new(0));
    let proxy = pass_through_proxy("proxy-0", true, relayed);
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![proxy], agent_conn);

    let init_id = client.send_request("initialize", Some(json!({"protocolVersion": 1})));
    let mut agent = Endpoint::new(within(agent_rx.recv()).await.expect("agent connected"));
    let (id, _, _) = agent.recv_request().await;
    agent.respond(id, json!({"protocolVersion": 1}));
    client.response_for(&init_id).await.expect("initialize succeeds");

    // Agent-initiated request, answered by the client across the proxy.
    let read_id = agent.send_request("fs/read_text_file", Some(json!({"path": "/x"})));
    let (id, method, params) = client.recv_request().await;
    assert_eq!(method, "fs/read_text_file");
    assert_eq!(params, Some(json!({"path": "/x"})));
    client.respond(id, json!({"content": "data"}));
    assert_eq!(
        agent.response_for(&read_id).await.unwrap(),
        json!({"content": "data"})
    );

    // Agent-initiated notification reaches the client once.
    agent.send_notification("session/update", Some(json!({"kind": "text"})));
    assert_eq!(
        client.recv_notification().await,
        ("session/update".to_string(), Some(json!({"kind": "text"})))
    );
}
