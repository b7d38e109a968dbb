//! Routing behavior with no proxies in the chain: the conductor relays
//! between client and agent, preserving payloads and correlating by id.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use serde_json::{Value, json};

use acp_conductor::{
    ComponentConnection, ComponentConnector, ComponentInstantiator, ComponentSet, Conductor,
    ConductorConfig, MessageId, StaticComponents, WireMessage, wire,
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

async fn connected_agent(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<ComponentConnection>,
) -> Endpoint {
    Endpoint::new(within(rx.recv()).await.expect("agent connected"))
}

/// Initialize the chain and return the agent endpoint, asserting the agent
/// saw the client's params unchanged.
async fn initialize(
    client: &mut Endpoint,
    agent_rx: &mut tokio::sync::mpsc::UnboundedReceiver<ComponentConnection>,
) -> Endpoint {
    let init_id = client.send_request("initialize", Some(json!({"protocolVersion": 1})));
    let mut agent = connected_agent(agent_rx).await;
    let (id, method, params) = agent.recv_request().await;
    assert_eq!(method, "initialize");
    assert_eq!(params, Some(json!({"protocolVersion": 1})));
    agent.respond(id, json!({"protocolVersion": 1}));
    client
        .response_for(&init_id)
        .await
        .expect("initialize succeeds");
    agent
}

#[tokio::test]
async fn round_trip_preserves_methods_params_and_results() {
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![], agent_conn);
    let mut agent = initialize(&mut client, &mut agent_rx).await;

    let request_id = client.send_request("session/new", Some(json!({"cwd": "/work"})));
    let (id, method, params) = agent.recv_request().await;
    assert_eq!(method, "session/new");
    assert_eq!(params, Some(json!({"cwd": "/work"})));

    agent.respond(id, json!({"sessionId": "s-1"}));
    assert_eq!(
        client.response_for(&request_id).await.unwrap(),
        json!({"sessionId": "s-1"})
    );
}

#[tokio::test]
async fn notifications_flow_in_both_directions() {
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![], agent_conn);
    let mut agent = initialize(&mut client, &mut agent_rx).await;

    client.send_notification("session/cancel", Some(json!({"sessionId": "s-1"})));
    assert_eq!(
        agent.recv_notification().await,
        (
            "session/cancel".to_string(),
            Some(json!({"sessionId": "s-1"}))
        )
    );

    agent.send_notification("session/update", Some(json!({"kind": "text", "text": "hi"})));
    assert_eq!(
        client.recv_notification().await,
        (
            "session/update".to_string(),
            Some(json!({"kind": "text", "text": "hi"}))
        )
    );
}

#[tokio::test]
async fn agent_initiated_requests_are_answered_by_the_client() {
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![], agent_conn);
    let mut agent = initialize(&mut client, &mut agent_rx).await;

    let read_id = agent.send_request("fs/read_text_file", Some(json!({"path": "/a.txt"})));
    let (id, method, params) = client.recv_request().await;
    assert_eq!(method, "fs/read_text_file");
    assert_eq!(params, Some(json!({"path": "/a.txt"})));

    client.respond(id, json!({"content": "hello"}));
    assert_eq!(
        agent.response_for(&read_id).await.unwrap(),
        json!({"content": "hello"})
    );
}

#[tokio::test]
async fn concurrent_requests_resolve_regardless_of_response_order() {
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![], agent_conn);
    let mut agent = initialize(&mut client, &mut agent_rx).await;

    let first = client.send_request("op/first", None);
    let second = client.send_request("op/second", None);

    let (first_wire_id, method, _) = agent.recv_request().await;
    assert_eq!(method, "op/first");
    let (second_wire_id, method, _) = agent.recv_request().await;
    assert_eq!(method, "op/second");

    // Respond out of order; correlation is by id, not arrival order.
    agent.respond(second_wire_id, json!({"n": 2}));
    agent.respond(first_wire_id, json!({"n": 1}));

    assert_eq!(client.response_for(&first).await.unwrap(), json!({"n": 1}));
    assert_eq!(client.response_for(&second).await.unwrap(), json!({"n": 2}));
}

#[tokio::test]
async fn error_responses_propagate_unchanged() {
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![], agent_conn);
    let mut agent = initialize(&mut client, &mut agent_rx).await;

    let request_id = client.send_request("session/load", None);
    let (id, _, _) = agent.recv_request().await;
    agent.respond_with_error(id, wire::WireError::new(-32001, "no such session"));

    let err = client.response_for(&request_id).await.unwrap_err();
    assert_eq!(err.code, -32001);
    assert_eq!(err.message, "no such session");
}

#[tokio::test]
async fn requests_before_initialize_are_rejected() {
    let (agent_conn, _agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![], agent_conn);

    let request_id = client.send_request("session/new", None);
    let err = client.response_for(&request_id).await.unwrap_err();
    assert_eq!(err.code, wire::INVALID_REQUEST);
}

#[tokio::test]
async fn reserved_methods_from_the_client_are_rejected() {
    let (agent_conn, _agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![], agent_conn);

    let request_id = client.send_request(
        "_proxy/successor/request",
        Some(json!({"method": "initialize"})),
    );
    let err = client.response_for(&request_id).await.unwrap_err();
    assert_eq!(err.code, wire::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn stray_responses_are_dropped_without_breaking_the_session() {
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![], agent_conn);
    let mut agent = initialize(&mut client, &mut agent_rx).await;

    // No request with this id is outstanding.
    agent.respond(MessageId::Number(9999), json!({"stale": true}));

    let request_id = client.send_request("session/new", None);
    let (id, _, _) = agent.recv_request().await;
    agent.respond(id, json!({"sessionId": "s-2"}));
    assert_eq!(
        client.response_for(&request_id).await.unwrap(),
        json!({"sessionId": "s-2"})
    );
}

/// Builds the chain from the initialize request itself: as many
/// pass-through proxies as `params.proxyCount` asks for.
struct ProxyCountFromParams {
    agent: Option<ComponentConnector>,
    relayed: Arc<AtomicUsize>,
}

impl ComponentInstantiator for ProxyCountFromParams {
    fn instantiate(
        &mut self,
        initialize: &WireMessage,
    ) -> BoxFuture<'_, anyhow::Result<ComponentSet>> {
        let count = initialize
            .params
            .as_ref()
            .and_then(|p| p.get("proxyCount"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        Box::pin(async move {
            let agent = self
                .agent
                .take()
                .ok_or_else(|| anyhow::anyhow!("component set was already instantiated"))?;
            let proxies = (0..count)
                .map(|i| pass_through_proxy(&format!("proxy-{i}"), true, self.relayed.clone()))
                .collect();
            Ok(ComponentSet { proxies, agent })
        })
    }
}

#[tokio::test]
async fn instantiator_builds_the_chain_from_initialize_params() {
    let relayed = Arc::new(AtomicUsize::new(0));
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let instantiator = ProxyCountFromParams {
        agent: Some(agent_conn),
        relayed: relayed.clone(),
    };

    let (conductor_side, client_side) =
        ComponentConnection::in_memory_pair("client(conductor-end)", "client");
    tokio::spawn(Conductor::run(
        conductor_side,
        instantiator,
        ConductorConfig::default(),
    ));
    let mut client = Endpoint::new(client_side);

    let init_id = client.send_request(
        "initialize",
        Some(json!({"protocolVersion": 1, "proxyCount": 2})),
    );
    let mut agent = connected_agent(&mut agent_rx).await;
    let (id, method, _) = agent.recv_request().await;
    assert_eq!(method, "initialize");
    agent.respond(id, json!({"protocolVersion": 1}));
    client
        .response_for(&init_id)
        .await
        .expect("initialize succeeds");

    let request_id = client.send_request("session/new", None);
    let (id, _, _) = agent.recv_request().await;
    agent.respond(id, json!({"sessionId": "s-1"}));
    client.response_for(&request_id).await.unwrap();

    // Both materialized proxies relayed the request exactly once.
    assert_eq!(relayed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn in_flight_requests_fail_when_the_agent_goes_away() {
    let (agent_conn, mut agent_rx) = handoff_connector("agent");
    let mut client = start_conductor(vec![], agent_conn);
    let mut agent = initialize(&mut client, &mut agent_rx).await;

    let request_id = client.send_request("session/prompt", None);
    let _ = agent.recv_request().await;
    drop(agent);

    let err = client.response_for(&request_id).await.unwrap_err();
    assert_eq!(err.code, wire::INTERNAL_ERROR);
    assert!(client.closed().await, "session ends after the agent is gone");
}
