// Integration tests for the relay's HTTP surface
// A fake node connects over a real websocket; REST calls go through reqwest

use futures::{SinkExt, StreamExt};
use meshd::registry::ConnectionRegistry;
use meshd::relay::{Envelope, RequestDispatcher};
use meshd::server::routes::{ForwardResponse, PeerSummary};
use meshd::server::{self, AppState};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

struct Relay {
    addr: SocketAddr,
    registry: ConnectionRegistry,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start_relay() -> Relay {
    let registry = ConnectionRegistry::new();
    let dispatcher = RequestDispatcher::new(
        registry.clone(),
        Duration::from_secs(5),
        Duration::from_secs(10),
    );
    let shutdown = CancellationToken::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(server::serve(
        listener,
        AppState::new(dispatcher, shutdown.clone()),
    ));

    Relay {
        addr,
        registry,
        shutdown,
        handle,
    }
}

/// Open a node tunnel; returns the socket and the address the relay sees
async fn connect_node(relay: SocketAddr) -> (WebSocketStream<TcpStream>, SocketAddr) {
    let tcp = TcpStream::connect(relay).await.expect("connect");
    let local = tcp.local_addr().expect("node addr");
    let (ws, _) = tokio_tungstenite::client_async(format!("ws://{relay}/v1/tunnel"), tcp)
        .await
        .expect("websocket upgrade");
    (ws, local)
}

/// Read frames until the first relay request
async fn next_request(node: &mut WebSocketStream<TcpStream>) -> Envelope {
    while let Some(message) = node.next().await {
        if let Message::Text(text) = message.expect("frame") {
            return Envelope::decode(text.as_str()).expect("request envelope");
        }
    }
    panic!("tunnel closed before a request arrived");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forward_round_trip_over_tunnel() {
    let relay = start_relay().await;
    let (mut node, node_addr) = connect_node(relay.addr).await;

    let node_task = tokio::spawn(async move {
        let request = next_request(&mut node).await;
        assert_eq!(request.kind, "node_request");

        let reply = Envelope::reply(&request, 200, format!("echo:{}", request.message.data))
            .encode()
            .expect("encode");
        node.send(Message::Text(reply.into())).await.expect("send reply");
        node
    });

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/forward", relay.addr))
        .json(&json!({
            "ip": node_addr.ip().to_string(),
            "port": node_addr.port(),
            "body": "GET /v1/status",
            "timeoutMs": 2000
        }))
        .send()
        .await
        .expect("post");

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: ForwardResponse = response.json().await.expect("json");
    assert_eq!(body.status, "ok");
    assert_eq!(body.code, Some(200));
    assert_eq!(body.body, "echo:GET /v1/status");
    assert!(body.token.is_some());

    let _node = node_task.await.expect("node task");
    relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forward_carries_node_status() {
    let relay = start_relay().await;
    let (mut node, node_addr) = connect_node(relay.addr).await;

    let node_task = tokio::spawn(async move {
        let request = next_request(&mut node).await;
        let reply = Envelope::reply(&request, 404, "no such service")
            .encode()
            .expect("encode");
        node.send(Message::Text(reply.into())).await.expect("send reply");
        node
    });

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/forward", relay.addr))
        .json(&json!({
            "ip": node_addr.ip().to_string(),
            "port": node_addr.port(),
            "body": "GET /v1/unknown",
            "timeoutMs": 2000
        }))
        .send()
        .await
        .expect("post");

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: ForwardResponse = response.json().await.expect("json");
    assert_eq!(body.status, "ok");
    assert_eq!(body.code, Some(404));
    assert_eq!(body.body, "no such service");

    let _node = node_task.await.expect("node task");
    relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forward_to_silent_peer_times_out() {
    let relay = start_relay().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/v1/forward", relay.addr))
        .json(&json!({ "ip": "10.9.9.9", "port": 1234, "body": "ping", "timeoutMs": 50 }))
        .send()
        .await
        .expect("post");

    assert_eq!(response.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
    let body: ForwardResponse = response.json().await.expect("json");
    assert_eq!(body.status, "timeout");
    let token = body.token.expect("token");

    // The entry survives the timeout
    let peers: Vec<PeerSummary> = client
        .get(format!("http://{}/v1/peers", relay.addr))
        .send()
        .await
        .expect("get peers")
        .json()
        .await
        .expect("json");
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].ip, "10.9.9.9");
    assert_eq!(peers[0].port, 1234);
    assert_eq!(peers[0].token, token);
    assert!(!peers[0].attached);
    assert_eq!(peers[0].waiters, 0);

    relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_disconnect_cancels_forward() {
    let relay = start_relay().await;
    let (mut node, node_addr) = connect_node(relay.addr).await;

    let node_task = tokio::spawn(async move {
        next_request(&mut node).await;
        node.close(None).await.expect("close");
    });

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/forward", relay.addr))
        .json(&json!({
            "ip": node_addr.ip().to_string(),
            "port": node_addr.port(),
            "body": "slow",
            "timeoutMs": 10000
        }))
        .send()
        .await
        .expect("post");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    let body: ForwardResponse = response.json().await.expect("json");
    assert_eq!(body.status, "cancelled");

    node_task.await.expect("node task");
    relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forward_rejects_missing_peer() {
    let relay = start_relay().await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/forward", relay.addr))
        .json(&json!({ "ip": "", "port": 0, "body": "ping" }))
        .send()
        .await
        .expect("post");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: ForwardResponse = response.json().await.expect("json");
    assert_eq!(body.status, "invalid_argument");
    assert!(body.token.is_none());

    relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_endpoints() {
    let relay = start_relay().await;
    let client = reqwest::Client::new();
    let url = |path: &str| format!("http://{}{}", relay.addr, path);

    let ping = client.get(url("/v1/ping")).send().await.expect("ping");
    assert_eq!(ping.status(), reqwest::StatusCode::OK);

    let version = client.get(url("/v1/version")).send().await.expect("version");
    assert_eq!(version.text().await.expect("text"), env!("CARGO_PKG_VERSION"));

    let status = client.get(url("/v1/status")).send().await.expect("status");
    assert_eq!(status.status(), reqwest::StatusCode::NOT_FOUND);

    // A forward to a peer that never connected does not count as a node
    let forward = client
        .post(url("/v1/forward"))
        .json(&json!({ "ip": "10.9.9.9", "port": 1234, "body": "ping", "timeoutMs": 10 }))
        .send()
        .await
        .expect("forward");
    assert_eq!(forward.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
    let status = client.get(url("/v1/status")).send().await.expect("status");
    assert_eq!(status.status(), reqwest::StatusCode::NOT_FOUND);

    let (_node, _) = connect_node(relay.addr).await;
    let status = client.get(url("/v1/status")).send().await.expect("status");
    assert_eq!(status.status(), reqwest::StatusCode::OK);

    let unknown = client.get(url("/admin")).send().await.expect("fallback");
    assert_eq!(unknown.status(), reqwest::StatusCode::FORBIDDEN);

    relay.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_open_tunnels() {
    let relay = start_relay().await;
    let (mut node, _) = connect_node(relay.addr).await;

    relay.shutdown.cancel();

    let stopped = tokio::time::timeout(Duration::from_secs(5), relay.handle)
        .await
        .expect("server stopped in time")
        .expect("server task");
    assert!(stopped.is_ok());

    // The node observes the tunnel going away
    let next = tokio::time::timeout(Duration::from_secs(5), node.next())
        .await
        .expect("tunnel end observed");
    assert!(!matches!(next, Some(Ok(Message::Text(_)))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registry_reconnect_drops_previous_tunnel() {
    let relay = start_relay().await;
    let (mut old_node, _) = connect_node(relay.addr).await;

    // Peers are keyed by remote address, so a reconnect from the same
    // address is simulated through the registry the relay serves
    let peers: Vec<PeerSummary> = reqwest::get(format!("http://{}/v1/peers", relay.addr))
        .await
        .expect("get peers")
        .json()
        .await
        .expect("json");
    assert_eq!(peers.len(), 1);
    assert!(peers[0].attached);

    let replacement = meshd::relay::TunnelSession::on_connect(
        &relay.registry,
        &peers[0].ip,
        peers[0].port,
    )
    .expect("reconnect");
    assert_ne!(replacement.token(), peers[0].token);

    // The old tunnel is closed by the relay
    let next = tokio::time::timeout(Duration::from_secs(5), old_node.next())
        .await
        .expect("old tunnel end observed");
    assert!(!matches!(next, Some(Ok(Message::Text(_)))));

    relay.shutdown.cancel();
}
