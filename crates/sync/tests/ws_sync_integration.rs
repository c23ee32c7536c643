use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use taskdeck_sync::connection::SyncSignal;
use taskdeck_sync::hydration::HydrationScope;
use taskdeck_sync::rpc::RequestError;
use taskdeck_sync::store::ConnectionStatus;
use taskdeck_sync::{AppState, ClientConfig, Store, SyncClient};

const WAIT: Duration = Duration::from_secs(5);

// ── Test backend ────────────────────────────────────────────────────

enum ServerCommand {
    Text(String),
    Close,
}

/// Server side of one accepted client socket.
struct Peer {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<ServerCommand>,
}

impl Peer {
    async fn next_frame(&mut self) -> Value {
        let frame = timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client socket should stay open");
        serde_json::from_str(&frame).expect("client frames are json")
    }

    fn push(&self, value: Value) {
        let _ = self.outbound.send(ServerCommand::Text(value.to_string()));
    }

    fn close(&self) {
        let _ = self.outbound.send(ServerCommand::Close);
    }
}

struct Backend {
    addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<Peer>,
}

impl Backend {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let (peers_tx, peers) = mpsc::unbounded_channel();

        let app = Router::new()
            .route("/ws", get(ws_route))
            .route("/api/v1/executors", get(executors_route))
            .with_state(peers_tx);
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test backend should run");
        });

        Self { addr, peers }
    }

    async fn accept(&mut self) -> Peer {
        timeout(WAIT, self.peers.recv())
            .await
            .expect("timed out waiting for a client")
            .expect("backend should be running")
    }

    fn config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            backend_url: Some(format!("http://{}", self.addr)),
            request_timeout_ms: 5_000,
            ..ClientConfig::default()
        };
        config.reconnect.base_delay_ms = 20;
        config.reconnect.max_delay_ms = 100;
        config.hydration.routes =
            BTreeMap::from([("executors".to_string(), "/api/v1/executors".to_string())]);
        config
    }
}

async fn executors_route() -> Json<Value> {
    Json(json!({ "executors": [{ "id": "e0", "name": "hydrated" }] }))
}

async fn ws_route(ws: WebSocketUpgrade, State(peers): State<mpsc::UnboundedSender<Peer>>) -> Response {
    ws.on_upgrade(move |socket| serve_peer(socket, peers))
}

async fn serve_peer(socket: WebSocket, peers: mpsc::UnboundedSender<Peer>) {
    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (outbound, mut commands) = mpsc::unbounded_channel();
    if peers.send(Peer { inbound, outbound }).is_err() {
        return;
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ServerCommand::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound_tx.send(text.as_str().to_string());
                }
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn wait_for_state(store: &Store, mut predicate: impl FnMut(&AppState) -> bool) {
    let mut rx = store.subscribe();
    let _ = timeout(WAIT, rx.wait_for(|state| predicate(state)))
        .await
        .expect("timed out waiting for store state")
        .expect("store should be alive");
}

async fn next_signal(rx: &mut broadcast::Receiver<SyncSignal>) -> SyncSignal {
    timeout(WAIT, rx.recv()).await.expect("timed out waiting for signal").expect("signal channel open")
}

fn reply(request: &Value, payload: Value) -> Value {
    json!({
        "type": request["type"],
        "correlation_id": request["correlation_id"],
        "payload": payload,
    })
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn broadcasts_and_hydration_both_land_in_store() {
    let mut backend = Backend::start().await;
    let client = SyncClient::from_config(backend.config()).expect("valid config");
    let session = client.start(HydrationScope::default()).expect("session should start");

    let peer = backend.accept().await;
    peer.push(json!({ "type": "executor.created", "payload": { "id": "e1", "name": "live" } }));
    peer.push(json!({ "type": "executor.updated", "payload": { "id": "e1", "status": "ready" } }));

    wait_for_state(client.store(), |state| {
        state.executors.items.len() == 2
            && state.executors.get("e1").and_then(|e| e.status.as_deref()) == Some("ready")
    })
    .await;

    let snapshot = client.store().snapshot();
    assert_eq!(snapshot.executors.get("e0").and_then(|e| e.name.as_deref()), Some("hydrated"));
    assert_eq!(snapshot.executors.get("e1").and_then(|e| e.name.as_deref()), Some("live"));
    assert_eq!(snapshot.connection.status, ConnectionStatus::Connected);

    session.close().await;
}

#[tokio::test]
async fn concurrent_requests_resolve_regardless_of_reply_order() {
    let mut backend = Backend::start().await;
    let client = SyncClient::from_config(backend.config()).expect("valid config");
    let session = client.start(HydrationScope::default()).expect("session should start");
    let mut peer = backend.accept().await;
    wait_for_state(client.store(), |state| state.connection.status == ConnectionStatus::Connected).await;

    let server = async {
        let first = peer.next_frame().await;
        let second = peer.next_frame().await;
        for request in [&second, &first] {
            let payload = match request["payload"]["task_id"].as_str() {
                Some("t1") => json!({ "id": "p1", "content": "plan one" }),
                _ => json!({}),
            };
            peer.push(reply(request, payload));
        }
    };
    let (one, two, ()) = tokio::join!(client.get_task_plan("t1"), client.get_task_plan("t2"), server);

    let one = one.expect("t1 request should succeed").expect("t1 has a plan");
    assert_eq!(one.task_id, "t1");
    assert_eq!(one.content, "plan one");
    assert_eq!(two.expect("t2 request should succeed"), None);

    let snapshot = client.store().snapshot();
    assert!(matches!(snapshot.plans.by_task.get("t2"), Some(None)));
    assert!(snapshot.plans.loading.is_empty());
    assert_eq!(client.requests().in_flight(), 0);

    session.close().await;
}

#[tokio::test]
async fn server_error_reaches_the_caller() {
    let mut backend = Backend::start().await;
    let client = SyncClient::from_config(backend.config()).expect("valid config");
    let session = client.start(HydrationScope::default()).expect("session should start");
    let mut peer = backend.accept().await;
    wait_for_state(client.store(), |state| state.connection.status == ConnectionStatus::Connected).await;

    let server = async {
        let request = peer.next_frame().await;
        peer.push(reply(&request, json!({ "error": { "code": "NOT_FOUND", "message": "no such task" } })));
    };
    let (result, ()) = tokio::join!(client.get_task_plan("missing"), server);

    match result {
        Err(RequestError::Server(error)) => assert_eq!(error.code, "NOT_FOUND"),
        other => panic!("expected server error, got {other:?}"),
    }
    session.close().await;
}

#[tokio::test]
async fn reconnect_resubscribes_and_signals_resync() {
    let mut backend = Backend::start().await;
    let client = SyncClient::from_config(backend.config()).expect("valid config");
    let session = client.start(HydrationScope::default()).expect("session should start");
    let mut signals = session.signals();

    let mut first = backend.accept().await;
    assert_eq!(next_signal(&mut signals).await, SyncSignal::Connected);
    session.connection().subscribe_task("t1").expect("connection open");
    assert_eq!(first.next_frame().await["type"], "task.subscribe");

    // A request in flight when the link drops is rejected, not left hanging.
    let pending = client.get_task_plan("t1");
    let drop_link = async {
        first.next_frame().await;
        first.close();
    };
    let (result, ()) = tokio::join!(pending, drop_link);
    assert!(matches!(result, Err(RequestError::ConnectionLost { .. })));

    assert!(matches!(next_signal(&mut signals).await, SyncSignal::Disconnected { .. }));

    let mut second = backend.accept().await;
    let resubscribe = second.next_frame().await;
    assert_eq!(resubscribe["type"], "task.subscribe");
    assert_eq!(resubscribe["payload"]["task_id"], "t1");
    assert_eq!(next_signal(&mut signals).await, SyncSignal::Connected);
    assert_eq!(next_signal(&mut signals).await, SyncSignal::Resync);
    assert_eq!(client.store().snapshot().connection.resync_count, 1);

    session.close().await;
    assert_eq!(client.store().snapshot().connection.status, ConnectionStatus::Disconnected);
}
