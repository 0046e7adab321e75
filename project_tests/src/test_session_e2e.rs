//! # Session End-to-End Tests
//!
//! Runs the real `SessionSupervisor` with the test-pattern camera against an
//! in-process control plane built on `axum`: `POST /api/register-device`
//! hands out a token and a WebSocket URL, `GET /ws` upgrades and confirms the
//! session, then passes the socket to the test.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lib_common::camera::backends::TestPatternBackend;
use lib_common::camera::{CameraSource, SharedCamera};
use lib_common::configs::{AgentConfig, BackendKind};
use lib_common::session::{HttpControlPlane, SessionContext, SessionSupervisor, SupervisorState};
use lib_common::utils::misc::sys_info::HostTelemetry;

const API_KEY: &str = "e2e-key";

/// A confirmed session socket and the token it was opened with.
struct Session {
    token: String,
    socket: WebSocket,
}

#[derive(Clone)]
struct FakeServer {
    addr: SocketAddr,
    registrations: Arc<AtomicU32>,
    sessions: mpsc::UnboundedSender<Session>,
}

async fn register_device(
    State(server): State<FakeServer>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", API_KEY))
        .unwrap_or(false);
    let well_formed = body["device_id"] == "pi-e2e" && body["hardware_info"]["system_info"]["hostname"].is_string();
    if !authorized || !well_formed {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let n = server.registrations.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "token": format!("tok-{}", n),
        "websocket_url": format!("ws://{}/ws", server.addr),
    }))
    .into_response()
}

async fn open_session(
    State(server): State<FakeServer>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = params.get("token").cloned().unwrap_or_default();
    ws.on_upgrade(move |mut socket| async move {
        let confirmed = json!({"type": "connected", "message": "welcome"}).to_string();
        if socket.send(Message::Text(confirmed.into())).await.is_ok() {
            let _ = server.sessions.send(Session { token, socket });
        }
    })
}

async fn start_server() -> (FakeServer, mpsc::UnboundedReceiver<Session>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let server = FakeServer {
        addr,
        registrations: Arc::new(AtomicU32::new(0)),
        sessions: tx,
    };

    let app = Router::new()
        .route("/api/register-device", post(register_device))
        .route("/ws", get(open_session))
        .with_state(server.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (server, rx)
}

fn agent_config(server: &FakeServer, scratch: &Path) -> AgentConfig {
    AgentConfig {
        device_id: "pi-e2e".to_string(),
        api_server: format!("http://{}", server.addr),
        websocket_server: format!("ws://{}/unused", server.addr),
        api_key: API_KEY.to_string(),
        stream_width: 64,
        stream_height: 48,
        still_width: 128,
        still_height: 96,
        stream_fps: 10,
        camera_backends: vec![BackendKind::Test],
        temp_image_dir: scratch.to_path_buf(),
        reconnect_delay: Duration::from_secs(1),
        receive_timeout: Duration::from_millis(100),
        camera_health_interval: None,
        ..AgentConfig::default()
    }
}

fn start_agent(config: AgentConfig, shutdown: &CancellationToken) -> (JoinHandle<()>, tokio::sync::watch::Receiver<SupervisorState>) {
    let camera = CameraSource::new(vec![Box::new(TestPatternBackend::new())], &config.temp_image_dir)
        .with_cancellation(shutdown.clone());
    let control = Arc::new(HttpControlPlane::new(&config).unwrap());
    let ctx = SessionContext::new(config, SharedCamera::new(camera), Arc::new(HostTelemetry::new()));
    let supervisor = SessionSupervisor::new(ctx, control, shutdown.clone());
    let states = supervisor.subscribe();
    (tokio::spawn(supervisor.run()), states)
}

async fn next_session(sessions: &mut mpsc::UnboundedReceiver<Session>) -> Session {
    tokio::time::timeout(Duration::from_secs(15), sessions.recv())
        .await
        .expect("agent connected in time")
        .expect("server alive")
}

async fn send_json(socket: &mut WebSocket, value: Value) {
    socket.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Every text message received within `window`, decoded as JSON.
async fn collect_for(socket: &mut WebSocket, window: Duration) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + window;
    let mut out = Vec::new();
    while let Ok(Some(Ok(message))) = tokio::time::timeout_at(deadline, socket.recv()).await {
        if let Message::Text(text) = message {
            out.push(serde_json::from_str(text.as_str()).unwrap());
        }
    }
    out
}

/// First message of type `kind` within `window`.
async fn wait_for_type(socket: &mut WebSocket, kind: &str, window: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(Ok(message))) = tokio::time::timeout_at(deadline, socket.recv()).await {
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == kind {
                return Some(value);
            }
        }
    }
    None
}

fn frames_for<'a>(messages: &'a [Value], viewer: &str) -> Vec<&'a Value> {
    messages
        .iter()
        .filter(|m| m["type"] == "frame" && m["client_id"] == viewer)
        .collect()
}

#[tokio::test]
async fn serves_captures_and_concurrent_streams() {
    let (server, mut sessions) = start_server().await;
    let scratch = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let (agent, _states) = start_agent(agent_config(&server, scratch.path()), &shutdown);

    let Session { token, mut socket } = next_session(&mut sessions).await;
    assert_eq!(token, "tok-1");

    let status = wait_for_type(&mut socket, "status_update", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status["device_id"], "pi-e2e");
    assert!(status["uptime"].is_u64());

    send_json(&mut socket, json!({"type": "capture_request", "client_id": "browser-1"})).await;
    let image = wait_for_type(&mut socket, "image", Duration::from_secs(10)).await.unwrap();
    assert_eq!(image["requesting_client_id"], "browser-1");
    let jpeg = STANDARD.decode(image["image"].as_str().unwrap()).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    send_json(&mut socket, json!({"type": "stream_request", "client_id": "A"})).await;
    send_json(&mut socket, json!({"type": "stream_request", "client_id": "B"})).await;
    let both = collect_for(&mut socket, Duration::from_secs(1)).await;
    assert!(!frames_for(&both, "A").is_empty());
    assert!(!frames_for(&both, "B").is_empty());

    send_json(&mut socket, json!({"type": "stop_stream", "client_id": "A"})).await;
    let _ = collect_for(&mut socket, Duration::from_millis(300)).await;
    let after = collect_for(&mut socket, Duration::from_secs(1)).await;
    assert!(frames_for(&after, "A").is_empty());
    assert!(!frames_for(&after, "B").is_empty());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), agent).await.unwrap().unwrap();
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    assert_eq!(server.registrations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnects_with_the_same_token_after_server_hangup() {
    let (server, mut sessions) = start_server().await;
    let scratch = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let (agent, states) = start_agent(agent_config(&server, scratch.path()), &shutdown);

    let Session { token: first_token, socket: first_socket } = next_session(&mut sessions).await;
    drop(first_socket);

    let Session { token, mut socket } = next_session(&mut sessions).await;
    assert_eq!(token, first_token);
    assert_eq!(server.registrations.load(Ordering::SeqCst), 1);
    assert!(wait_for_type(&mut socket, "status_update", Duration::from_secs(5)).await.is_some());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), agent).await.unwrap().unwrap();
    assert_eq!(*states.borrow(), SupervisorState::ShuttingDown);
}
