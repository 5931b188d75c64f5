//! Shared utilities for integration tests: a mock upstream API and a proxy
//! running on ephemeral ports.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_key_proxy::config::{Credential, ProxyConfig};
use api_key_proxy::lifecycle::Shutdown;
use api_key_proxy::net::Listener;
use api_key_proxy::HttpServer;
use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

pub const TEST_KEY: &str = "test-key";

/// One request as the mock upstream received it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What happened on the mock upstream's WebSocket endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    Connected { uri: String },
    Text(String),
    Closed(Option<(u16, String)>),
}

#[derive(Clone)]
struct MockState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    ws_events: mpsc::UnboundedSender<WsEvent>,
    ws_handshake_delay: Duration,
    release_stream: Arc<Notify>,
    stream_dropped: Arc<Notify>,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    pub ws_events: mpsc::UnboundedReceiver<WsEvent>,
    /// Lets `/stream` send its second chunk.
    pub release_stream: Arc<Notify>,
    /// Fires when the `/stream` body is dropped, finished or not.
    pub stream_dropped: Arc<Notify>,
}

impl MockUpstream {
    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub async fn next_ws_event(&mut self) -> WsEvent {
        tokio::time::timeout(Duration::from_secs(5), self.ws_events.recv())
            .await
            .expect("timed out waiting for upstream websocket event")
            .expect("mock upstream dropped")
    }
}

/// Start a mock upstream on an ephemeral port.
///
/// - `/ws/{*rest}`: WebSocket echo (`echo:<text>`); the text `close-me` makes it
///   close with 4000 "bye". The handshake answer is held for `ws_handshake_delay`.
/// - `/status/{code}`: answers with that status.
/// - `/stream`: sends `first`, waits for `release_stream`, sends `second`.
/// - `/broken`: sends `partial`, then fails the body.
/// - anything else: 200 with `{"ok":true}`.
pub async fn start_mock_upstream(ws_handshake_delay: Duration) -> MockUpstream {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = MockState {
        requests: Arc::new(Mutex::new(Vec::new())),
        ws_events: tx,
        ws_handshake_delay,
        release_stream: Arc::new(Notify::new()),
        stream_dropped: Arc::new(Notify::new()),
    };

    let app = Router::new()
        .route("/ws/{*rest}", get(mock_ws))
        .route("/status/{code}", any(mock_status))
        .route("/stream", get(mock_stream))
        .route("/broken", get(mock_broken))
        .fallback(mock_http)
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockUpstream {
        addr,
        requests: state.requests,
        ws_events: rx,
        release_stream: state.release_stream,
        stream_dropped: state.stream_dropped,
    }
}

fn record(state: &MockState, method: Method, uri: &Uri, headers: HeaderMap, body: Bytes) {
    state.requests.lock().unwrap().push(RecordedRequest {
        method,
        uri: uri.to_string(),
        headers,
        body,
    });
}

async fn mock_http(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    record(&state, method, &uri, headers, body);
    (
        [("content-type", "application/json"), ("x-upstream", "mock")],
        r#"{"ok":true}"#,
    )
        .into_response()
}

async fn mock_status(
    State(state): State<MockState>,
    Path(code): Path<u16>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    record(&state, method, &uri, headers, body);
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
    (status, format!("upstream said {code}")).into_response()
}

/// Notifies when dropped; travels inside a response body stream.
struct DropSignal(Arc<Notify>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

async fn mock_stream(State(state): State<MockState>) -> Response {
    let release = state.release_stream.clone();
    let signal = DropSignal(state.stream_dropped.clone());
    let chunks = futures_util::stream::unfold((0u8, signal), move |(step, signal)| {
        let release = release.clone();
        async move {
            match step {
                0 => Some((Ok::<_, std::io::Error>(Bytes::from_static(b"first")), (1, signal))),
                1 => {
                    release.notified().await;
                    Some((Ok(Bytes::from_static(b"second")), (2, signal)))
                }
                _ => None,
            }
        }
    });
    Response::new(Body::from_stream(chunks))
}

async fn mock_broken() -> Response {
    let chunks = futures_util::stream::unfold(0u8, |step| async move {
        match step {
            0 => Some((Ok(Bytes::from_static(b"partial")), 1)),
            1 => {
                // Let the first chunk reach the wire before failing.
                tokio::time::sleep(Duration::from_millis(50)).await;
                Some((Err(std::io::Error::other("upstream broke")), 2))
            }
            _ => None,
        }
    });
    Response::new(Body::from_stream(chunks))
}

async fn mock_ws(
    State(state): State<MockState>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    tokio::time::sleep(state.ws_handshake_delay).await;
    let events = state.ws_events.clone();
    ws.protocols(["chat.v1"])
        .on_upgrade(move |socket| mock_ws_session(socket, uri, events))
}

async fn mock_ws_session(mut socket: WebSocket, uri: Uri, events: mpsc::UnboundedSender<WsEvent>) {
    let _ = events.send(WsEvent::Connected {
        uri: uri.to_string(),
    });
    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Text(text)) if text.as_str() == "close-me" => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: 4000,
                        reason: "bye".into(),
                    })))
                    .await;
                return;
            }
            Ok(Message::Text(text)) => {
                let _ = events.send(WsEvent::Text(text.as_str().to_owned()));
                let _ = socket
                    .send(Message::Text(format!("echo:{}", text.as_str()).into()))
                    .await;
            }
            Ok(Message::Close(frame)) => {
                let _ = events.send(WsEvent::Closed(
                    frame.map(|f| (f.code, f.reason.as_str().to_owned())),
                ));
                return;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    let _ = events.send(WsEvent::Closed(None));
}

/// A running proxy.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<std::io::Result<()>>,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

/// Proxy config pointing at `upstream`, rate limiting off.
pub fn proxy_config(upstream: SocketAddr, credential: Option<&str>) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.upstream.http_base = format!("http://{upstream}");
    config.upstream.ws_base = format!("ws://{upstream}");
    config.credential = credential.map(Credential::new);
    config.rate_limit.enabled = false;
    config.timeouts.shutdown_grace_secs = 2;
    config.tunnel.connect_timeout_secs = 2;
    config
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config).unwrap();
    let shutdown = Shutdown::new();
    let handle = tokio::spawn(server.run(listener, shutdown.clone()));
    TestProxy {
        addr,
        shutdown,
        handle,
    }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
