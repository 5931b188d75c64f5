//! HTTP server setup and the connection accept loop.
//!
//! # Responsibilities
//! - Create the Axum Router with the proxy handlers
//! - Wire up middleware (admission, body limit, request ID, tracing)
//! - Serve HTTP/1.1 and HTTP/2 with upgrades on every accepted connection
//! - Refuse out-of-scope WebSocket upgrades before any handshake
//! - Drain connections on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware,
    response::Response,
    routing::any,
    Router,
};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tower::ServiceExt;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, TunnelRejected};
use crate::http::relay::HttpRelay;
use crate::http::request::{is_websocket_upgrade, request_id, ProxyRequestId, X_REQUEST_ID};
use crate::http::websocket::TunnelManager;
use crate::lifecycle::Shutdown;
use crate::net::{ConnectionGuard, ConnectionTracker, Listener, ListenerError};
use crate::net::listener::ConnectionPermit;
use crate::security::{admission_middleware, AdmissionState};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<HttpRelay>,
    pub tunnels: Arc<TunnelManager>,
}

/// HTTP server for the credential-hiding proxy.
pub struct HttpServer {
    router: Router,
    tunnels: Arc<TunnelManager>,
    admission: AdmissionState,
    tracker: ConnectionTracker,
    config: ProxyConfig,
}

impl HttpServer {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let relay = Arc::new(HttpRelay::new(&config)?);
        let tunnels = Arc::new(TunnelManager::new(&config)?);
        let admission = AdmissionState::from_config(&config.rate_limit);

        if !relay.is_enabled() {
            tracing::warn!(
                "No upstream credential configured; proxy routes will answer 503 \
                 and WebSocket upgrades will be refused"
            );
        }

        let state = AppState {
            relay,
            tunnels: Arc::clone(&tunnels),
        };
        let router = Self::build_router(&config, state, admission.clone());

        Ok(Self {
            router,
            tunnels,
            admission,
            tracker: ConnectionTracker::new(),
            config,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &ProxyConfig, state: AppState, admission: AdmissionState) -> Router {
        let prefix = &config.upstream.path_prefix;

        Router::new()
            .route(&format!("{prefix}/"), any(proxy_handler))
            .route(&format!("{prefix}/{{*path}}"), any(proxy_handler))
            .route_layer(middleware::from_fn_with_state(admission, admission_middleware))
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(config.security.max_body_bytes))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id(request.headers()),
                    )
                }),
            )
            .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
            .layer(SetRequestIdLayer::new(X_REQUEST_ID, ProxyRequestId))
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(self, listener: Listener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            prefix = %self.config.upstream.path_prefix,
            "HTTP server starting"
        );

        let sweeper = self
            .admission
            .spawn_sweeper(self.config.rate_limit.window(), shutdown.subscribe());
        let mut stop = shutdown.subscribe();

        while !shutdown.is_triggered() {
            let accepted = tokio::select! {
                _ = stop.recv() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer, permit) = match accepted {
                Ok(connection) => connection,
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let guard = self.tracker.track();
            tokio::spawn(serve_connection(
                stream,
                peer,
                self.router.clone(),
                Arc::clone(&self.tunnels),
                shutdown.subscribe(),
                permit,
                guard,
            ));
        }

        drop(listener);
        tracing::info!(
            active_connections = self.tracker.active_count(),
            "Stopped accepting, draining connections"
        );

        let grace = self.config.timeouts.shutdown_grace();
        if !self.tracker.wait_idle(grace).await {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                grace_secs = grace.as_secs(),
                "Shutdown grace period elapsed with connections still open"
            );
        }
        sweeper.abort();

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Serve one connection. Upgrade requests outside the tunnel gate fail the
/// service, which makes hyper drop the connection without a response.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    tunnels: Arc<TunnelManager>,
    mut shutdown: broadcast::Receiver<()>,
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
) {
    let connection_id = guard.id();

    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        let router = router.clone();
        let tunnels = Arc::clone(&tunnels);
        async move {
            if is_websocket_upgrade(&request) {
                if let Err(rejected) = tunnels.check_upgrade(&request) {
                    tracing::warn!(
                        connection_id = %connection_id,
                        peer_addr = %peer,
                        reason = %rejected,
                        "Dropping WebSocket upgrade"
                    );
                    return Err::<Response, TunnelRejected>(rejected);
                }
            }
            request.extensions_mut().insert(ConnectInfo(peer));
            router
                .oneshot(request.map(Body::new))
                .await
                .map_err(|never| match never {})
        }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let finished = tokio::select! {
        result = connection.as_mut() => Some(result),
        _ = shutdown.recv() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::debug!(connection_id = %connection_id, "Graceful shutdown of connection");
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        tracing::debug!(connection_id = %connection_id, error = %e, "Connection ended with error");
    }
    drop(guard);
}

/// Proxy handler: WebSocket upgrades go to the tunnel manager, everything
/// else to the HTTP relay.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    if is_websocket_upgrade(&request) {
        return Arc::clone(&state.tunnels).accept(request).await;
    }
    state.relay.handle(request).await
}
