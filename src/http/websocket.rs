//! WebSocket Tunnel Manager.
//!
//! # Responsibilities
//! - Gate upgrades: only paths under the proxy prefix, only with a credential
//! - Complete the client handshake without waiting for upstream
//! - Start the upstream connect and hand both sockets to a [`FrameRelay`]
//!
//! # Data Flow
//! ```text
//! Client ←──── WebSocket frames ────→ Proxy ←──── WebSocket frames ────→ Upstream
//!                                       │
//!                              FrameRelay task per tunnel
//! ```
//!
//! # Design Decisions
//! - Rejections happen before any handshake bytes: the server drops the transport
//! - The credential travels upstream as a query parameter, never to the client
//! - Ping/pong handled by each socket locally, not relayed

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        FromRequestParts,
    },
    http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures_util::{future, SinkExt, StreamExt};
use tracing::Instrument;
use url::Url;

use crate::config::{Credential, ProxyConfig};
use crate::error::{ProxyError, TunnelError, TunnelRejected};
use crate::http::request::strip_proxy_prefix;
use crate::observability::metrics;
use crate::tunnel::{
    upstream, CloseInfo, Frame, FrameRelay, FrameSink, FrameStream, Inbound, Outbound,
    QueueLimits, TunnelId, TunnelSession,
};

pub struct TunnelManager {
    ws_base: Url,
    prefix: String,
    credential_param: String,
    credential: Option<Credential>,
    limits: QueueLimits,
    connect_timeout: Duration,
    close_grace: Duration,
}

impl TunnelManager {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let ws_base = Url::parse(&config.upstream.ws_base)
            .map_err(|e| ProxyError::Setup(format!("invalid upstream ws_base: {e}")))?;

        Ok(Self {
            ws_base,
            prefix: config.upstream.path_prefix.clone(),
            credential_param: config.upstream.credential_query_param.clone(),
            credential: config.credential.clone(),
            limits: QueueLimits {
                max_frames: config.tunnel.max_pending_frames,
                max_bytes: config.tunnel.max_pending_bytes,
            },
            connect_timeout: config.tunnel.connect_timeout(),
            close_grace: config.tunnel.close_grace(),
        })
    }

    /// Path and credential checks, run on the raw connection before any
    /// handshake response is written.
    pub fn check_upgrade<B>(&self, request: &Request<B>) -> Result<(), TunnelRejected> {
        let path = request.uri().path();
        if strip_proxy_prefix(request.uri(), &self.prefix).is_none() {
            return Err(TunnelRejected::OutsidePrefix(path.to_string()));
        }
        if self.credential.is_none() {
            return Err(TunnelRejected::Disabled(path.to_string()));
        }
        Ok(())
    }

    /// Complete the client handshake and spawn the tunnel.
    pub async fn accept(self: Arc<Self>, request: Request<Body>) -> Response {
        if let Err(rejected) = self.check_upgrade(&request) {
            tracing::warn!(reason = %rejected, "WebSocket upgrade refused");
            return match rejected {
                TunnelRejected::Disabled(_) => ProxyError::Disabled.into_response(),
                TunnelRejected::OutsidePrefix(_) => StatusCode::NOT_FOUND.into_response(),
            };
        }
        let Some(credential) = self.credential.clone() else {
            return ProxyError::Disabled.into_response();
        };

        let (mut parts, _body) = request.into_parts();
        let uri = match strip_proxy_prefix(&parts.uri, &self.prefix)
            .map(|rest| upstream::upstream_ws_url(&self.ws_base, rest, &self.credential_param, &credential))
        {
            Some(Ok(uri)) => uri,
            Some(Err(e)) => return ProxyError::Setup(format!("invalid upstream uri: {e}")).into_response(),
            None => return StatusCode::NOT_FOUND.into_response(),
        };

        let protocol = parts.headers.get(SEC_WEBSOCKET_PROTOCOL).cloned();
        let first_protocol = protocol.as_ref().and_then(first_subprotocol);

        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => return rejection.into_response(),
        };

        upgrade
            .protocols(first_protocol)
            .on_failed_upgrade(|e| tracing::warn!(error = %e, "Client WebSocket upgrade failed"))
            .on_upgrade(move |socket| self.run_tunnel(socket, uri, protocol))
    }

    async fn run_tunnel(self: Arc<Self>, socket: WebSocket, uri: Uri, protocol: Option<HeaderValue>) {
        let id = TunnelId::new();
        let span = tracing::info_span!("tunnel", id = %id);

        async move {
            tracing::info!(upstream_path = uri.path(), "Tunnel opened");
            metrics::tunnel_opened();

            let session = TunnelSession::new(self.limits);
            let connector = Box::pin(upstream::connect(uri, protocol, self.connect_timeout));
            let summary =
                FrameRelay::run(session, client_transport(socket), connector, self.close_grace).await;

            metrics::tunnel_closed(&summary);
            tracing::info!(
                frames_to_upstream = summary.frames_to_upstream,
                frames_to_client = summary.frames_to_client,
                dropped_frames = summary.dropped_frames,
                residual_pending = summary.residual_pending,
                "Tunnel closed"
            );
        }
        .instrument(span)
        .await
    }
}

/// First entry of a comma-separated `Sec-WebSocket-Protocol` value.
fn first_subprotocol(value: &HeaderValue) -> Option<String> {
    value
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(str::to_owned)
}

/// Adapt the upgraded client socket to the relay's frame types.
fn client_transport(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (write, read) = socket.split();
    let sink = write
        .sink_map_err(|e| TunnelError::Client(e.to_string()))
        .with(|out: Outbound| future::ready(Ok::<_, TunnelError>(to_message(out))));
    let stream = read.filter_map(|item| future::ready(from_message(item)));
    (Box::pin(sink), Box::pin(stream))
}

fn to_message(out: Outbound) -> Message {
    match out {
        Outbound::Frame(Frame::Text(text)) => Message::Text(text.into()),
        Outbound::Frame(Frame::Binary(data)) => Message::Binary(data),
        Outbound::Close(info) => Message::Close(info.map(|info| CloseFrame {
            code: info.code,
            reason: info.reason.into(),
        })),
    }
}

fn from_message(item: Result<Message, axum::Error>) -> Option<Inbound> {
    match item {
        Ok(Message::Text(text)) => Some(Inbound::Frame(Frame::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(data)) => Some(Inbound::Frame(Frame::Binary(data))),
        Ok(Message::Close(frame)) => Some(Inbound::Close(
            frame.map(|f| CloseInfo::new(f.code, f.reason.as_str())),
        )),
        Ok(Message::Ping(_) | Message::Pong(_)) => None,
        Err(e) => Some(Inbound::Error(e.to_string())),
    }
}
