//! Error types for the HTTP relay and WebSocket tunnels.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures of the HTTP relay that happen before any response byte reaches the
/// client. Each one renders as a structured JSON error body.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No credential configured.
    #[error("Proxy disabled")]
    Disabled,

    /// DNS, connect, TLS or transport failure before response headers.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Upstream did not produce response headers in time.
    #[error("upstream did not respond in time")]
    UpstreamTimeout,

    /// The outbound request could not be built.
    #[error("proxy setup error: {0}")]
    Setup(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Setup(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code placed in the error body.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Disabled => "PROXY_NO_API_KEY",
            ProxyError::UpstreamUnreachable(_) => "PROXY_UPSTREAM_UNREACHABLE",
            ProxyError::UpstreamTimeout => "PROXY_UPSTREAM_TIMEOUT",
            ProxyError::Setup(_) => "PROXY_SETUP_ERROR",
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Disabled => "disabled",
            ProxyError::UpstreamUnreachable(_) => "unreachable",
            ProxyError::UpstreamTimeout => "timeout",
            ProxyError::Setup(_) => "setup",
        }
    }

    fn body(&self) -> ErrorBody {
        let (error, message) = match self {
            ProxyError::Disabled => (
                "Proxy disabled",
                "No upstream API key is configured. Set GEMINI_API_KEY (or API_KEY) in the \
                 environment to enable the proxy."
                    .to_string(),
            ),
            ProxyError::UpstreamUnreachable(detail) => ("Upstream unreachable", detail.clone()),
            ProxyError::UpstreamTimeout => (
                "Upstream timeout",
                "The upstream API did not respond in time.".to_string(),
            ),
            ProxyError::Setup(detail) => ("Proxy setup error", detail.clone()),
        };
        ErrorBody {
            error,
            message,
            code: self.code(),
        }
    }

    /// Classify a transport error from the upstream client. Connect, DNS and
    /// TLS failures all surface as connect errors; the cause is kept in the
    /// message.
    pub fn from_upstream(err: &hyper_util::client::legacy::Error) -> Self {
        let detail = match std::error::Error::source(err) {
            Some(cause) => format!("{err}: {cause}"),
            None => err.to_string(),
        };
        ProxyError::UpstreamUnreachable(detail)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    code: &'static str,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

/// Failures inside a WebSocket tunnel. These are logged, never shown to the
/// client: the client only ever sees a close code.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid upstream uri: {0}")]
    InvalidUri(#[from] tungstenite::http::uri::InvalidUri),

    #[error("upstream handshake timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("upstream handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),

    #[error("client socket error: {0}")]
    Client(String),

    #[error("upstream socket error: {0}")]
    Upstream(String),
}

/// Reasons an upgrade request is refused before any handshake happens.
///
/// Returned as the connection-level service error, which makes the server
/// drop the transport without writing a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelRejected {
    #[error("websocket upgrade for {0} is outside the proxy prefix")]
    OutsidePrefix(String),

    #[error("websocket upgrade for {0} refused: proxy disabled")]
    Disabled(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn disabled_renders_fixed_code() {
        let response = ProxyError::Disabled.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Proxy disabled");
        assert_eq!(json["code"], "PROXY_NO_API_KEY");
        assert!(json["message"].as_str().unwrap().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(
            ProxyError::UpstreamUnreachable("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ProxyError::UpstreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyError::Setup("bad".into()).code(), "PROXY_SETUP_ERROR");
    }
}
