//! Request inspection helpers.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) for tracing
//! - Detect WebSocket upgrade requests
//! - Strip the proxy prefix while keeping the raw path and query
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Path and query are never decoded or re-encoded on their way upstream

use axum::http::{header, HeaderName, HeaderMap, Method, Request, Uri};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Makes a fresh UUID v4 for requests that arrive without an `x-request-id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyRequestId;

impl MakeRequestId for ProxyRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        Uuid::new_v4().to_string().parse().ok().map(RequestId::new)
    }
}

/// Request ID set by the request-id layer, for log fields.
pub fn request_id(headers: &HeaderMap) -> &str {
    headers
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}

/// Whether the request asks for an HTTP/1.1 WebSocket upgrade.
pub fn is_websocket_upgrade<B>(request: &Request<B>) -> bool {
    let headers = request.headers();
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    request.method() == Method::GET && upgrade && connection
}

/// The raw path and query left after removing `prefix`, starting with `/`.
///
/// Returns `None` when the path is not strictly under `prefix/`. The result is
/// exactly what the client sent: no decoding, no normalization.
pub fn strip_proxy_prefix<'a>(uri: &'a Uri, prefix: &str) -> Option<&'a str> {
    let raw = uri.path_and_query()?.as_str();
    let rest = raw.strip_prefix(prefix)?;
    rest.starts_with('/').then_some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_keeps_query_verbatim() {
        let uri: Uri = "/api-proxy/v1beta/models:generate?alt=sse&x=%2F".parse().unwrap();
        assert_eq!(
            strip_proxy_prefix(&uri, "/api-proxy"),
            Some("/v1beta/models:generate?alt=sse&x=%2F")
        );
    }

    #[test]
    fn strip_requires_segment_boundary() {
        let outside: Uri = "/api-proxyish/v1".parse().unwrap();
        assert_eq!(strip_proxy_prefix(&outside, "/api-proxy"), None);

        let bare: Uri = "/api-proxy".parse().unwrap();
        assert_eq!(strip_proxy_prefix(&bare, "/api-proxy"), None);

        let root: Uri = "/api-proxy/".parse().unwrap();
        assert_eq!(strip_proxy_prefix(&root, "/api-proxy"), Some("/"));
    }

    #[test]
    fn detects_websocket_upgrade() {
        let request = Request::builder()
            .uri("/api-proxy/ws")
            .header(header::UPGRADE, "WebSocket")
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&request));

        let plain = Request::builder().uri("/api-proxy/ws").body(()).unwrap();
        assert!(!is_websocket_upgrade(&plain));
    }

    #[test]
    fn request_ids_are_uuids() {
        let request = Request::new(());
        let id = ProxyRequestId.make_request_id(&request).unwrap();
        let value = id.header_value().to_str().unwrap();
        assert!(Uuid::parse_str(value).is_ok());
    }
}
