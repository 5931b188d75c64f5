//! Header Filter: inbound headers → outbound upstream headers.
//!
//! Rules, in order:
//! 1. Drop transport and WebSocket handshake headers
//! 2. Inject the credential header
//! 3. Body methods keep their content-type, defaulting to `application/json`
//! 4. GET and DELETE lose any content-type
//! 5. A missing accept becomes `*/*`
//!
//! Every other header passes through untouched.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};

/// Headers never forwarded upstream.
const DENIED: [HeaderName; 8] = [
    header::HOST,
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
];

/// Hop-by-hop headers removed from upstream responses; hyper derives its own.
const RESPONSE_HOP_BY_HOP: [&str; 5] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Whether requests with this method carry a body upstream.
pub fn method_has_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

pub fn filter_request_headers(
    inbound: &HeaderMap,
    method: &Method,
    credential: (&HeaderName, &HeaderValue),
) -> HeaderMap {
    let mut outbound = HeaderMap::with_capacity(inbound.len() + 2);
    for (name, value) in inbound {
        if !DENIED.contains(name) {
            outbound.append(name.clone(), value.clone());
        }
    }

    let (credential_name, credential_value) = credential;
    let mut secret = credential_value.clone();
    secret.set_sensitive(true);
    outbound.insert(credential_name.clone(), secret);

    if method_has_body(method) {
        if !outbound.contains_key(header::CONTENT_TYPE) {
            outbound.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
    } else if matches!(*method, Method::GET | Method::DELETE) {
        outbound.remove(header::CONTENT_TYPE);
    }

    if !outbound.contains_key(header::ACCEPT) {
        outbound.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    }

    outbound
}

/// Remove hop-by-hop headers from a response about to be relayed.
pub fn strip_response_hop_by_hop(headers: &mut HeaderMap) {
    for name in RESPONSE_HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static("x-goog-api-key"),
            HeaderValue::from_static("secret"),
        )
    }

    fn filter(inbound: &HeaderMap, method: Method) -> HeaderMap {
        let (name, value) = credential();
        filter_request_headers(inbound, &method, (&name, &value))
    }

    #[test]
    fn transport_headers_dropped_others_kept() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        inbound.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("abc"));
        inbound.insert("x-custom", HeaderValue::from_static("1"));
        inbound.append("x-multi", HeaderValue::from_static("a"));
        inbound.append("x-multi", HeaderValue::from_static("b"));

        let out = filter(&inbound, Method::POST);
        assert!(!out.contains_key(header::HOST));
        assert!(!out.contains_key(header::CONNECTION));
        assert!(!out.contains_key(header::CONTENT_LENGTH));
        assert!(!out.contains_key(header::SEC_WEBSOCKET_KEY));
        assert_eq!(out["x-custom"], "1");
        assert_eq!(out.get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn credential_injected_and_sensitive() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-goog-api-key", HeaderValue::from_static("client-guess"));

        let out = filter(&inbound, Method::GET);
        let values: Vec<_> = out.get_all("x-goog-api-key").iter().collect();
        assert_eq!(values, vec![&HeaderValue::from_static("secret")]);
        assert!(values[0].is_sensitive());
    }

    #[test]
    fn body_methods_default_to_json() {
        for method in [Method::POST, Method::PUT, Method::PATCH] {
            let out = filter(&HeaderMap::new(), method);
            assert_eq!(out[header::CONTENT_TYPE], "application/json");
        }

        let mut inbound = HeaderMap::new();
        inbound.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert_eq!(filter(&inbound, Method::POST)[header::CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn get_and_delete_lose_content_type() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!filter(&inbound, Method::GET).contains_key(header::CONTENT_TYPE));
        assert!(!filter(&inbound, Method::DELETE).contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn accept_defaults_only_when_missing() {
        assert_eq!(filter(&HeaderMap::new(), Method::GET)[header::ACCEPT], "*/*");

        let mut inbound = HeaderMap::new();
        inbound.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        assert_eq!(filter(&inbound, Method::GET)[header::ACCEPT], "text/event-stream");
    }

    #[test]
    fn response_hop_by_hop_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        strip_response_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
    }
}
