//! HTTP Relay: forwards one proxied request upstream and streams the answer.
//!
//! # Responsibilities
//! - Short-circuit when no credential is configured (503, no network call)
//! - Answer CORS preflight locally
//! - Forward method, raw path and query, filtered headers and body
//! - Stream the upstream response back with its status and headers
//!
//! # Design Decisions
//! - Any upstream status is a valid response; only transport failures are errors
//! - Errors before response headers become structured JSON responses
//! - Errors mid-body abort the client stream; the status is already committed
//! - Redirects are relayed, never followed
//! - The upstream target is a raw [`Uri`], never parsed as a URL

use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request, Uri},
    response::{IntoResponse, Response},
};
use futures_util::TryStreamExt;
use hyper_tls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::headers::{filter_request_headers, method_has_body, strip_response_hop_by_hop};
use crate::http::request::{request_id, strip_proxy_prefix};
use crate::http::response::cors_preflight;
use crate::observability::metrics;

pub struct HttpRelay {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    http_base: String,
    prefix: String,
    credential_header: HeaderName,
    /// `None` when the proxy runs disabled.
    credential: Option<HeaderValue>,
    response_timeout: Option<Duration>,
}

impl HttpRelay {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.timeouts.connect()));
        let client = Client::builder(TokioExecutor::new()).build(HttpsConnector::new_with_connector(http));

        let credential_header = HeaderName::from_bytes(config.upstream.credential_header.as_bytes())
            .map_err(|e| ProxyError::Setup(e.to_string()))?;
        let credential = config
            .credential
            .as_ref()
            .map(|c| HeaderValue::from_str(c.expose()))
            .transpose()
            .map_err(|e| ProxyError::Setup(e.to_string()))?;

        Ok(Self {
            client,
            http_base: config.upstream.http_base.trim_end_matches('/').to_string(),
            prefix: config.upstream.path_prefix.clone(),
            credential_header,
            credential,
            response_timeout: config.timeouts.response(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.credential.is_some()
    }

    /// Relay one request. Never fails: errors are rendered as responses.
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let start = Instant::now();
        let method = request.method().clone();

        let Some(credential) = self.credential.as_ref() else {
            metrics::record_request(method.as_str(), ProxyError::Disabled.status().as_u16(), start);
            return ProxyError::Disabled.into_response();
        };

        if method == Method::OPTIONS {
            return cors_preflight(&self.credential_header);
        }

        let request_id = request_id(request.headers()).to_owned();
        match self.forward(request, credential).await {
            Ok(response) => {
                metrics::record_request(method.as_str(), response.status().as_u16(), start);
                response
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %request_id,
                    method = %method,
                    error = %err,
                    "Upstream request failed"
                );
                metrics::record_upstream_error(err.kind());
                metrics::record_request(method.as_str(), err.status().as_u16(), start);
                err.into_response()
            }
        }
    }

    async fn forward(
        &self,
        request: Request<Body>,
        credential: &HeaderValue,
    ) -> Result<Response, ProxyError> {
        let rest = strip_proxy_prefix(request.uri(), &self.prefix)
            .ok_or_else(|| ProxyError::Setup(format!("{} is outside the proxy prefix", request.uri().path())))?;
        // Raw bytes end to end: no dot-segment removal, no query re-encoding.
        let uri = Uri::try_from(format!("{}{}", self.http_base, rest))
            .map_err(|e| ProxyError::Setup(format!("invalid upstream uri: {e}")))?;
        let method = request.method().clone();
        let headers =
            filter_request_headers(request.headers(), &method, (&self.credential_header, credential));
        let request_id = request_id(request.headers()).to_owned();

        tracing::debug!(
            request_id = %request_id,
            method = %method,
            path = %rest,
            "Forwarding request upstream"
        );

        let body = if method_has_body(&method) {
            request.into_body()
        } else {
            Body::empty()
        };
        let mut outbound = Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .map_err(|e| ProxyError::Setup(e.to_string()))?;
        *outbound.headers_mut() = headers;

        let pending = self.client.request(outbound);
        let upstream = match self.response_timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| ProxyError::UpstreamTimeout)?,
            None => pending.await,
        }
        .map_err(|e| ProxyError::from_upstream(&e))?;

        let (mut parts, incoming) = upstream.into_parts();
        strip_response_hop_by_hop(&mut parts.headers);

        let body = Body::new(incoming).into_data_stream().inspect_err(move |e| {
            tracing::warn!(
                request_id = %request_id,
                error = %e,
                "Upstream response stream failed, aborting client response"
            );
        });

        Ok(Response::from_parts(parts, Body::from_stream(body)))
    }
}
